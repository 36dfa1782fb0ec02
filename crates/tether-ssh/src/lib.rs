//! # Tether SSH
//!
//! Secure-shell plumbing for the client: remote commands, artifact upload,
//! tunnels, relay bootstrap and transport negotiation.

#![warn(missing_docs)]

/// Remote shell abstraction and implementations
pub mod transport;

/// Byte streams over SSH subprocesses
pub mod connection;

/// Relay bootstrap logic
pub mod bootstrap;

/// Direct-or-tunnel transport selection
pub mod negotiate;

/// SSH-specific error types
pub mod error;

pub use bootstrap::{Bootstrap, BootstrapConfig, BootstrapOutcome, PlatformInfo, RemoteDeploymentState};
pub use connection::{ByteStream, TunnelStream};
pub use error::{Diagnostics, TransportError};
pub use negotiate::{negotiate, Channel, ChannelKind, Dialer, NegotiateConfig, TcpDialer};
pub use transport::{
    shell_quote, CommandOutput, ConnectionInfo, LocalShell, RemoteShell, SshConfig, SshTransport, TransportType,
};
