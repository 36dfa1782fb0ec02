//! # Tether
//!
//! Client for a remote relay: bootstraps it over SSH, connects directly or
//! through an SSH tunnel, and exposes filesystem access and interactive
//! terminal sessions over one multiplexed connection.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use tether_proto as proto;
pub use tether_ssh as ssh;

/// Error types for the Tether client
pub mod error;

/// Request correlation and connection tasks
pub mod router;

/// Terminal session proxy
pub mod terminal;

/// Connection setup and remote operations
pub mod connection;

pub use connection::{ClientConfig, Connection, ConnectionBuilder};
pub use error::TetherError;
pub use router::{PendingTable, Router};
pub use terminal::{ReadyInfo, SessionPhase, TerminalEvent, TerminalEvents, TerminalSession};
pub use tether_ssh::ChannelKind;

/// Result type alias for Tether operations
pub type Result<T> = std::result::Result<T, TetherError>;
