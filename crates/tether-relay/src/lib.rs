//! # Tether Relay
//!
//! The always-on remote process: terminates the wire protocol, serves
//! filesystem requests and owns interactive sessions per connection.

#![warn(missing_docs)]

/// Relay configuration
pub mod config;

/// Capability detection and diagnostics snapshots
pub mod system;

/// Incremental UTF-8 decoding of process output
pub mod utf8;

/// Process backends (pseudo-terminal and piped child)
pub mod backend;

/// Per-connection session table
pub mod registry;

/// Single-shot request handlers
pub mod handlers;

/// Connection loop and TCP server
pub mod server;

/// Liveness probe
pub mod probe;

pub use config::RelayConfig;
pub use probe::probe;
pub use registry::SessionRegistry;
pub use server::{ConnectionLoop, RelayServer};
pub use system::RelayInfo;
