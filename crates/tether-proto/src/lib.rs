//! # Tether Protocol
//!
//! Message envelope, method table, typed payloads and the line-delimited
//! JSON codec shared by the relay and the client.

#![warn(missing_docs)]

/// Message envelope, ids and error payloads
pub mod message;

/// Method table and typed parameters/results
pub mod methods;

/// Message codec for async streams
pub mod codec;

/// Error types for protocol operations
pub mod error;

/// Port the relay listens on unless configured otherwise
pub const DEFAULT_RELAY_PORT: u16 = 7979;

pub use codec::MessageCodec;
pub use error::ProtocolError;
pub use message::{ErrorCode, ErrorDetails, Message, MessageId, MessageKind, PROTOCOL_VERSION};
pub use methods::{
    BackendKind, CreateSessionParams, DirEntry, EntryKind, ExecOutput, ExecParams, FileContent, FileStat,
    Greeting, InputParams, KillParams, Method, PathParams, ResizeParams, SessionEvent, SystemInfo,
    WriteFileParams,
};
