//! Error types for the Tether client

use std::time::Duration;
use tether_proto::{ErrorCode, ErrorDetails, ProtocolError};
use tether_ssh::TransportError;
use thiserror::Error;

/// Main error type for Tether operations
#[derive(Debug, Error)]
pub enum TetherError {
    /// Bootstrap, negotiation or SSH failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Wire-level failure on the relay connection
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Typed error returned by the relay
    #[error("Remote error [{code}]: {message}")]
    Remote {
        /// Error code from the wire
        code: ErrorCode,
        /// Relay's message
        message: String,
    },

    /// No response within the request window
    #[error("Timeout after {duration:?}")]
    Timeout {
        /// Duration that was exceeded
        duration: Duration,
    },

    /// The connection is closed
    #[error("Connection closed")]
    Closed,

    /// The relay did not open the connection with a greeting
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Session errors
    #[error("Session error: {0}")]
    Session(String),

    /// Invalid client configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TetherError {
    /// Wire error code of a remote error
    pub fn code(&self) -> Option<&ErrorCode> {
        match self {
            Self::Remote { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Whether the relay reported a missing path
    pub fn is_not_found(&self) -> bool {
        self.code() == Some(&ErrorCode::NotFound)
    }

    /// Whether the relay reported an access failure
    pub fn is_permission_denied(&self) -> bool {
        self.code() == Some(&ErrorCode::PermissionDenied)
    }
}

impl From<ErrorDetails> for TetherError {
    fn from(details: ErrorDetails) -> Self {
        match details.code {
            ErrorCode::Closed => Self::Closed,
            code => Self::Remote {
                code,
                message: details.message,
            },
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {}", err))
    }
}
