//! Error types for protocol operations

use crate::message::{ErrorCode, ErrorDetails};
use std::io;
use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A line on the wire was not valid JSON
    #[error("Parse error: {0}")]
    Parse(String),

    /// Valid JSON that is not a protocol message
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Message too large
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Bytes buffered without a delimiter
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Underlying stream failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Stream closed
    #[error("Stream closed")]
    Closed,
}

impl ProtocolError {
    /// Whether the stream can keep being read after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Parse(_) | Self::InvalidMessage(_) | Self::MessageTooLarge { .. }
        )
    }
}

impl From<ProtocolError> for ErrorDetails {
    fn from(error: ProtocolError) -> Self {
        match error {
            ProtocolError::Parse(msg) => ErrorDetails::new(ErrorCode::ParseError, msg),
            ProtocolError::InvalidMessage(msg) => ErrorDetails::new(ErrorCode::InvalidRequest, msg),
            ProtocolError::MessageTooLarge { size, max } => ErrorDetails::new(
                ErrorCode::ParseError,
                format!("Message too large: {} bytes (max: {})", size, max),
            ),
            ProtocolError::Serialization(msg) => ErrorDetails::new(ErrorCode::InternalError, msg),
            ProtocolError::Io(e) => ErrorDetails::new(ErrorCode::Io, e.to_string()),
            ProtocolError::Closed => ErrorDetails::new(ErrorCode::Closed, "Stream closed"),
        }
    }
}
