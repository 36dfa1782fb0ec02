//! Line-delimited JSON codec for async streams

use crate::{Message, ProtocolError};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum encoded message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const DELIMITER: u8 = b'\n';

/// Message codec for encoding/decoding messages over async streams.
///
/// Each message is one JSON object followed by `\n`. JSON string escaping
/// guarantees the delimiter never occurs inside an encoded message.
pub struct MessageCodec {
    /// Read buffer for incoming data
    read_buf: BytesMut,
    /// Maximum message size allowed
    max_message_size: usize,
    /// Dropping bytes of an oversized line until the next delimiter
    discarding: bool,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    /// Create a new codec with default settings
    pub fn new() -> Self {
        Self::with_max_message_size(MAX_MESSAGE_SIZE)
    }

    /// Create a new codec with custom max message size
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_message_size,
            discarding: false,
        }
    }

    /// Encode a message to bytes with trailing delimiter
    pub fn encode_message(&self, message: &Message) -> Result<Bytes, ProtocolError> {
        let json = serde_json::to_vec(message)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;

        if json.len() > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: json.len(),
                max: self.max_message_size,
            });
        }

        let mut buf = BytesMut::with_capacity(json.len() + 1);
        buf.put_slice(&json);
        buf.put_u8(DELIMITER);
        Ok(buf.freeze())
    }

    /// Write a message to an async writer
    pub async fn write_message<W>(&self, writer: &mut W, message: &Message) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = self.encode_message(message)?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read a message from an async reader.
    ///
    /// Returns `Ok(None)` on clean EOF. Recoverable errors (see
    /// [`ProtocolError::is_recoverable`]) consume the offending line, so the
    /// caller may keep reading.
    pub async fn read_message<R>(&mut self, reader: &mut R) -> Result<Option<Message>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(message) = self.try_decode_message()? {
                return Ok(Some(message));
            }

            let mut temp_buf = [0u8; 8192];
            let n = reader.read(&mut temp_buf).await?;

            if n == 0 {
                if self.read_buf.iter().all(u8::is_ascii_whitespace) {
                    self.read_buf.clear();
                    return Ok(None);
                }
                // Trailing message without delimiter
                let line = self.read_buf.split();
                return Self::parse_line(&line).map(Some);
            }

            self.read_buf.extend_from_slice(&temp_buf[..n]);
        }
    }

    /// Try to decode a message from the internal buffer
    pub fn try_decode_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        loop {
            let Some(pos) = self.read_buf.iter().position(|b| *b == DELIMITER) else {
                if self.read_buf.len() > self.max_message_size {
                    let size = self.read_buf.len();
                    self.read_buf.clear();
                    self.discarding = true;
                    return Err(ProtocolError::MessageTooLarge {
                        size,
                        max: self.max_message_size,
                    });
                }
                if self.discarding {
                    self.read_buf.clear();
                }
                return Ok(None);
            };

            let line = self.read_buf.split_to(pos + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }

            let body = &line[..pos];
            if body.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Self::parse_line(body).map(Some);
        }
    }

    fn parse_line(line: &[u8]) -> Result<Message, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_slice(line).map_err(|e| ProtocolError::Parse(e.to_string()))?;
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
    }

    /// Get the current buffer size
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }

    /// Clear the internal buffer
    pub fn clear_buffer(&mut self) {
        self.read_buf.clear();
        self.discarding = false;
    }
}
