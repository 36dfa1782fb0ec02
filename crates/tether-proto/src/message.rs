//! Message envelope, correlation ids and error payloads

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Protocol version tag carried by every message
pub const PROTOCOL_VERSION: &str = "2.0";

/// Reserved id of the one-time greeting the relay sends on connection open
pub const GREETING_ID: &str = "greeting";

/// Correlation id of a message.
///
/// Integers are used for single-shot requests and strings for session keys,
/// so the two spaces never collide. `null` ids are modelled as `None` on
/// [`Message::id`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    /// Numeric id
    Number(i64),
    /// String id
    String(String),
}

impl MessageId {
    /// The reserved greeting id
    pub fn greeting() -> Self {
        Self::String(GREETING_ID.to_string())
    }

    /// Whether this is the reserved greeting id
    pub fn is_greeting(&self) -> bool {
        matches!(self, Self::String(s) if s == GREETING_ID)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for MessageId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Flat message envelope shared by requests, notifications and responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Protocol version tag
    pub version: String,
    /// Method name (requests and notifications only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Method parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Successful result (responses only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload (responses only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    /// Correlation id; `None` encodes as `null`
    #[serde(default)]
    pub id: Option<MessageId>,
}

/// Coarse classification of a decoded message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Method call expecting a response
    Request,
    /// Method call with a `null` id
    Notification,
    /// Result or error
    Response,
}

impl Message {
    fn empty(id: Option<MessageId>) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            method: None,
            params: None,
            result: None,
            error: None,
            id,
        }
    }

    /// Create a request message
    pub fn request(id: impl Into<MessageId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            method: Some(method.into()),
            params: Some(params),
            ..Self::empty(Some(id.into()))
        }
    }

    /// Create a fire-and-forget notification
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: Some(method.into()),
            params: Some(params),
            ..Self::empty(None)
        }
    }

    /// Create a successful response
    pub fn response(id: Option<MessageId>, result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::empty(id)
        }
    }

    /// Create an error response
    pub fn error(id: Option<MessageId>, error: ErrorDetails) -> Self {
        Self {
            error: Some(error),
            ..Self::empty(id)
        }
    }

    /// Classify the message
    pub fn kind(&self) -> MessageKind {
        match (&self.method, &self.id) {
            (Some(_), Some(_)) => MessageKind::Request,
            (Some(_), None) => MessageKind::Notification,
            (None, _) => MessageKind::Response,
        }
    }

    /// Whether this message carries the reserved greeting id
    pub fn is_greeting(&self) -> bool {
        self.id.as_ref().is_some_and(MessageId::is_greeting)
    }

    /// Split a response into its result or error
    pub fn into_result(self) -> Result<Value, ErrorDetails> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Error codes surfaced in `error.code`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawCode", into = "RawCode")]
pub enum ErrorCode {
    /// Malformed frame
    ParseError,
    /// Well-formed JSON that is not a valid message
    InvalidRequest,
    /// Unknown method
    MethodNotFound,
    /// Parameters do not match the method
    InvalidParams,
    /// Unexpected relay failure
    InternalError,
    /// Path does not exist
    NotFound,
    /// Access denied by the remote filesystem
    PermissionDenied,
    /// Any other I/O failure
    Io,
    /// Neither backend variant could start a session
    SessionCreate,
    /// Operation exceeded its time budget
    Timeout,
    /// The connection closed before a response arrived
    Closed,
    /// Numeric code not known to this build
    OtherNumber(i64),
    /// Textual code not known to this build
    OtherText(String),
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawCode {
    Number(i64),
    Text(String),
}

impl From<RawCode> for ErrorCode {
    fn from(raw: RawCode) -> Self {
        match raw {
            RawCode::Number(-32700) => Self::ParseError,
            RawCode::Number(-32600) => Self::InvalidRequest,
            RawCode::Number(-32601) => Self::MethodNotFound,
            RawCode::Number(-32602) => Self::InvalidParams,
            RawCode::Number(-32603) => Self::InternalError,
            RawCode::Number(n) => Self::OtherNumber(n),
            RawCode::Text(text) => match text.as_str() {
                "ENOENT" => Self::NotFound,
                "EACCES" => Self::PermissionDenied,
                "EIO" => Self::Io,
                "ESPAWN" => Self::SessionCreate,
                "ETIMEDOUT" => Self::Timeout,
                "ECLOSED" => Self::Closed,
                _ => Self::OtherText(text),
            },
        }
    }
}

impl From<ErrorCode> for RawCode {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::ParseError => RawCode::Number(-32700),
            ErrorCode::InvalidRequest => RawCode::Number(-32600),
            ErrorCode::MethodNotFound => RawCode::Number(-32601),
            ErrorCode::InvalidParams => RawCode::Number(-32602),
            ErrorCode::InternalError => RawCode::Number(-32603),
            ErrorCode::NotFound => RawCode::Text("ENOENT".to_string()),
            ErrorCode::PermissionDenied => RawCode::Text("EACCES".to_string()),
            ErrorCode::Io => RawCode::Text("EIO".to_string()),
            ErrorCode::SessionCreate => RawCode::Text("ESPAWN".to_string()),
            ErrorCode::Timeout => RawCode::Text("ETIMEDOUT".to_string()),
            ErrorCode::Closed => RawCode::Text("ECLOSED".to_string()),
            ErrorCode::OtherNumber(n) => RawCode::Number(n),
            ErrorCode::OtherText(text) => RawCode::Text(text),
        }
    }
}

impl ErrorCode {
    /// Map an I/O error kind onto the filesystem codes
    pub fn from_io_kind(kind: std::io::ErrorKind) -> Self {
        match kind {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Io,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match RawCode::from(self.clone()) {
            RawCode::Number(n) => write!(f, "{}", n),
            RawCode::Text(text) => f.write_str(&text),
        }
    }
}

/// Error payload of an error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Additional context data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorDetails {
    /// Create new error details
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Build filesystem error details from an I/O error
    pub fn from_io(error: &std::io::Error, path: &str) -> Self {
        Self::new(ErrorCode::from_io_kind(error.kind()), format!("{}: {}", path, error))
            .with_context("path", path)
    }

    /// Add a context entry to `data`
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let data = self.data.get_or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = data {
            map.insert(key.into(), value.into());
        }
        self
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_shape() {
        let msg = Message::request(7, "fs.stat", json!({"path": "/tmp"}));
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["version"], "2.0");
        assert_eq!(value["method"], "fs.stat");
        assert_eq!(value["id"], 7);
        assert!(value.get("result").is_none());
        assert_eq!(msg.kind(), MessageKind::Request);
    }

    #[test]
    fn test_notification_has_null_id() {
        let msg = Message::notification("terminal.input", json!({"sessionId": "term-1", "data": "ls\n"}));
        let value = serde_json::to_value(&msg).unwrap();

        assert!(value["id"].is_null());
        assert_eq!(msg.kind(), MessageKind::Notification);
    }

    #[test]
    fn test_missing_id_decodes_as_null() {
        let msg: Message = serde_json::from_str(r#"{"version":"2.0","method":"system.info"}"#).unwrap();
        assert_eq!(msg.id, None);
        assert_eq!(msg.kind(), MessageKind::Notification);
    }

    #[test]
    fn test_id_variants() {
        let numeric: MessageId = serde_json::from_str("42").unwrap();
        let text: MessageId = serde_json::from_str(r#""term-3""#).unwrap();

        assert_eq!(numeric, MessageId::Number(42));
        assert_eq!(text, MessageId::String("term-3".to_string()));
        assert_ne!(MessageId::from("1"), MessageId::from(1));
    }

    #[test]
    fn test_greeting_id() {
        let msg = Message::response(Some(MessageId::greeting()), json!({"type": "greeting"}));
        assert!(msg.is_greeting());
        assert!(!Message::response(Some(MessageId::from(1)), Value::Null).is_greeting());
    }

    #[test]
    fn test_error_codes_wire_form() {
        let parse = serde_json::to_value(ErrorCode::ParseError).unwrap();
        let missing = serde_json::to_value(ErrorCode::NotFound).unwrap();
        let denied = serde_json::to_value(ErrorCode::PermissionDenied).unwrap();

        assert_eq!(parse, json!(-32700));
        assert_eq!(missing, json!("ENOENT"));
        assert_eq!(denied, json!("EACCES"));

        let unknown: ErrorCode = serde_json::from_value(json!("EWHATEVER")).unwrap();
        assert_eq!(unknown, ErrorCode::OtherText("EWHATEVER".to_string()));
        let method: ErrorCode = serde_json::from_value(json!(-32601)).unwrap();
        assert_eq!(method, ErrorCode::MethodNotFound);
    }

    #[test]
    fn test_io_error_mapping() {
        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        let other = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");

        assert_eq!(ErrorDetails::from_io(&missing, "/a").code, ErrorCode::NotFound);
        assert_eq!(ErrorDetails::from_io(&denied, "/a").code, ErrorCode::PermissionDenied);
        assert_eq!(ErrorDetails::from_io(&other, "/a").code, ErrorCode::Io);
    }

    #[test]
    fn test_error_details_with_context() {
        let error = ErrorDetails::new(ErrorCode::Io, "write failed")
            .with_context("path", "/etc/passwd")
            .with_context("attempt", 1);

        let data = error.data.unwrap();
        assert_eq!(data["path"], "/etc/passwd");
        assert_eq!(data["attempt"], 1);
    }

    #[test]
    fn test_into_result() {
        let ok = Message::response(Some(MessageId::from(1)), json!({"content": "x"}));
        assert_eq!(ok.into_result().unwrap()["content"], "x");

        let err = Message::error(Some(MessageId::from(1)), ErrorDetails::new(ErrorCode::NotFound, "gone"));
        assert_eq!(err.into_result().unwrap_err().code, ErrorCode::NotFound);
    }
}
