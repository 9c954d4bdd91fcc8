//! # Error Definitions
//!
//! Codec failures, the wire error payload, and remote-error reconstruction.
//!
//! These are distinct layers: `Error` is the *local* codec failing to make
//! sense of a wire string, `ErrorObject` is the payload a server attaches to
//! an error reply, and `RemoteError` is what a caller observes when the far
//! side rejected its request.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Error code carried by a reply to a request naming an unexposed method.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Operational failures within the codec itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The wire string was not valid JSON.
    Parse(String),
    /// The top-level JSON value was null.
    NullMessage,
    /// The top-level JSON value was not an object.
    NotAnObject,
    /// The object did not classify as a request, response, or notification.
    InvalidEnvelope(String),
    /// Params were neither an array nor an object.
    InvalidParams,
    /// Serialization of an outbound envelope failed.
    Serialize(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "Parse error: {}", msg),
            Self::NullMessage => write!(f, "Message cannot be null"),
            Self::NotAnObject => write!(f, "Message must be a JSON object"),
            Self::InvalidEnvelope(msg) => write!(f, "Invalid message: {}", msg),
            Self::InvalidParams => write!(f, "Params must be structured data"),
            Self::Serialize(msg) => write!(f, "Serialize error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// The error payload of a response envelope.
///
/// Only `message` is always present on the wire; `code`, `data`, and `stack`
/// are forwarded when the failing side had them. The stack is carried so the
/// calling side can reconstruct it for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorObject {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            data: None,
            stack: None,
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Standard reply payload for a request naming a method with no handler.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(format!("Method not found: {}", method)).with_code(METHOD_NOT_FOUND)
    }
}

/// A remote failure rebuilt on the calling side.
///
/// Construction starts from the placeholder message `"Remote error"` and
/// copies the wire object's fields over it, so a caller reading the message
/// sees the remote message whenever one was sent.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    message: String,
    code: Option<i64>,
    data: Option<Value>,
    stack: Option<String>,
}

impl RemoteError {
    pub fn from_object(object: ErrorObject) -> Self {
        let mut error = Self {
            message: "Remote error".to_string(),
            code: None,
            data: None,
            stack: None,
        };
        if !object.message.is_empty() {
            error.message = object.message;
        }
        error.code = object.code;
        error.data = object.data;
        error.stack = object.stack;
        error
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<i64> {
        self.code
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RemoteError {}

impl From<ErrorObject> for RemoteError {
    fn from(object: ErrorObject) -> Self {
        Self::from_object(object)
    }
}
