//! # Message Envelopes
//!
//! Defines the three JSON-RPC envelope shapes and the duck-typed
//! classification of incoming messages.
//!
//! ## Invariants
//! - All decoding paths return `Result`, never panicking on unknown data.
//! - Unknown fields (including a `jsonrpc` version tag) are ignored; the
//!   tag is not emitted either.
//! - Classification is by field presence: `id` + `method` is a request,
//!   `id` alone is a response, `method` alone is a notification.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::error::Error;
use crate::error::ErrorObject;
use crate::error::Result;

/// Structured call parameters: positional (array) or named (object).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    Array(Vec<Value>),
    Object(Map<String, Value>),
}

impl Params {
    /// Validates that a JSON value is structured data.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array(items) => Ok(Self::Array(items)),
            Value::Object(map) => Ok(Self::Object(map)),
            _ => Err(Error::InvalidParams),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Self::Array(items) => Value::Array(items),
            Self::Object(map) => Value::Object(map),
        }
    }
}

/// A call expecting a correlated response.
///
/// Ids are positive integers, unique within the sending peer's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Params>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

/// The reply to a request, carrying `result` or `error`.
///
/// Exclusivity of the two fields is a peer-level concern; the codec keeps
/// whatever the wire said.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    /// Creates a successful response.
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Creates an error response.
    pub fn err(id: u64, error: ErrorObject) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A fire-and-forget message with no id and no response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Params>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// The top-level envelope of a wire message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

/// Serializes a message envelope to its wire string.
pub fn encode(message: &Message) -> Result<String> {
    serde_json::to_string(message).map_err(|e| Error::Serialize(e.to_string()))
}

/// Parses a wire string and classifies the envelope.
///
/// Malformed JSON, a null or non-object top level, and objects that fit no
/// envelope shape are all reported as errors, never panics.
pub fn decode(raw: &str) -> Result<Message> {
    let value: Value = serde_json::from_str(raw).map_err(|e| Error::Parse(e.to_string()))?;
    if value.is_null() {
        return Err(Error::NullMessage);
    }
    let Value::Object(mut object) = value else {
        return Err(Error::NotAnObject);
    };

    let id = match object.get("id") {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            value
                .as_u64()
                .filter(|id| *id > 0)
                .ok_or_else(|| Error::InvalidEnvelope("id must be a positive integer".into()))?,
        ),
    };

    let method = match object.get("method") {
        None | Some(Value::Null) => None,
        Some(Value::String(method)) => Some(method.clone()),
        Some(_) => return Err(Error::InvalidEnvelope("method must be a string".into())),
    };

    let params = match object.remove("params") {
        None | Some(Value::Null) => None,
        Some(value) => Some(Params::from_value(value)?),
    };

    match (id, method) {
        (Some(id), Some(method)) => Ok(Message::Request(Request { id, method, params })),
        (Some(id), None) => {
            // Presence matters here: a literal `"result": null` still counts
            // as a result, so the field is taken before any default kicks in.
            let result = object.remove("result");
            let error = match object.remove("error") {
                None | Some(Value::Null) => None,
                Some(value) => Some(
                    serde_json::from_value::<ErrorObject>(value).map_err(|e| {
                        Error::InvalidEnvelope(format!("malformed error object: {}", e))
                    })?,
                ),
            };
            Ok(Message::Response(Response { id, result, error }))
        }
        (None, Some(method)) => Ok(Message::Notification(Notification { method, params })),
        (None, None) => Err(Error::InvalidEnvelope("Invalid message".into())),
    }
}
