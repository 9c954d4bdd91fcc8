//! JSON-RPC envelope encoding for the capwire runtime.

mod error;
mod message;


pub use crate::error::Error;
pub use crate::error::ErrorObject;
pub use crate::error::RemoteError;
pub use crate::error::Result;
pub use crate::error::METHOD_NOT_FOUND;

pub use crate::message::decode;
pub use crate::message::encode;
pub use crate::message::Message;
pub use crate::message::Notification;
pub use crate::message::Params;
pub use crate::message::Request;
pub use crate::message::Response;
