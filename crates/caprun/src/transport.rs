//! # Message-based transport contract between peers
//!
//! A minimal, async interface for moving message strings between a peer and
//! whatever carries them (a worker IPC channel, a WebSocket, an in-memory
//! pipe). Each transport is held by exactly one peer, which handles message
//! classification, id assignment, and response correlation.
//!
//! ## Philosophy
//!
//! - **String-Oriented**: The transport knows nothing about envelopes or
//!   components. It moves opaque message strings.
//! - **Advisory signals**: `Connected` tells the peer the channel is
//!   writable; `Closed` tells it the channel is gone. There is no
//!   reconnection — a closed transport ends the peer.

use std::fmt;

use async_trait::async_trait;

/// Errors that occur at the transport layer.
#[derive(Debug, Clone)]
pub enum Error {
    /// The remote side is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "connection lost: {}", msg),
            Self::Io(msg) => write!(f, "i/o error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Inbound activity observed on a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The channel became writable. Delivered at most once in practice;
    /// the peer treats repeats as a no-op.
    Connected,
    /// A complete message string arrived from the remote side.
    Message(String),
    /// The channel closed. Advisory; the peer tears down on it.
    Closed,
}

/// A duplex carrier of message strings.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queues a message string for transmission.
    ///
    /// # Invariants
    /// - Must not reorder messages
    /// - Should return `Err` only on permanent failures
    async fn send(&self, message: &str) -> Result<()>;

    /// Awaits the next transport event.
    ///
    /// # Returns
    /// - `Ok(Some(event))` - connection signal or complete message
    /// - `Ok(None)` - the stream is closed (EOF)
    /// - `Err(_)` - a transport error occurred
    ///
    /// # Invariants
    /// - Messages are returned in arrival order
    /// - Each message is complete (no partial reads)
    async fn recv(&self) -> Result<Option<TransportEvent>>;
}
