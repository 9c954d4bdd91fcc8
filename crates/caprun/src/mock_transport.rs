//! Mock transports for testing.
//!
//! These are used internally by the test suite and are not part of the
//! public API.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use crate::transport;
use crate::transport::Transport;
use crate::transport::TransportEvent;

/// Transport half driven by a [`MockRemote`]: records what the peer sends
/// and replays whatever the test injects.
pub struct MockTransport {
    sent: Arc<Mutex<Vec<String>>>,
    events: AsyncMutex<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl MockTransport {
    pub fn new() -> (Self, MockRemote) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = Self {
            sent: Arc::clone(&sent),
            events: AsyncMutex::new(events_rx),
        };
        let remote = MockRemote {
            sent,
            events: events_tx,
        };
        (transport, remote)
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send(&self, message: &str) -> transport::Result<()> {
        self.sent.lock().push(message.to_string());
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<TransportEvent>> {
        let mut events = self.events.lock().await;
        Ok(events.recv().await)
    }
}

/// Test-side handle: injects transport events and inspects sent traffic.
pub struct MockRemote {
    sent: Arc<Mutex<Vec<String>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockRemote {
    pub fn connect(&self) {
        let _ = self.events.send(TransportEvent::Connected);
    }

    pub fn deliver(&self, raw: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Message(raw.into()));
    }

    pub fn close(&self) {
        let _ = self.events.send(TransportEvent::Closed);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}
