//! # RPC Peer
//!
//! A symmetric endpoint over one transport: it correlates outbound requests
//! with responses, dispatches inbound requests against an exposed method
//! table, and fans inbound notifications out through the event dispatcher.
//!
//! The peer spawns two pump tasks on construction: an inbound pump that
//! drains the transport and routes each event, and an outbound pump that
//! serializes sends so submission order is transport order. Messages
//! submitted before the transport signals `Connected` queue up and flush in
//! FIFO order on `did_connect`.
//!
//! ## Invariants
//!
//! - Ids are monotonically increasing positive integers, unique within the
//!   peer's lifetime. No id resolves twice.
//! - For any two messages submitted in order, the transport observes them in
//!   that order, whether they went through the pre-connect queue or not.
//! - `shutdown` rejects every pending call with `Error::PeerClosed` and is
//!   idempotent; the inbound pump invokes it when the transport closes.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::task::Context;
use std::task::Poll;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use caprpc::ErrorObject;
use caprpc::Message;
use caprpc::Notification;
use caprpc::Params;
use caprpc::RemoteError;
use caprpc::Request;
use caprpc::Response;

use crate::events::EventDispatcher;
use crate::events::ListenerError;
use crate::events::ListenerId;
use crate::events::ERROR_EVENT;
use crate::transport::Transport;
use crate::transport::TransportEvent;

/// Event emitted locally when the transport closes.
pub const DISCONNECT_EVENT: &str = "disconnect";

#[derive(Debug)]
pub enum Error {
    /// `call`/`notify` given params that are neither array nor object.
    InvalidParams,
    /// An outbound envelope failed to serialize.
    Codec(caprpc::Error),
    /// The remote side replied with an error object.
    Remote(RemoteError),
    /// The response channel dropped without delivering an outcome.
    ChannelClosed,
    /// The peer was shut down while the call was pending.
    PeerClosed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidParams => write!(f, "Params must be structured data"),
            Self::Codec(e) => write!(f, "Codec error: {}", e),
            Self::Remote(e) => write!(f, "Remote error: {}", e),
            Self::ChannelClosed => write!(f, "Response channel closed"),
            Self::PeerClosed => write!(f, "Peer closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(e) => Some(e),
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl From<caprpc::Error> for Error {
    fn from(e: caprpc::Error) -> Self {
        Self::Codec(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Future returned by an exposed method handler.
pub type MethodFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, ErrorObject>> + Send>>;

type MethodHandler = Arc<dyn Fn(Option<Params>) -> MethodFuture + Send + Sync>;

/// An unresolved call, awaitable for the correlated response.
#[derive(Debug)]
pub struct PendingCall {
    rx: oneshot::Receiver<Result<Value>>,
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|recv| match recv {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::ChannelClosed),
        })
    }
}

struct Outbound {
    connected: bool,
    queue: VecDeque<String>,
}

/// A symmetric RPC endpoint bound to one transport.
pub struct Peer {
    name: String,
    events: EventDispatcher,
    pending: DashMap<u64, oneshot::Sender<Result<Value>>>,
    methods: DashMap<String, MethodHandler>,
    next_id: AtomicU64,
    outbound: Mutex<Outbound>,
    outbox: mpsc::UnboundedSender<String>,
    closed: AtomicBool,
    // Handle to the owning Arc, so request dispatch can hand the peer to
    // spawned handler tasks without keeping it alive on its own.
    self_ref: Weak<Peer>,
}

impl Peer {
    /// Creates a peer and spawns its pump tasks.
    ///
    /// The peer starts disconnected; outbound messages queue until the
    /// transport delivers `Connected`. The name is used for diagnostics.
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>) -> Arc<Self> {
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let (outbox, outbox_rx) = mpsc::unbounded_channel();

        let name = name.into();
        let peer = Arc::new_cyclic(|self_ref: &Weak<Peer>| Self {
            name,
            events: EventDispatcher::new(),
            pending: DashMap::new(),
            methods: DashMap::new(),
            next_id: AtomicU64::new(1),
            outbound: Mutex::new(Outbound {
                connected: false,
                queue: VecDeque::new(),
            }),
            outbox,
            closed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });

        Self::spawn_outbound_pump(Arc::downgrade(&peer), Arc::clone(&transport), outbox_rx);
        Self::spawn_inbound_pump(Arc::downgrade(&peer), transport);

        peer
    }

    /// Returns the peer name, used for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The outbound pump drains the outbox one message at a time, so
    /// submission order is transport order.
    fn spawn_outbound_pump(
        peer: Weak<Self>,
        transport: Arc<dyn Transport>,
        mut outbox_rx: mpsc::UnboundedReceiver<String>,
    ) {
        tokio::spawn(async move {
            while let Some(message) = outbox_rx.recv().await {
                if let Err(error) = transport.send(&message).await {
                    match peer.upgrade() {
                        Some(peer) => {
                            peer.emit_error(format!("Transport send failed: {}", error));
                        }
                        None => tracing::warn!(%error, "transport send failed after peer drop"),
                    }
                    break;
                }
            }
        });
    }

    /// The inbound pump routes transport events until the stream ends, then
    /// tears the peer down.
    fn spawn_inbound_pump(peer: Weak<Self>, transport: Arc<dyn Transport>) {
        tokio::spawn(async move {
            loop {
                let event = transport.recv().await;
                let Some(peer) = peer.upgrade() else {
                    return;
                };
                match event {
                    Ok(Some(TransportEvent::Connected)) => peer.did_connect(),
                    Ok(Some(TransportEvent::Message(raw))) => peer.process_message(&raw),
                    Ok(Some(TransportEvent::Closed)) | Ok(None) => {
                        peer.events.emit(DISCONNECT_EVENT, &[]);
                        peer.shutdown();
                        return;
                    }
                    Err(error) => {
                        peer.emit_error(format!("Transport error: {}", error));
                        peer.events.emit(DISCONNECT_EVENT, &[]);
                        peer.shutdown();
                        return;
                    }
                }
            }
        });
    }

    /// Issues a request and returns a future resolving to the correlated
    /// response.
    ///
    /// Params must be structured data (array, object, or absent); anything
    /// else errors here, before an id is allocated. The serialized request
    /// queues if the transport has not yet connected.
    pub fn call(&self, method: &str, params: Option<Value>) -> Result<PendingCall> {
        let params = check_params(params)?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::PeerClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let message = Message::Request(Request::new(id, method, params));
        match caprpc::encode(&message) {
            Ok(raw) => {
                self.send_raw(raw);
                Ok(PendingCall { rx })
            }
            Err(error) => {
                self.pending.remove(&id);
                Err(Error::Codec(error))
            }
        }
    }

    /// Sends a fire-and-forget notification. Same params contract as `call`;
    /// no id, no pending entry.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let params = check_params(params)?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::PeerClosed);
        }

        let message = Message::Notification(Notification::new(method, params));
        let raw = caprpc::encode(&message)?;
        self.send_raw(raw);
        Ok(())
    }

    /// Registers a handler for inbound requests naming `method`.
    ///
    /// Re-exposing a name replaces the prior handler; the last writer wins.
    pub fn expose<F>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Params>) -> MethodFuture + Send + Sync + 'static,
    {
        self.methods.insert(method.to_string(), Arc::new(handler));
    }

    /// Subscribes to a local event (inbound notifications are emitted under
    /// their method name).
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&[Value]) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.events.on(event, listener)
    }

    /// Subscribes a listener removed after its first delivery.
    pub fn once<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&[Value]) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.events.once(event, listener)
    }

    /// Unsubscribes a listener. Unknown ids are a no-op.
    pub fn off(&self, event: &str, id: ListenerId) {
        self.events.off(event, id)
    }

    /// Emits a local event. Does not touch the wire.
    pub fn emit(&self, event: &str, args: &[Value]) {
        self.events.emit(event, args)
    }

    /// Marks the transport writable and flushes the queue in FIFO order.
    /// Idempotent; repeat signals are ignored.
    pub fn did_connect(&self) {
        let mut outbound = self.outbound.lock();
        if outbound.connected {
            return;
        }
        outbound.connected = true;
        while let Some(raw) = outbound.queue.pop_front() {
            let _ = self.outbox.send(raw);
        }
    }

    /// Whether the transport has signalled writability.
    pub fn is_connected(&self) -> bool {
        self.outbound.lock().connected
    }

    /// Routes one received message string.
    ///
    /// Parse failures, null or invalid envelopes, and responses with unknown
    /// ids are reported through the `"error"` event; they never touch a
    /// pending call or abort the peer.
    pub fn process_message(&self, raw: &str) {
        let message = match caprpc::decode(raw) {
            Ok(message) => message,
            Err(error) => {
                self.emit_error(error.to_string());
                return;
            }
        };

        match message {
            Message::Response(response) => self.handle_response(response),
            Message::Request(request) => self.handle_request(request),
            Message::Notification(notification) => self.handle_notification(notification),
        }
    }

    /// Rejects every pending call with `PeerClosed`. Idempotent.
    ///
    /// Invoked by the inbound pump on transport close and by owners at
    /// teardown; after it runs, `call` and `notify` refuse new traffic.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(Error::PeerClosed));
            }
        }
    }

    /// Number of calls still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn send_raw(&self, raw: String) {
        let mut outbound = self.outbound.lock();
        if outbound.connected {
            let _ = self.outbox.send(raw);
        } else {
            outbound.queue.push_back(raw);
        }
    }

    fn handle_response(&self, response: Response) {
        let Some((_, tx)) = self.pending.remove(&response.id) else {
            self.emit_error(format!("Unknown response id: {}", response.id));
            return;
        };

        if let Some(result) = response.result {
            let _ = tx.send(Ok(result));
        } else if let Some(error) = response.error {
            let _ = tx.send(Err(Error::Remote(RemoteError::from_object(error))));
        } else {
            // The entry is already removed; dropping the sender surfaces to
            // the caller as ChannelClosed.
            self.emit_error(format!(
                "Response {} must have result or error",
                response.id
            ));
        }
    }

    fn handle_request(&self, request: Request) {
        let Request { id, method, params } = request;

        let Some(handler) = self.methods.get(&method).map(|entry| Arc::clone(entry.value()))
        else {
            self.send_response(Response::err(id, ErrorObject::method_not_found(&method)));
            return;
        };

        let Some(peer) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let reply = match handler(params).await {
                Ok(value) => Response::ok(id, value),
                Err(error) => Response::err(id, error),
            };
            peer.send_response(reply);
        });
    }

    fn handle_notification(&self, notification: Notification) {
        let Notification { method, params } = notification;
        // Peer-level listeners receive the params value as one argument;
        // array spreading is the proxy layer's concern.
        let args = match params {
            None => Vec::new(),
            Some(params) => vec![params.into_value()],
        };
        self.events.emit(&method, &args);
    }

    fn send_response(&self, response: Response) {
        match caprpc::encode(&Message::Response(response)) {
            Ok(raw) => self.send_raw(raw),
            Err(error) => self.emit_error(error.to_string()),
        }
    }

    fn emit_error(&self, message: String) {
        tracing::debug!(peer = %self.name, %message, "peer error");
        self.events.emit(ERROR_EVENT, &[Value::String(message)]);
    }
}

fn check_params(params: Option<Value>) -> Result<Option<Params>> {
    match params {
        None => Ok(None),
        Some(value) => Params::from_value(value)
            .map(Some)
            .map_err(|_| Error::InvalidParams),
    }
}
