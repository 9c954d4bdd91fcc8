//! # Event Dispatcher
//!
//! Named-event multicast with synchronous, registration-ordered delivery.
//!
//! ## Invariants
//!
//! - Listeners for one event run in the order they were registered.
//! - A failing listener never prevents later listeners from running; the
//!   failure is reported through the `"error"` event instead.
//! - Failures of `"error"` listeners themselves go to the tracing sink only,
//!   so error reporting cannot recurse.
//! - Emitting `"error"` with no listeners is a silent no-op.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

/// Event name reserved for reporting listener and protocol failures.
pub const ERROR_EVENT: &str = "error";

/// Errors surfaced by a listener, reported via the `"error"` event.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

type ListenerFn = Arc<dyn Fn(&[Value]) -> Result<(), ListenerError> + Send + Sync>;

/// Handle identifying one registration, used to unsubscribe.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    once: bool,
    listener: ListenerFn,
}

/// Multicast dispatcher mapping event names to ordered listener lists.
pub struct EventDispatcher {
    listeners: Mutex<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribes a listener; it runs on every emit until removed.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&[Value]) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.register(event, false, Arc::new(listener))
    }

    /// Subscribes a listener that is removed after its first delivery.
    pub fn once<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&[Value]) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.register(event, true, Arc::new(listener))
    }

    fn register(&self, event: &str, once: bool, listener: ListenerFn) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut table = self.listeners.lock();
        table
            .entry(event.to_string())
            .or_default()
            .push(Registration { id, once, listener });
        id
    }

    /// Unsubscribes a listener. Unknown ids are a no-op.
    pub fn off(&self, event: &str, id: ListenerId) {
        let mut table = self.listeners.lock();
        if let Some(regs) = table.get_mut(event) {
            regs.retain(|reg| reg.id != id);
            if regs.is_empty() {
                table.remove(event);
            }
        }
    }

    /// Delivers `args` to every listener of `event`, synchronously and in
    /// registration order.
    ///
    /// The listener list is snapshotted (and `once` entries removed) before
    /// any listener runs, so listeners may re-enter the dispatcher.
    pub fn emit(&self, event: &str, args: &[Value]) {
        let batch: Vec<ListenerFn> = {
            let mut table = self.listeners.lock();
            let Some(regs) = table.get_mut(event) else {
                return;
            };
            let batch = regs.iter().map(|reg| Arc::clone(&reg.listener)).collect();
            regs.retain(|reg| !reg.once);
            if regs.is_empty() {
                table.remove(event);
            }
            batch
        };

        for listener in batch {
            if let Err(error) = listener(args) {
                self.report(event, error);
            }
        }
    }

    /// Number of live listeners for an event.
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .lock()
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn report(&self, event: &str, error: ListenerError) {
        if event == ERROR_EVENT {
            // An error listener failing must not re-enter the error loop.
            tracing::error!(%error, "error listener failed");
            return;
        }
        self.emit(ERROR_EVENT, &[Value::String(error.to_string())]);
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
