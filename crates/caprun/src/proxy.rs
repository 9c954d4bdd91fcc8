//! # RPC Namespace Proxy
//!
//! Prefix-scoped handles over a peer. A namespace turns method access into
//! calls against `"<prefix><name>"`, event subscription into dispatcher
//! registrations under the same prefix, and event emission into
//! notifications.
//!
//! The dynamic attribute interception of scripting hosts is rendered here as
//! cached handles: asking a namespace for the same child or method twice
//! returns the same object, so repeated access registers nothing and calls
//! nothing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::events::ListenerError;
use crate::events::ListenerId;
use crate::peer;
use crate::peer::Peer;
use crate::peer::PendingCall;

/// A prefix-scoped view of a peer's call/notify/event surface.
pub struct RpcNamespace {
    peer: Arc<Peer>,
    prefix: String,
    children: Mutex<HashMap<String, Arc<RpcNamespace>>>,
    methods: Mutex<HashMap<String, Arc<MethodProxy>>>,
}

impl RpcNamespace {
    /// Creates the unprefixed root namespace over a peer.
    pub fn root(peer: Arc<Peer>) -> Arc<Self> {
        Arc::new(Self {
            peer,
            prefix: String::new(),
            children: Mutex::new(HashMap::new()),
            methods: Mutex::new(HashMap::new()),
        })
    }

    /// The prefix applied to every method and event name, e.g. `"Foo."`.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the child namespace for `name`, creating it lazily.
    ///
    /// Repeat access returns the same handle.
    pub fn namespace(&self, name: &str) -> Arc<RpcNamespace> {
        let mut children = self.children.lock();
        if let Some(child) = children.get(name) {
            return Arc::clone(child);
        }
        let child = Arc::new(RpcNamespace {
            peer: Arc::clone(&self.peer),
            prefix: format!("{}{}.", self.prefix, name),
            children: Mutex::new(HashMap::new()),
            methods: Mutex::new(HashMap::new()),
        });
        children.insert(name.to_string(), Arc::clone(&child));
        child
    }

    /// Returns the callable handle for `name`, creating it lazily.
    ///
    /// Repeat access returns the same handle and issues no call.
    pub fn method(&self, name: &str) -> Arc<MethodProxy> {
        let mut methods = self.methods.lock();
        if let Some(method) = methods.get(name) {
            return Arc::clone(method);
        }
        let method = Arc::new(MethodProxy {
            peer: Arc::clone(&self.peer),
            method: format!("{}{}", self.prefix, name),
        });
        methods.insert(name.to_string(), Arc::clone(&method));
        method
    }

    /// Subscribes to the event `"<prefix><event>"`.
    ///
    /// Array-valued event params reach the listener element-wise; an object
    /// param arrives whole.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&[Value]) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.peer
            .on(&format!("{}{}", self.prefix, event), spread_args(listener))
    }

    /// Unsubscribes a listener registered through this namespace.
    pub fn off(&self, event: &str, id: ListenerId) {
        self.peer.off(&format!("{}{}", self.prefix, event), id)
    }

    /// Sends the event `"<prefix><event>"` as a notification.
    pub fn emit_event(&self, event: &str, params: Option<Value>) -> peer::Result<()> {
        self.peer.notify(&format!("{}{}", self.prefix, event), params)
    }
}

/// Adapts a peer-level event (one argument holding the raw params value)
/// into proxy-level arguments: arrays are spread, anything else is passed
/// through as-is.
pub(crate) fn spread_args<F>(
    listener: F,
) -> impl Fn(&[Value]) -> Result<(), ListenerError> + Send + Sync + 'static
where
    F: Fn(&[Value]) -> Result<(), ListenerError> + Send + Sync + 'static,
{
    move |args| match args.first() {
        Some(Value::Array(items)) => listener(items),
        Some(other) => listener(std::slice::from_ref(other)),
        None => listener(&[]),
    }
}

/// A callable bound to one fully-prefixed method name.
pub struct MethodProxy {
    peer: Arc<Peer>,
    method: String,
}

impl MethodProxy {
    /// The fully-prefixed method name this handle calls.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Invokes the method with the arguments packed into an array.
    pub fn invoke(&self, args: Vec<Value>) -> peer::Result<PendingCall> {
        self.peer.call(&self.method, Some(Value::Array(args)))
    }

    /// Sends the method as a notification instead of a call.
    pub fn notify(&self, args: Vec<Value>) -> peer::Result<()> {
        self.peer.notify(&self.method, Some(Value::Array(args)))
    }
}
