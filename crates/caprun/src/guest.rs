//! # Guest Client
//!
//! The guest-side mirror of the host component system: a peer on the guest's
//! transport, a gate that holds guest-initiated traffic until the host's
//! enable notification arrives, a SIGKILL handler that tears the runtime
//! down, and a proxy factory that materializes host components.
//!
//! Every call issued before the enable notification parks on the gate and
//! flushes afterwards, so no guest request reaches the host before the
//! host's mount hooks have run.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

use caprpc::METHOD_NOT_FOUND;

use crate::events::ListenerError;
use crate::events::ListenerId;
use crate::peer;
use crate::peer::Error;
use crate::peer::Peer;
use crate::proxy::spread_args;
use crate::system::GET_EXPOSED_METHODS;
use crate::system::LOAD_COMPONENTS;
use crate::system::SIGKILL;
use crate::system::SYSTEM_ENABLED;
use crate::transport::Transport;

/// Guest endpoint over one transport to the host.
pub struct GuestClient {
    peer: Arc<Peer>,
    ready: watch::Receiver<bool>,
    killed: watch::Receiver<bool>,
    proxies: Mutex<HashMap<String, Arc<ComponentProxy>>>,
}

impl GuestClient {
    /// Builds the guest peer and wires the enable gate and SIGKILL handler.
    pub fn new(transport: Box<dyn Transport>) -> Arc<Self> {
        let peer = Peer::new("guest", transport);

        let (ready_tx, ready_rx) = watch::channel(false);
        peer.on(SYSTEM_ENABLED, move |_args| {
            let _ = ready_tx.send(true);
            Ok(())
        });

        let (killed_tx, killed_rx) = watch::channel(false);
        let weak = Arc::downgrade(&peer);
        peer.on(SIGKILL, move |_args| {
            if let Some(peer) = weak.upgrade() {
                peer.shutdown();
            }
            let _ = killed_tx.send(true);
            Ok(())
        });

        Arc::new(Self {
            peer,
            ready: ready_rx,
            killed: killed_rx,
            proxies: Mutex::new(HashMap::new()),
        })
    }

    /// The underlying peer, for exposing guest-side methods or subscribing
    /// to raw events.
    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Resolves once a SIGKILL has been received and the peer is shut down.
    pub async fn wait_for_shutdown(&self) {
        let mut killed = self.killed.clone();
        let _ = killed.wait_for(|killed| *killed).await;
    }

    /// Issues a call, parking until the host has enabled.
    pub async fn call(&self, method: &str, params: Option<Value>) -> peer::Result<Value> {
        self.ready().await;
        self.peer.call(method, params)?.await
    }

    /// Sends a notification, parking until the host has enabled.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> peer::Result<()> {
        self.ready().await;
        self.peer.notify(method, params)
    }

    /// Returns a proxy for a host component, materializing it first.
    ///
    /// Issues `LoadComponents([name])`, then fetches the exposed-method list
    /// reflectively. Hosts without the reflection method fall back to an
    /// empty list; calls are not validated against it anyway.
    pub async fn component(&self, name: &str) -> peer::Result<Arc<ComponentProxy>> {
        if let Some(proxy) = self.proxies.lock().get(name) {
            return Ok(Arc::clone(proxy));
        }

        self.load(name).await?;

        let methods = match self
            .call(&format!("{}.{}", name, GET_EXPOSED_METHODS), None)
            .await
        {
            Ok(Value::Array(items)) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(method) => Some(method),
                    _ => None,
                })
                .collect(),
            Ok(_) => Vec::new(),
            Err(Error::Remote(remote)) if remote.code() == Some(METHOD_NOT_FOUND) => Vec::new(),
            Err(error) => return Err(error),
        };

        Ok(self.cache_proxy(name, methods))
    }

    /// Returns a proxy with a statically declared method list, skipping the
    /// reflective lookup.
    pub async fn component_with_methods(
        &self,
        name: &str,
        methods: &[&str],
    ) -> peer::Result<Arc<ComponentProxy>> {
        if let Some(proxy) = self.proxies.lock().get(name) {
            return Ok(Arc::clone(proxy));
        }

        self.load(name).await?;

        let methods = methods.iter().map(|method| method.to_string()).collect();
        Ok(self.cache_proxy(name, methods))
    }

    async fn load(&self, name: &str) -> peer::Result<()> {
        self.call(LOAD_COMPONENTS, Some(Value::Array(vec![Value::String(name.into())])))
            .await?;
        Ok(())
    }

    fn cache_proxy(&self, name: &str, methods: Vec<String>) -> Arc<ComponentProxy> {
        let mut proxies = self.proxies.lock();
        if let Some(existing) = proxies.get(name) {
            return Arc::clone(existing);
        }
        let proxy = Arc::new(ComponentProxy {
            name: name.to_string(),
            methods,
            peer: Arc::clone(&self.peer),
            ready: self.ready.clone(),
        });
        proxies.insert(name.to_string(), Arc::clone(&proxy));
        proxy
    }

    async fn ready(&self) {
        let mut ready = self.ready.clone();
        let _ = ready.wait_for(|ready| *ready).await;
    }
}

/// Guest-side handle on one host component.
///
/// Method names are not validated locally: an unknown method round-trips
/// and comes back as a method-not-found remote error.
pub struct ComponentProxy {
    name: String,
    methods: Vec<String>,
    peer: Arc<Peer>,
    ready: watch::Receiver<bool>,
}

impl std::fmt::Debug for ComponentProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentProxy")
            .field("name", &self.name)
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

impl ComponentProxy {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The method list declared statically or fetched reflectively.
    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    /// Calls `"<Name>.<method>"` with the arguments packed into an array,
    /// parking until the host has enabled.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> peer::Result<Value> {
        let mut ready = self.ready.clone();
        let _ = ready.wait_for(|ready| *ready).await;
        self.peer
            .call(&format!("{}.{}", self.name, method), Some(Value::Array(args)))?
            .await
    }

    /// Sends `"<Name>.<event>"` as a notification.
    pub async fn notify(&self, event: &str, params: Option<Value>) -> peer::Result<()> {
        let mut ready = self.ready.clone();
        let _ = ready.wait_for(|ready| *ready).await;
        self.peer
            .notify(&format!("{}.{}", self.name, event), params)
    }

    /// Subscribes to `"<Name>.<event>"` notifications from the host.
    ///
    /// Array-valued event params reach the listener element-wise; an object
    /// param arrives whole.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&[Value]) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.peer
            .on(&format!("{}.{}", self.name, event), spread_args(listener))
    }
}
