//! # Host Component System
//!
//! Owns a worker-backed server peer and the live component instances for one
//! guest. The system mounts instances when it enables, exposes the
//! `LoadComponents` method so the guest can materialize components, and
//! tears everything down on unmount: SIGKILL to the guest, unmount hooks,
//! pending-call rejection, worker termination.
//!
//! ## Invariants
//!
//! - Each instance is mounted exactly once: during `enable` for instances
//!   that already exist, or immediately on creation afterwards.
//! - The `system-enabled` notification is sent only after every mount hook
//!   has completed, so mount side-effects happen before the first queued
//!   guest call is serviced.
//! - `unmount` is idempotent and never fails its caller.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use caprpc::ErrorObject;
use caprpc::Params;

use crate::events::EventDispatcher;
use crate::events::ListenerError;
use crate::events::ListenerId;
use crate::peer;
use crate::peer::Peer;
use crate::registry;
use crate::registry::Component;
use crate::registry::ComponentOptions;
use crate::registry::ComponentRegistry;
use crate::transport::Transport;

/// Host-exposed method that materializes components by name.
pub const LOAD_COMPONENTS: &str = "LoadComponents";
/// Host-to-guest notification requesting shutdown.
pub const SIGKILL: &str = "SIGKILL";
/// Host-to-guest notification that unblocks queued guest calls.
pub const SYSTEM_ENABLED: &str = "system-enabled";
/// Per-component method returning the exposed method list.
pub const GET_EXPOSED_METHODS: &str = "_getExposedMethods";

/// Local system lifecycle events.
pub const SYSTEM_WILL_ENABLE: &str = "systemWillEnable";
pub const SYSTEM_WILL_UNMOUNT: &str = "systemWillUnmount";
pub const SYSTEM_DID_UNMOUNT: &str = "systemDidUnmount";

/// Handle to the isolated execution context backing one system.
///
/// Spawning is the embedder's concern; the system only needs the release
/// path. `terminate` must be safe to call once the guest is unreachable.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    async fn terminate(&self);
}

#[derive(Debug)]
pub enum Error {
    Registry(registry::Error),
    Peer(peer::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registry(e) => write!(f, "Registry error: {}", e),
            Self::Peer(e) => write!(f, "Peer error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<registry::Error> for Error {
    fn from(e: registry::Error) -> Self {
        Self::Registry(e)
    }
}

impl From<peer::Error> for Error {
    fn from(e: peer::Error) -> Self {
        Self::Peer(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

struct InstanceEntry {
    name: String,
    component: Arc<dyn Component>,
    mounted: AtomicBool,
}

/// Host-side owner of one guest: a server peer, a worker handle, and the
/// instance map.
pub struct ComponentSystem {
    peer: Arc<Peer>,
    registry: Arc<ComponentRegistry>,
    instances: Mutex<Vec<Arc<InstanceEntry>>>,
    worker: Option<Box<dyn Worker>>,
    events: EventDispatcher,
    enabled: AtomicBool,
    unmounted: AtomicBool,
}

impl ComponentSystem {
    /// The server peer facing the guest.
    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Subscribes to a system lifecycle event.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&[Value]) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.events.on(event, listener)
    }

    /// Returns the instance for `name`, creating it on first lookup.
    ///
    /// Instances created after `enable` mount immediately.
    pub async fn get_component_instance(&self, name: &str) -> Result<Arc<dyn Component>> {
        if let Some(existing) = self.lookup(name) {
            return Ok(existing);
        }

        let exposed = Arc::new(Mutex::new(Vec::new()));
        let options = ComponentOptions::new(name, Arc::clone(&self.peer), Arc::clone(&exposed));
        let component = self.registry.instantiate(name, options)?;

        let methods = Arc::clone(&exposed);
        self.peer.expose(
            &format!("{}.{}", name, GET_EXPOSED_METHODS),
            move |_params| {
                let list = methods.lock().clone();
                Box::pin(async move {
                    Ok(Value::Array(list.into_iter().map(Value::String).collect()))
                })
            },
        );

        let entry = Arc::new(InstanceEntry {
            name: name.to_string(),
            component: Arc::clone(&component),
            mounted: AtomicBool::new(false),
        });
        self.instances.lock().push(Arc::clone(&entry));

        if self.enabled.load(Ordering::SeqCst) {
            self.mount_entry(&entry).await;
        }

        Ok(component)
    }

    /// Typed lookup: resolves the type's registered name, then behaves like
    /// `get_component_instance`. Unregistered types are errors.
    pub async fn instance_of<C: Component>(&self) -> Result<Arc<dyn Component>> {
        let name = self.registry.resolve_type::<C>()?;
        self.get_component_instance(&name).await
    }

    /// Mounts all known instances in insertion order, then notifies the
    /// guest so its queued calls drain. Idempotent.
    pub async fn enable(&self) {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return;
        }

        self.events.emit(SYSTEM_WILL_ENABLE, &[]);

        let entries: Vec<Arc<InstanceEntry>> = self.instances.lock().clone();
        for entry in entries {
            self.mount_entry(&entry).await;
        }

        if let Err(error) = self.peer.notify(SYSTEM_ENABLED, None) {
            tracing::warn!(%error, "failed to send enable notification");
        }
    }

    /// Tears the system down: SIGKILL to the guest, unmount hooks in
    /// insertion order, pending-call rejection, worker termination.
    /// Idempotent, and never fails the caller.
    pub async fn unmount(&self) {
        if self.unmounted.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(error) = self.peer.notify(SIGKILL, None) {
            tracing::debug!(%error, "SIGKILL notification not delivered");
        }

        self.events.emit(SYSTEM_WILL_UNMOUNT, &[]);

        let entries: Vec<Arc<InstanceEntry>> = {
            let mut instances = self.instances.lock();
            instances.drain(..).collect()
        };
        for entry in entries {
            registry::unmount_component(&entry.name, &entry.component).await;
        }

        self.peer.shutdown();

        if let Some(worker) = &self.worker {
            worker.terminate().await;
        }

        self.events.emit(SYSTEM_DID_UNMOUNT, &[]);
    }

    fn lookup(&self, name: &str) -> Option<Arc<dyn Component>> {
        self.instances
            .lock()
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| Arc::clone(&entry.component))
    }

    async fn mount_entry(&self, entry: &InstanceEntry) {
        if entry.mounted.swap(true, Ordering::SeqCst) {
            return;
        }
        registry::mount_component(&entry.name, &entry.component).await;
    }

    async fn load_components(
        &self,
        params: Option<Params>,
    ) -> std::result::Result<Value, ErrorObject> {
        let Some(Params::Array(values)) = params else {
            return Err(ErrorObject::new("LoadComponents expects a list of names"));
        };

        let mut missing = Vec::new();
        for value in values {
            let Value::String(name) = value else {
                return Err(ErrorObject::new("Component names must be strings"));
            };
            if self.get_component_instance(&name).await.is_err() {
                missing.push(name);
            }
        }

        if missing.is_empty() {
            Ok(Value::Null)
        } else {
            Err(ErrorObject::new(format!(
                "Components not found: {}",
                missing.join(", ")
            )))
        }
    }
}

/// Fluent assembly of a `ComponentSystem` from its collaborators.
pub struct SystemBuilder {
    name: String,
    registry: Arc<ComponentRegistry>,
    worker: Option<Box<dyn Worker>>,
}

impl SystemBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registry: Arc::new(ComponentRegistry::new()),
            worker: None,
        }
    }

    /// Uses a pre-populated registry instead of the default empty one.
    pub fn registry(mut self, registry: Arc<ComponentRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Attaches the worker handle terminated on unmount.
    pub fn worker(mut self, worker: Box<dyn Worker>) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Builds the system over the transport facing the guest and wires the
    /// `LoadComponents` method.
    pub fn build(self, transport: Box<dyn Transport>) -> Arc<ComponentSystem> {
        let peer = Peer::new(self.name, transport);

        let system = Arc::new(ComponentSystem {
            peer,
            registry: self.registry,
            instances: Mutex::new(Vec::new()),
            worker: self.worker,
            events: EventDispatcher::new(),
            enabled: AtomicBool::new(false),
            unmounted: AtomicBool::new(false),
        });

        // The handler holds a weak reference; the peer must not keep its
        // owning system alive.
        let weak: Weak<ComponentSystem> = Arc::downgrade(&system);
        system.peer.expose(LOAD_COMPONENTS, move |params| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(system) = weak.upgrade() else {
                    return Err(ErrorObject::new("Component system is gone"));
                };
                system.load_components(params).await
            })
        });

        system
    }
}
