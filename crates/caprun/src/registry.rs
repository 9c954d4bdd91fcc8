//! # Component Registry and Lifecycle
//!
//! Components are named capability bundles instantiated at most once per
//! component system. The registry maps names to factories; component type
//! identity is tracked in a side table keyed by `TypeId`, so no type is
//! tagged or patched.
//!
//! Registration is explicit at system-construction time. Re-registering a
//! name or a type is a configuration error.

use std::any::type_name;
use std::any::TypeId;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use caprpc::Params;

use crate::events::ListenerError;
use crate::events::ListenerId;
use crate::peer;
use crate::peer::MethodFuture;
use crate::peer::Peer;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The name is already mapped to a factory.
    DuplicateName(String),
    /// The component type is already registered, under the contained name.
    DuplicateType(String),
    /// No factory is registered for the name or type.
    NotRegistered(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateName(name) => {
                write!(f, "Component name already registered: {}", name)
            }
            Self::DuplicateType(name) => {
                write!(f, "Component type already registered as: {}", name)
            }
            Self::NotRegistered(name) => write!(f, "Component not registered: {}", name),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by lifecycle hooks. Swallowed into the diagnostics sink;
/// mount and unmount never fail their caller.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// A named capability bundle with optional lifecycle hooks.
///
/// Instances are created through a registered factory, mounted when their
/// owning system enables, and unmounted when it tears down.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    /// Invoked once when the owning system enables. May suspend.
    async fn component_did_mount(&self) -> std::result::Result<(), HookError> {
        Ok(())
    }

    /// Invoked once when the owning system tears down. May suspend.
    async fn component_will_unmount(&self) -> std::result::Result<(), HookError> {
        Ok(())
    }
}

/// Scoped peer surface handed to a component factory.
///
/// Every method, notification, and subscription goes through the
/// `"<ComponentName>."` prefix, so components cannot collide in the peer's
/// flat method namespace. Exposed method names are recorded for the guest's
/// reflective proxy construction.
pub struct ComponentOptions {
    name: String,
    peer: Arc<Peer>,
    exposed: Arc<Mutex<Vec<String>>>,
}

impl ComponentOptions {
    pub(crate) fn new(name: &str, peer: Arc<Peer>, exposed: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            peer,
            exposed,
        }
    }

    /// The component name this context is scoped to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exposes `"<Name>.<method>"` on the owning peer and records the name.
    pub fn expose<F>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Params>) -> MethodFuture + Send + Sync + 'static,
    {
        self.exposed.lock().push(method.to_string());
        self.peer.expose(&format!("{}.{}", self.name, method), handler);
    }

    /// Sends `"<Name>.<event>"` as a notification to the remote side.
    pub fn notify(&self, event: &str, params: Option<Value>) -> peer::Result<()> {
        self.peer.notify(&format!("{}.{}", self.name, event), params)
    }

    /// Subscribes to `"<Name>.<event>"` on the owning peer.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&[Value]) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.peer.on(&format!("{}.{}", self.name, event), listener)
    }
}

type ComponentFactory = Arc<dyn Fn(ComponentOptions) -> Arc<dyn Component> + Send + Sync>;

/// Name-to-factory mapping with a `TypeId` side table for introspection.
pub struct ComponentRegistry {
    factories: DashMap<String, ComponentFactory>,
    names: DashMap<TypeId, String>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self {
            factories: DashMap::new(),
            names: DashMap::new(),
        }
    }

    /// Registers a component type under a name.
    ///
    /// Errors if the name is taken or the type was already registered under
    /// any name.
    pub fn register<C, F>(&self, name: &str, factory: F) -> Result<()>
    where
        C: Component,
        F: Fn(ComponentOptions) -> C + Send + Sync + 'static,
    {
        if self.factories.contains_key(name) {
            return Err(Error::DuplicateName(name.to_string()));
        }
        if let Some(existing) = self.names.get(&TypeId::of::<C>()) {
            return Err(Error::DuplicateType(existing.value().clone()));
        }

        self.names.insert(TypeId::of::<C>(), name.to_string());
        self.factories.insert(
            name.to_string(),
            Arc::new(move |options| Arc::new(factory(options)) as Arc<dyn Component>),
        );
        Ok(())
    }

    /// Introspects the name a component type was registered under.
    pub fn name_of<C: Component>(&self) -> Option<String> {
        self.names
            .get(&TypeId::of::<C>())
            .map(|entry| entry.value().clone())
    }

    /// Whether a factory is registered for the name.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub(crate) fn instantiate(
        &self,
        name: &str,
        options: ComponentOptions,
    ) -> Result<Arc<dyn Component>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotRegistered(name.to_string()))?;
        Ok((factory.value())(options))
    }

    pub(crate) fn resolve_type<C: Component>(&self) -> Result<String> {
        self.name_of::<C>()
            .ok_or_else(|| Error::NotRegistered(type_name::<C>().to_string()))
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the mount hook. Failures are logged, never propagated.
pub async fn mount_component(name: &str, component: &Arc<dyn Component>) {
    if let Err(error) = component.component_did_mount().await {
        tracing::warn!(component = name, %error, "componentDidMount failed");
    }
}

/// Runs the unmount hook. Failures are logged, never propagated.
pub async fn unmount_component(name: &str, component: &Arc<dyn Component>) {
    if let Err(error) = component.component_will_unmount().await {
        tracing::warn!(component = name, %error, "componentWillUnmount failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Alpha;
    impl Component for Alpha {}

    struct Beta;
    impl Component for Beta {}

    #[test]
    fn register_and_introspect() {
        let registry = ComponentRegistry::new();
        registry.register("Alpha", |_options| Alpha).unwrap();

        assert!(registry.contains("Alpha"));
        assert_eq!(registry.name_of::<Alpha>(), Some("Alpha".to_string()));
        assert_eq!(registry.name_of::<Beta>(), None);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let registry = ComponentRegistry::new();
        registry.register("Dup", |_options| Alpha).unwrap();

        let err = registry.register("Dup", |_options| Beta).unwrap_err();
        assert_eq!(err, Error::DuplicateName("Dup".to_string()));
    }

    #[test]
    fn duplicate_type_is_rejected() {
        let registry = ComponentRegistry::new();
        registry.register("First", |_options| Alpha).unwrap();

        let err = registry.register("Second", |_options| Alpha).unwrap_err();
        assert_eq!(err, Error::DuplicateType("First".to_string()));
    }
}
