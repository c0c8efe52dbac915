//! Registry of namespaces, looked up by name.
//!
//! The registry is an explicit value. Containers and applications receive it
//! by injection; nothing in the crate keeps a process-global instance.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::IdCreateError;

use super::id::Id;
use super::namespace::{GuidNamespace, IdArg, LongNamespace, Namespace, StringNamespace};

/// Namespace registry and ID factory.
///
/// Holds exactly one [`Namespace`] instance per name. Registration is
/// idempotent: the first instance registered under a name wins and later
/// registrations return it.
#[derive(Debug, Default)]
pub struct NamespaceRegistry {
    namespaces: RwLock<HashMap<String, Arc<dyn Namespace>>>,
}

impl NamespaceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the `string`, `guid` and `long` namespaces.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(StringNamespace::default()));
        registry.register(Arc::new(GuidNamespace));
        registry.register(Arc::new(LongNamespace));
        registry
    }

    /// Register a namespace, returning the instance now held under its name.
    ///
    /// If a namespace with the same name already exists, it is kept and
    /// returned; `namespace` is dropped.
    pub fn register(&self, namespace: Arc<dyn Namespace>) -> Arc<dyn Namespace> {
        let mut namespaces = self.namespaces.write();
        namespaces
            .entry(namespace.name().to_string())
            .or_insert(namespace)
            .clone()
    }

    /// Look up a namespace by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Namespace>> {
        self.namespaces.read().get(name).cloned()
    }

    /// Look up a namespace, creating it with `ctor` on first use.
    ///
    /// `ctor` runs at most once per name even under concurrent callers.
    pub fn get_or_register_with<F>(&self, name: &str, ctor: F) -> Arc<dyn Namespace>
    where
        F: FnOnce() -> Arc<dyn Namespace>,
    {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        let mut namespaces = self.namespaces.write();
        namespaces
            .entry(name.to_string())
            .or_insert_with(ctor)
            .clone()
    }

    /// Remove a namespace. Returns whether it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.namespaces.write().remove(name).is_some()
    }

    /// Registered namespace names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop every registered namespace.
    pub fn clear(&self) {
        self.namespaces.write().clear();
    }

    /// Build an ID through the named namespace.
    pub fn create_id(&self, namespace: &str, args: &[IdArg]) -> Result<Id, IdCreateError> {
        let ns = self
            .get(namespace)
            .ok_or_else(|| IdCreateError::UnknownNamespace(namespace.to_string()))?;
        ns.create_instance(args)
    }

    /// Parse an external form `scheme:value`.
    ///
    /// The scheme is matched against namespace names first, then against
    /// each namespace's declared scheme.
    pub fn parse(&self, external: &str) -> Result<Id, IdCreateError> {
        let (scheme, value) = external.split_once(':').ok_or_else(|| IdCreateError::Malformed {
            namespace: String::new(),
            reason: format!("missing scheme separator in {:?}", external),
        })?;
        let ns = self
            .get(scheme)
            .or_else(|| {
                self.namespaces
                    .read()
                    .values()
                    .find(|ns| ns.scheme() == scheme)
                    .cloned()
            })
            .ok_or_else(|| IdCreateError::UnknownNamespace(scheme.to_string()))?;
        ns.create_from_external(value)
    }

    /// Build an ID in the default `string` namespace.
    pub fn create_string_id(&self, value: &str) -> Result<Id, IdCreateError> {
        self.create_id(StringNamespace::DEFAULT_NAME, &[IdArg::from(value)])
    }

    /// Generate a fresh GUID ID.
    pub fn create_guid(&self) -> Result<Id, IdCreateError> {
        self.create_id(GuidNamespace::NAME, &[])
    }

    /// Build an ID in the `long` namespace.
    pub fn create_long_id(&self, value: i64) -> Result<Id, IdCreateError> {
        self.create_id(LongNamespace::NAME, &[IdArg::Long(value)])
    }
}
