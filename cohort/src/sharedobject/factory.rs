//! Factories that instantiate shared objects by type name.
//!
//! Members create replicas from a `CreateObject` message, which names the
//! object's type. Every member registers the same factories under the same
//! names; a type without a local factory is reported and skipped.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::SharedObjectError;
use crate::identity::Id;

use super::SharedObject;

/// Creates shared object instances.
///
/// Closures with the matching signature implement this trait.
pub trait SharedObjectFactory: Send + Sync {
    /// Instantiate the object `object_id` whose primary lives on `home`.
    fn create(
        &self,
        object_id: &Id,
        home: &Id,
        init_args: &[u8],
    ) -> Result<Box<dyn SharedObject>, SharedObjectError>;
}

impl<F> SharedObjectFactory for F
where
    F: Fn(&Id, &Id, &[u8]) -> Result<Box<dyn SharedObject>, SharedObjectError> + Send + Sync,
{
    fn create(
        &self,
        object_id: &Id,
        home: &Id,
        init_args: &[u8],
    ) -> Result<Box<dyn SharedObject>, SharedObjectError> {
        self(object_id, home, init_args)
    }
}

/// Type name to factory map.
///
/// Injected into containers; cloning shares the registry.
#[derive(Clone, Default)]
pub struct FactoryRegistry {
    factories: Arc<RwLock<HashMap<String, Arc<dyn SharedObjectFactory>>>>,
}

impl std::fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

impl FactoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `type_name`, replacing any previous one.
    pub fn register(&self, type_name: impl Into<String>, factory: Arc<dyn SharedObjectFactory>) {
        self.factories.write().insert(type_name.into(), factory);
    }

    /// Register a closure as the factory for `type_name`.
    pub fn register_fn<F>(&self, type_name: impl Into<String>, factory: F)
    where
        F: Fn(&Id, &Id, &[u8]) -> Result<Box<dyn SharedObject>, SharedObjectError>
            + Send
            + Sync
            + 'static,
    {
        self.register(type_name, Arc::new(factory));
    }

    /// Factory for `type_name`.
    pub fn get(&self, type_name: &str) -> Option<Arc<dyn SharedObjectFactory>> {
        self.factories.read().get(type_name).cloned()
    }

    /// Whether `type_name` has a factory.
    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.read().contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Instantiate through the factory registered for `type_name`.
    pub fn create(
        &self,
        type_name: &str,
        object_id: &Id,
        home: &Id,
        init_args: &[u8],
    ) -> Result<Box<dyn SharedObject>, SharedObjectError> {
        let factory = self
            .get(type_name)
            .ok_or_else(|| SharedObjectError::UnknownFactory(type_name.to_string()))?;
        factory.create(object_id, home, init_args)
    }
}
