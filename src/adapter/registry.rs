//! Adapter registry
//!
//! Maps adapter ids to factories. Built once from configuration; rules
//! look their adapter up here at load time.

use std::collections::HashMap;
use std::sync::Arc;

use super::traits::AdapterFactory;
use crate::error::ConfigError;

/// Id to factory map
#[derive(Debug, Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn AdapterFactory>>,
    order: Vec<String>,
}

impl AdapterRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its own id.
    ///
    /// # Errors
    ///
    /// `ConfigError::DuplicateAdapterId` if the id is already taken.
    pub fn register(&mut self, adapter: Arc<dyn AdapterFactory>) -> Result<(), ConfigError> {
        let id = adapter.id().to_string();
        if self.adapters.contains_key(&id) {
            return Err(ConfigError::DuplicateAdapterId { id });
        }
        self.order.push(id.clone());
        self.adapters.insert(id, adapter);
        Ok(())
    }

    /// Look up a factory by id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn AdapterFactory>> {
        self.adapters.get(id).cloned()
    }

    /// Whether `id` is registered
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.adapters.contains_key(id)
    }

    /// Ids in registration order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Number of registered adapters
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
