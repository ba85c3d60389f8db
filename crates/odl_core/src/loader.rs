//! Plugin module resolution

use crate::error::DataLayerError;
use crate::plugin::PluginFactory;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Resolves a plugin id to the factory that constructs it.
///
/// Loads may complete immediately or arbitrarily later, and completions
/// for different ids carry no ordering guarantee.
#[async_trait]
pub trait PluginLoader: Send + Sync + 'static {
    async fn load(&self, id: &str) -> Result<Arc<dyn PluginFactory>>;
}

/// Static id → factory table
#[derive(Clone, Default)]
pub struct ModuleMappings {
    modules: HashMap<String, Arc<dyn PluginFactory>>,
}

impl ModuleMappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, id: impl Into<String>, factory: Arc<dyn PluginFactory>) -> Self {
        self.insert(id, factory);
        self
    }

    pub fn insert(&mut self, id: impl Into<String>, factory: Arc<dyn PluginFactory>) {
        self.modules.insert(id.into(), factory);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn PluginFactory>> {
        self.modules.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.modules.contains_key(id)
    }

    /// Add every mapping from `other`, replacing duplicates
    pub fn merge(&mut self, other: ModuleMappings) {
        self.modules.extend(other.modules);
    }

    /// Known ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.modules.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl fmt::Debug for ModuleMappings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleMappings").field("ids", &self.ids()).finish()
    }
}

#[async_trait]
impl PluginLoader for ModuleMappings {
    async fn load(&self, id: &str) -> Result<Arc<dyn PluginFactory>> {
        self.get(id)
            .ok_or_else(|| DataLayerError::PluginNotFound(id.to_string()))
    }
}
