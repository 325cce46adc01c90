//! Lookup of capabilities other extensions contribute, keyed by extension id

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::environment::discovery::EnvironmentDiscovery;

/// Id under which the Python environment capability is registered
pub const PYTHON_EXTENSION_ID: &str = "ms-python.python";

#[derive(Default)]
pub struct ExtensionRegistry {
    discovery: HashMap<String, Arc<dyn EnvironmentDiscovery>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any previous one under the same id
    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn EnvironmentDiscovery>) {
        let id = id.into();
        debug!("Registering environment discovery provider {}", id);
        self.discovery.insert(id, provider);
    }

    pub fn unregister(&mut self, id: &str) -> bool {
        self.discovery.remove(id).is_some()
    }

    pub fn environment_discovery(&self, id: &str) -> Option<Arc<dyn EnvironmentDiscovery>> {
        self.discovery.get(id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.discovery.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.ids().collect();
        ids.sort_unstable();
        f.debug_struct("ExtensionRegistry")
            .field("discovery", &ids)
            .finish()
    }
}
