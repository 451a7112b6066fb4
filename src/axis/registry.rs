//! Component registry — the named handler table behind the message router.
//!
//! Components register under a string id ("scout", "sentinel", "executor",
//! "journal", ...). The router resolves recipients here and never holds
//! handler references of its own, so unregistering a component takes it
//! out of rotation immediately.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::warn;

use crate::axis::router::MessageHandler;

/// Named handler table.
pub struct ComponentRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler under a component id.
    ///
    /// Replaces any existing registration for the same id.
    pub async fn register(&self, component_id: &str, handler: Arc<dyn MessageHandler>) {
        let mut handlers = self.handlers.write().await;
        if handlers.insert(component_id.to_owned(), handler).is_some() {
            warn!(component = component_id, "replacing registered handler");
        }
    }

    /// Remove a registration. Returns whether one existed.
    pub async fn unregister(&self, component_id: &str) -> bool {
        self.handlers.write().await.remove(component_id).is_some()
    }

    /// Resolve a component id to its handler.
    pub async fn resolve(&self, component_id: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.read().await.get(component_id).cloned()
    }

    /// Ids of all registered components, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
