//! Registry of task implementations, keyed by implementation name.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::runnable::runnable::TaskRunnable;

/// Registry mapping implementation keys to runnables.
///
/// Populated at startup; templates whose key resolves to nothing fall back
/// to the default execution in the executor.
pub struct RunnableRegistry {
    runnables: RwLock<HashMap<String, Arc<dyn TaskRunnable>>>,
}

impl RunnableRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            runnables: RwLock::new(HashMap::new()),
        }
    }

    /// Register an implementation under its key. Re-registering replaces.
    pub async fn register(&self, runnable: Arc<dyn TaskRunnable>) {
        let key = runnable.key().to_string();
        self.runnables.write().await.insert(key.clone(), runnable);
        tracing::debug!("Registered task implementation: {}", key);
    }

    /// Unregister an implementation.
    pub async fn unregister(&self, key: &str) -> Option<Arc<dyn TaskRunnable>> {
        self.runnables.write().await.remove(key)
    }

    /// Get an implementation by key.
    pub async fn get(&self, key: &str) -> Option<Arc<dyn TaskRunnable>> {
        self.runnables.read().await.get(key).cloned()
    }

    /// Check if an implementation exists.
    pub async fn has(&self, key: &str) -> bool {
        self.runnables.read().await.contains_key(key)
    }

    /// List all registered keys.
    pub async fn list(&self) -> Vec<String> {
        self.runnables.read().await.keys().cloned().collect()
    }

    /// Get the number of registered implementations.
    pub fn count(&self) -> usize {
        self.runnables.try_read().map(|r| r.len()).unwrap_or(0)
    }
}

impl Default for RunnableRegistry {
    fn default() -> Self {
        Self::new()
    }
}
