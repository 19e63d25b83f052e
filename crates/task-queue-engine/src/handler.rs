use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Result type for task handlers
pub type TaskResult = Result<Vec<u8>, String>;

/// Executable logic for one task name
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute the task with the given payload
    async fn execute(&self, payload: Vec<u8>) -> TaskResult;
}

/// Registry of task handlers keyed by task name.
///
/// The dispatcher consults it before assignment so a task is never handed
/// to a worker that has no way to run it.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for that name
    pub fn register<H: TaskHandler + 'static>(&self, name: impl Into<String>, handler: H) {
        self.handlers.write().insert(name.into(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().get(name).cloned()
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// Registered task names, sorted
    pub fn registered_handlers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }
}
