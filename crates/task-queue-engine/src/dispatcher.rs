use crate::handler::HandlerRegistry;
use crate::queue::{QueueStore, QueuedTask};
use std::sync::Arc;
use task_queue_core::{Result, TaskError};

/// Picks the next queue entry a polling worker may run.
///
/// Selection only touches the Queue Store. Turning the entry into a lease is
/// the engine's job, since that needs storage.
pub struct Dispatcher {
    queues: Arc<QueueStore>,
    handlers: Arc<HandlerRegistry>,
    default_order: Vec<String>,
}

impl Dispatcher {
    pub fn new(
        queues: Arc<QueueStore>,
        handlers: Arc<HandlerRegistry>,
        default_order: Vec<String>,
    ) -> Self {
        Dispatcher {
            queues,
            handlers,
            default_order,
        }
    }

    /// Queues to scan: the worker's declared order, or the global default
    pub fn scan_order<'a>(&'a self, declared: &'a [String]) -> &'a [String] {
        if declared.is_empty() {
            &self.default_order
        } else {
            declared
        }
    }

    /// Whether a worker with `capabilities` can run tasks named `name`.
    ///
    /// Workers that report no capabilities are trusted to run anything the
    /// engine has a handler for.
    pub fn can_run(&self, name: &str, capabilities: &[String]) -> bool {
        if capabilities.is_empty() {
            self.handlers.has_handler(name)
        } else {
            capabilities.iter().any(|c| c == name)
        }
    }

    /// Dequeue the first eligible entry across `order`.
    ///
    /// Ineligible entries stay queued. Fails with `UnknownHandler` when the
    /// only thing found was a task no handler exists for, otherwise with
    /// `NoEligibleTask`.
    pub fn next_eligible(&self, order: &[String], capabilities: &[String]) -> Result<QueuedTask> {
        let mut missing_handler: Option<String> = None;

        for queue in order {
            let found = self.queues.dequeue_matching(queue, |entry| {
                if self.can_run(&entry.name, capabilities) {
                    return true;
                }
                if capabilities.is_empty() && missing_handler.is_none() {
                    missing_handler = Some(entry.name.clone());
                }
                false
            });

            if let Some(entry) = found {
                return Ok(entry);
            }
        }

        match missing_handler {
            Some(name) => Err(TaskError::UnknownHandler(name)),
            None => Err(TaskError::NoEligibleTask),
        }
    }
}
