use std::sync::Arc;
use std::time::Duration;
use task_queue_core::Task;
use task_queue_engine::{TaskHandler, TaskResult};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error};

/// Runs one handler invocation under the task timeout.
///
/// The handler runs on its own tokio task so a panic turns into a failed
/// attempt instead of taking the worker down.
pub struct TaskExecutor {
    handler: Arc<dyn TaskHandler>,
    default_timeout: Duration,
}

/// Aborts the handler task when the execution future is dropped
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl TaskExecutor {
    pub fn new(handler: Arc<dyn TaskHandler>, default_timeout: Duration) -> Self {
        TaskExecutor {
            handler,
            default_timeout,
        }
    }

    pub async fn execute(&self, task: &Task) -> TaskResult {
        let task_id = task.id;
        let limit = task.lease_ttl(self.default_timeout);
        debug!("Executing task {} with timeout {:?}", task_id, limit);

        let handler = self.handler.clone();
        let payload = task.payload.clone();
        let mut running = AbortOnDrop(tokio::spawn(async move { handler.execute(payload).await }));

        match timeout(limit, &mut running.0).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.is_panic() => {
                error!("Task {} panicked: {:?}", task_id, e);
                Err("Task panicked during execution".to_string())
            }
            Ok(Err(_)) => Err("Task was cancelled".to_string()),
            Err(_) => {
                error!("Task {} timed out after {:?}", task_id, limit);
                Err(format!("Task execution timed out after {:?}", limit))
            }
        }
    }
}
