//! Storage port: the narrow contract the engine uses to persist task records.
//!
//! The engine never assumes a particular backend. `MemoryStorage` is the
//! in-process implementation used by tests and the demo worker binary.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::time::Duration;
use task_queue_core::{Task, TaskError, TaskId, TaskStatus};
use thiserror::Error;
use tracing::warn;

/// Upper bound on the wait between storage attempts
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Version conflict on task {task_id}: expected {expected}, found {actual}")]
    Conflict {
        task_id: TaskId,
        expected: u64,
        actual: u64,
    },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<StorageError> for TaskError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) => TaskError::NotFound(id.to_string()),
            StorageError::Conflict {
                task_id,
                expected,
                actual,
            } => TaskError::Conflict {
                task_id,
                expected,
                actual,
            },
            StorageError::Unavailable(msg) => TaskError::StorageUnavailable(msg),
        }
    }
}

/// Durable home of task records
#[async_trait]
pub trait TaskStorage: Send + Sync {
    /// Store a freshly created record
    async fn save(&self, task: &Task) -> Result<(), StorageError>;

    async fn load(&self, id: TaskId) -> Result<Task, StorageError>;

    /// Replace the stored record only if its version still equals
    /// `expected_version`. The caller has already bumped `task.version`.
    async fn update_status(&self, task: &Task, expected_version: u64)
        -> Result<(), StorageError>;

    async fn list_by_queue(
        &self,
        queue: &str,
        status: TaskStatus,
    ) -> Result<Vec<Task>, StorageError>;

    /// Every queue name that has at least one stored record
    async fn list_queues(&self) -> Result<Vec<String>, StorageError>;
}

/// Bounded retry with exponential backoff for storage calls.
///
/// Only `Unavailable` is retried. `NotFound` and `Conflict` are answers, not
/// failures, and go straight back to the caller.
#[derive(Debug, Clone, Copy)]
pub struct StorageRetry {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl StorageRetry {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        StorageRetry {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(StorageError::Unavailable(msg)) if attempt < self.attempts => {
                    let delay = self.delay_before(attempt + 1);
                    warn!(
                        "Storage {} failed (attempt {}/{}): {}, retrying in {:?}",
                        op_name, attempt, self.attempts, msg, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Wait before `attempt` (the second attempt waits `base_delay`)
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(2));
        self.base_delay
            .checked_mul(factor)
            .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
    }
}

impl Default for StorageRetry {
    fn default() -> Self {
        StorageRetry::new(3, Duration::from_millis(50))
    }
}

/// In-memory task storage
#[derive(Default)]
pub struct MemoryStorage {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TaskStorage for MemoryStorage {
    async fn save(&self, task: &Task) -> Result<(), StorageError> {
        self.tasks.write().insert(task.id, task.clone());
        Ok(())
    }

    async fn load(&self, id: TaskId) -> Result<Task, StorageError> {
        self.tasks
            .read()
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound(id))
    }

    async fn update_status(
        &self,
        task: &Task,
        expected_version: u64,
    ) -> Result<(), StorageError> {
        let mut tasks = self.tasks.write();
        let stored = tasks
            .get_mut(&task.id)
            .ok_or(StorageError::NotFound(task.id))?;

        if stored.version != expected_version {
            return Err(StorageError::Conflict {
                task_id: task.id,
                expected: expected_version,
                actual: stored.version,
            });
        }

        *stored = task.clone();
        Ok(())
    }

    async fn list_by_queue(
        &self,
        queue: &str,
        status: TaskStatus,
    ) -> Result<Vec<Task>, StorageError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.queue == queue && t.status == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn list_queues(&self) -> Result<Vec<String>, StorageError> {
        let queues: BTreeSet<String> = self
            .tasks
            .read()
            .values()
            .map(|t| t.queue.clone())
            .collect();
        Ok(queues.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use task_queue_core::TaskSpec;

    fn task(queue: &str) -> Task {
        Task::from_spec(TaskSpec::new("test", vec![1]).queue(queue), Utc::now()).unwrap()
    }

    #[test]
    fn test_retry_delay_doubles_up_to_cap() {
        let retry = StorageRetry::new(5, Duration::from_millis(50));
        assert_eq!(retry.delay_before(2), Duration::from_millis(50));
        assert_eq!(retry.delay_before(3), Duration::from_millis(100));
        assert_eq!(retry.delay_before(4), Duration::from_millis(200));

        let huge = StorageRetry::new(40, Duration::from_secs(u64::MAX / 4));
        assert_eq!(huge.delay_before(2), MAX_RETRY_DELAY);
        assert_eq!(huge.delay_before(40), MAX_RETRY_DELAY);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let storage = MemoryStorage::new();
        let task = task("default");

        storage.save(&task).await.unwrap();
        assert_eq!(storage.load(task.id).await.unwrap(), task);
        assert!(matches!(
            storage.load(uuid::Uuid::new_v4()).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_checks_version() {
        let storage = MemoryStorage::new();
        let mut task = task("default");
        storage.save(&task).await.unwrap();

        task.version = 1;
        storage.update_status(&task, 0).await.unwrap();

        // A second writer still holding version 0 loses
        let mut stale = task.clone();
        stale.version = 1;
        match storage.update_status(&stale, 0).await {
            Err(StorageError::Conflict { expected, actual, .. }) => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("Expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_by_queue_and_queues() {
        let storage = MemoryStorage::new();
        storage.save(&task("emails")).await.unwrap();
        storage.save(&task("emails")).await.unwrap();
        storage.save(&task("reports")).await.unwrap();

        let emails = storage
            .list_by_queue("emails", TaskStatus::Pending)
            .await
            .unwrap();
        assert_eq!(emails.len(), 2);
        assert!(storage
            .list_by_queue("emails", TaskStatus::Running)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(storage.list_queues().await.unwrap(), vec!["emails", "reports"]);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_budget() {
        let retry = StorageRetry::new(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry
            .run("save", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::Unavailable("down".into()))
            })
            .await;

        assert!(matches!(result, Err(StorageError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_recovers_and_skips_conflicts() {
        let retry = StorageRetry::new(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result = retry
            .run("load", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StorageError::Unavailable("blip".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);

        let conflicts = AtomicU32::new(0);
        let id = uuid::Uuid::new_v4();
        let result: Result<(), _> = retry
            .run("update", || async {
                conflicts.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::Conflict { task_id: id, expected: 0, actual: 1 })
            })
            .await;
        assert!(matches!(result, Err(StorageError::Conflict { .. })));
        assert_eq!(conflicts.load(Ordering::SeqCst), 1);
    }
}
