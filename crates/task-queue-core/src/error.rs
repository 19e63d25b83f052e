use crate::{TaskId, TaskStatus};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("No eligible task")]
    NoEligibleTask,

    #[error("No handler registered for task name: {0}")]
    UnknownHandler(String),

    #[error("Lease lost for task {0}")]
    LeaseLost(TaskId),

    #[error("Task cancelled: {0}")]
    TaskCancelled(TaskId),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Version conflict on task {task_id}: expected {expected}, found {actual}")]
    Conflict {
        task_id: TaskId,
        expected: u64,
        actual: u64,
    },

    #[error("Worker {0} already holds a lease")]
    WorkerBusy(String),

    #[error("Payload size exceeds maximum allowed size of {max} bytes (got {actual})")]
    PayloadTooLarge { max: usize, actual: usize },

    #[error("Invalid task status: {0}")]
    InvalidStatus(String),

    #[error("Invalid priority value: {0}")]
    InvalidPriority(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TaskError {
    /// Transient errors may succeed if the caller re-reads state and tries again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskError::StorageUnavailable(_) | TaskError::Conflict { .. }
        )
    }

    /// Errors that mean "the caller's claim on this attempt is gone".
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, TaskError::LeaseLost(_) | TaskError::TaskCancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_error_classification() {
        let id = Uuid::new_v4();
        assert!(TaskError::StorageUnavailable("down".into()).is_retryable());
        assert!(TaskError::Conflict { task_id: id, expected: 1, actual: 2 }.is_retryable());
        assert!(!TaskError::UnknownHandler("x".into()).is_retryable());
        assert!(!TaskError::NoEligibleTask.is_retryable());

        assert!(TaskError::LeaseLost(id).is_lease_lost());
        assert!(TaskError::TaskCancelled(id).is_lease_lost());
        assert!(!TaskError::NotFound("x".into()).is_lease_lost());
    }
}
