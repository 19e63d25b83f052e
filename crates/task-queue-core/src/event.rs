use crate::{TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One lifecycle transition, emitted after it has been persisted.
///
/// `from` is `None` for the creation event of a submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub queue: String,
    pub from: Option<TaskStatus>,
    pub to: TaskStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl TaskEvent {
    pub fn transition(
        task_id: TaskId,
        queue: impl Into<String>,
        from: TaskStatus,
        to: TaskStatus,
        timestamp: DateTime<Utc>,
    ) -> Self {
        TaskEvent {
            task_id,
            queue: queue.into(),
            from: Some(from),
            to,
            timestamp,
            worker_id: None,
        }
    }

    pub fn created(
        task_id: TaskId,
        queue: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        TaskEvent {
            task_id,
            queue: queue.into(),
            from: None,
            to: TaskStatus::Pending,
            timestamp,
            worker_id: None,
        }
    }

    pub fn with_worker(mut self, worker_id: Option<String>) -> Self {
        self.worker_id = worker_id;
        self
    }
}
