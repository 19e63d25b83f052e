use crate::{Priority, Result, TaskError, MAX_PAYLOAD_SIZE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a task
pub type TaskId = Uuid;

/// Task payload and result (opaque bytes, interpreted by handlers)
pub type TaskPayload = Vec<u8>;

/// Queue used when a submission does not name one
pub const DEFAULT_QUEUE: &str = "default";

/// Lifecycle status of a task.
///
/// ```text
/// pending -> running -> completed | failed | retrying | cancelled
/// retrying -> pending | cancelled
/// pending -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be dispatched (possibly not before `scheduled_at`)
    Pending,
    /// Leased to a worker
    Running,
    /// Finished successfully
    Completed,
    /// Retries exhausted
    Failed,
    /// Failed attempt, waiting out its backoff delay
    Retrying,
    /// Cancelled by a client or a queue purge
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Retrying,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Retrying)
                | (Running, Cancelled)
                | (Retrying, Pending)
                | (Retrying, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "retrying" => Ok(TaskStatus::Retrying),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(TaskError::InvalidStatus(other.to_string())),
        }
    }
}

/// Complete task record with all lifecycle metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier, immutable after creation
    pub id: TaskId,

    /// Logical name, selects the handler (e.g. "send_email")
    pub name: String,

    /// Queue partition
    pub queue: String,

    pub priority: Priority,

    pub status: TaskStatus,

    /// Handler-interpreted input, max 10MB
    pub payload: TaskPayload,

    /// Set on success
    pub result: Option<TaskPayload>,

    /// Set on failure (last error of the most recent failed attempt)
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Not eligible for dispatch before this instant. Also holds the retry
    /// instant while the task is `Retrying`.
    pub scheduled_at: Option<DateTime<Utc>>,

    /// Start of the current (or last) attempt
    pub started_at: Option<DateTime<Utc>>,

    /// Set once the task reaches a terminal status
    pub completed_at: Option<DateTime<Utc>>,

    pub updated_at: DateTime<Utc>,

    /// Retries allowed after the first attempt
    pub max_retries: u32,

    /// Retries consumed so far
    pub retry_count: u32,

    /// Overrides the engine's backoff base when set
    pub retry_delay: Option<Duration>,

    /// Execution timeout, also the lease TTL. Zero means engine default.
    pub timeout: Duration,

    /// Worker holding the lease (only while running)
    pub worker_id: Option<String>,

    /// Deadline of the current lease, kept for restart recovery
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Optimistic concurrency counter, bumped on every persisted update
    pub version: u64,
}

impl Task {
    /// Create a pending task from a submission spec
    pub fn from_spec(spec: TaskSpec, now: DateTime<Utc>) -> Result<Self> {
        check_payload_size(spec.payload.len())?;

        Ok(Task {
            id: Uuid::new_v4(),
            name: spec.name,
            queue: spec.queue,
            priority: spec.priority,
            status: TaskStatus::Pending,
            payload: spec.payload,
            result: None,
            error: None,
            created_at: now,
            scheduled_at: spec.scheduled_at,
            started_at: None,
            completed_at: None,
            updated_at: now,
            max_retries: spec.max_retries,
            retry_count: 0,
            retry_delay: spec.retry_delay,
            timeout: spec.timeout,
            worker_id: None,
            lease_expires_at: None,
            version: 0,
        })
    }

    /// Create a new task builder
    pub fn builder(name: impl Into<String>, payload: TaskPayload) -> TaskSpec {
        TaskSpec::new(name, payload)
    }

    /// Check that the task may be dispatched at `now`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.map_or(true, |at| at <= now)
    }

    /// Check if task can be retried after another failure
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Lease duration for an attempt of this task
    pub fn lease_ttl(&self, default: Duration) -> Duration {
        if self.timeout.is_zero() {
            default
        } else {
            self.timeout
        }
    }

    fn transition(&mut self, to: TaskStatus, now: DateTime<Utc>) -> Result<TaskStatus> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(TaskError::InvalidTransition {
                task_id: self.id,
                from,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(from)
    }

    fn clear_lease(&mut self) {
        self.worker_id = None;
        self.lease_expires_at = None;
    }

    /// Mark task as dispatched to a worker
    pub fn start(
        &mut self,
        worker_id: impl Into<String>,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(TaskStatus::Running, now)?;
        self.started_at = Some(now);
        self.worker_id = Some(worker_id.into());
        self.lease_expires_at = Some(lease_expires_at);
        Ok(())
    }

    /// Mark task as completed successfully
    pub fn complete(&mut self, result: TaskPayload, now: DateTime<Utc>) -> Result<()> {
        check_payload_size(result.len())?;
        self.transition(TaskStatus::Completed, now)?;
        self.result = Some(result);
        self.completed_at = Some(now);
        self.clear_lease();
        Ok(())
    }

    /// Consume one retry and hold the task until `retry_at`
    pub fn schedule_retry(
        &mut self,
        error: String,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(TaskStatus::Retrying, now)?;
        self.retry_count += 1;
        self.error = Some(error);
        self.scheduled_at = Some(retry_at);
        self.clear_lease();
        Ok(())
    }

    /// Mark task as permanently failed
    pub fn fail(&mut self, error: String, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Failed, now)?;
        self.error = Some(error);
        self.completed_at = Some(now);
        self.clear_lease();
        Ok(())
    }

    /// Retry delay elapsed, make the task dispatchable again
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Pending, now)?;
        self.started_at = None;
        Ok(())
    }

    /// Cancel a task that has not reached a terminal status
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<TaskStatus> {
        let from = self.transition(TaskStatus::Cancelled, now)?;
        self.completed_at = Some(now);
        self.clear_lease();
        Ok(from)
    }
}

fn check_payload_size(actual: usize) -> Result<()> {
    if actual > MAX_PAYLOAD_SIZE {
        return Err(TaskError::PayloadTooLarge {
            max: MAX_PAYLOAD_SIZE,
            actual,
        });
    }
    Ok(())
}

/// Builder describing a task submission
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub queue: String,
    pub payload: TaskPayload,
    pub priority: Priority,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: u32,
    pub retry_delay: Option<Duration>,
    pub timeout: Duration,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, payload: TaskPayload) -> Self {
        TaskSpec {
            name: name.into(),
            queue: DEFAULT_QUEUE.to_string(),
            payload,
            priority: Priority::default(),
            scheduled_at: None,
            max_retries: 3,
            retry_delay: None,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn task() -> Task {
        Task::from_spec(TaskSpec::new("test", b"payload".to_vec()), Utc::now()).unwrap()
    }

    #[test]
    fn test_task_creation() {
        let task = task();

        assert_eq!(task.name, "test");
        assert_eq!(task.queue, DEFAULT_QUEUE);
        assert_eq!(task.payload, b"payload");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.version, 0);
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn test_task_builder() {
        let scheduled = Utc::now() + ChronoDuration::hours(1);
        let spec = Task::builder("report", b"data".to_vec())
            .queue("reports")
            .priority(Priority::High)
            .scheduled_at(scheduled)
            .max_retries(5)
            .retry_delay(Duration::from_secs(2))
            .timeout(Duration::from_secs(600));
        let task = Task::from_spec(spec, Utc::now()).unwrap();

        assert_eq!(task.queue, "reports");
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.max_retries, 5);
        assert_eq!(task.retry_delay, Some(Duration::from_secs(2)));
        assert_eq!(task.timeout, Duration::from_secs(600));
        assert!(!task.is_ready(Utc::now()));
        assert!(task.is_ready(scheduled));
    }

    #[test]
    fn test_payload_size_limit() {
        let spec = TaskSpec::new("big", vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        match Task::from_spec(spec, Utc::now()) {
            Err(TaskError::PayloadTooLarge { .. }) => {}
            other => panic!("Expected PayloadTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_successful_lifecycle() {
        let mut task = task();
        let now = Utc::now();

        task.start("worker-1", now + ChronoDuration::seconds(30), now).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.worker_id.as_deref(), Some("worker-1"));
        assert_eq!(task.started_at, Some(now));

        task.complete(b"done".to_vec(), now).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(b"done".to_vec()));
        assert!(task.worker_id.is_none());
        assert!(task.lease_expires_at.is_none());
        assert_eq!(task.completed_at, Some(now));
    }

    #[test]
    fn test_retry_lifecycle() {
        let mut task = task();
        let now = Utc::now();
        let retry_at = now + ChronoDuration::seconds(1);

        task.start("worker-1", now, now).unwrap();
        task.schedule_retry("boom".to_string(), retry_at, now).unwrap();
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert_eq!(task.scheduled_at, Some(retry_at));
        assert!(!task.is_ready(now));

        task.requeue(retry_at).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.started_at.is_none());
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut task = task();
        let now = Utc::now();
        task.start("worker-1", now, now).unwrap();
        task.complete(vec![], now).unwrap();

        assert!(matches!(
            task.complete(vec![], now),
            Err(TaskError::InvalidTransition { .. })
        ));
        assert!(matches!(
            task.cancel(now),
            Err(TaskError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_cancel_from_each_live_state() {
        let now = Utc::now();

        let mut pending = task();
        assert_eq!(pending.cancel(now).unwrap(), TaskStatus::Pending);

        let mut running = task();
        running.start("w", now, now).unwrap();
        assert_eq!(running.cancel(now).unwrap(), TaskStatus::Running);
        assert!(running.worker_id.is_none());

        let mut retrying = task();
        retrying.start("w", now, now).unwrap();
        retrying.schedule_retry("e".into(), now, now).unwrap();
        assert_eq!(retrying.cancel(now).unwrap(), TaskStatus::Retrying);
    }

    #[test]
    fn test_transition_table() {
        use TaskStatus::*;
        for status in TaskStatus::ALL {
            if status.is_terminal() {
                for to in TaskStatus::ALL {
                    assert!(!status.can_transition_to(to));
                }
            }
        }
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Retrying.can_transition_to(Running));
        assert!(Retrying.can_transition_to(Pending));
        assert_eq!("retrying".parse::<TaskStatus>(), Ok(Retrying));
        assert_eq!("Cancelled".parse::<TaskStatus>(), Ok(Cancelled));
        assert_eq!(
            "in_progress".parse::<TaskStatus>(),
            Err(TaskError::InvalidStatus("in_progress".to_string()))
        );
    }

    #[test]
    fn test_lease_ttl_defaults_when_zero() {
        let mut task = task();
        task.timeout = Duration::ZERO;
        assert_eq!(task.lease_ttl(Duration::from_secs(30)), Duration::from_secs(30));
        task.timeout = Duration::from_secs(5);
        assert_eq!(task.lease_ttl(Duration::from_secs(30)), Duration::from_secs(5));
    }
}
