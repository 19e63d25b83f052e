mod backoff;
mod error;
mod event;
mod priority;
mod task;

pub use backoff::{BackoffPolicy, BackoffStrategy, RetryDecision};
pub use error::{Result, TaskError};
pub use event::TaskEvent;
pub use priority::Priority;
pub use task::{Task, TaskId, TaskPayload, TaskSpec, TaskStatus, DEFAULT_QUEUE};

pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024; // 10MB
