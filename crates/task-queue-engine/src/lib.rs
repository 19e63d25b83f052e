//! Scheduling engine for the task queue.
//!
//! `Engine` is the entry point: submit tasks, let workers poll for them,
//! report outcomes, and run the background promotion and lease sweep.

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod handler;
pub mod lease;
pub mod metrics;
pub mod queue;
pub mod storage;
pub mod worker_registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{Engine, QueueStats, RecoveryReport};
pub use events::{BroadcastPublisher, EventPublisher, NoopPublisher};
pub use handler::{HandlerRegistry, TaskHandler, TaskResult};
pub use lease::Lease;
pub use metrics::EngineMetrics;
pub use storage::{MemoryStorage, StorageError, StorageRetry, TaskStorage};
pub use worker_registry::WorkerSnapshot;
