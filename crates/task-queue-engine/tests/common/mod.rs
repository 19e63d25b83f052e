#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use task_queue_core::{Task, TaskEvent, TaskId, TaskStatus};
use task_queue_engine::{
    Engine, EngineConfig, EventPublisher, HandlerRegistry, ManualClock, MemoryStorage,
    StorageError, TaskHandler, TaskResult, TaskStorage,
};

/// Memory storage that can be switched off or made to fail updates
#[derive(Default)]
pub struct FlakyStorage {
    inner: MemoryStorage,
    down: AtomicBool,
    failing_updates: AtomicU32,
}

impl FlakyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Make the next `n` update calls fail with `Unavailable`
    pub fn fail_updates(&self, n: u32) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("storage offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStorage for FlakyStorage {
    async fn save(&self, task: &Task) -> Result<(), StorageError> {
        self.check()?;
        self.inner.save(task).await
    }

    async fn load(&self, id: TaskId) -> Result<Task, StorageError> {
        self.check()?;
        self.inner.load(id).await
    }

    async fn update_status(&self, task: &Task, expected_version: u64) -> Result<(), StorageError> {
        self.check()?;
        let failing = self
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StorageError::Unavailable("write timed out".to_string()));
        }
        self.inner.update_status(task, expected_version).await
    }

    async fn list_by_queue(&self, queue: &str, status: TaskStatus) -> Result<Vec<Task>, StorageError> {
        self.check()?;
        self.inner.list_by_queue(queue, status).await
    }

    async fn list_queues(&self) -> Result<Vec<String>, StorageError> {
        self.check()?;
        self.inner.list_queues().await
    }
}

/// Keeps every published event
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<TaskEvent>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().clone()
    }

    /// Target statuses of the events for one task, in publish order
    pub fn statuses_of(&self, task_id: TaskId) -> Vec<TaskStatus> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.task_id == task_id)
            .map(|e| e.to)
            .collect()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: TaskEvent) {
        self.events.lock().push(event);
    }
}

pub struct Echo;

#[async_trait]
impl TaskHandler for Echo {
    async fn execute(&self, payload: Vec<u8>) -> TaskResult {
        Ok(payload)
    }
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub storage: Arc<FlakyStorage>,
    pub events: Arc<RecordingPublisher>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn advance_ms(&self, ms: i64) {
        self.clock.advance(ChronoDuration::milliseconds(ms));
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.engine.now()
    }

    /// A second engine over the same storage and clock, as after a restart
    pub fn restart(&self) -> Harness {
        engine_on(config(), self.storage.clone(), self.clock.clone(), &["echo", "flaky"])
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Defaults with fast storage retries
pub fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.storage.retry_base_delay_ms = 1;
    config.engine.max_poll_wait_ms = 5_000;
    config
}

pub fn harness() -> Harness {
    harness_with(config())
}

pub fn harness_with(config: EngineConfig) -> Harness {
    engine_on(
        config,
        Arc::new(FlakyStorage::new()),
        Arc::new(ManualClock::new(start_time())),
        &["echo", "flaky"],
    )
}

pub fn engine_on(
    config: EngineConfig,
    storage: Arc<FlakyStorage>,
    clock: Arc<ManualClock>,
    handlers: &[&str],
) -> Harness {
    let registry = Arc::new(HandlerRegistry::new());
    for name in handlers {
        registry.register(*name, Echo);
    }
    let events = Arc::new(RecordingPublisher::default());

    let engine = Engine::with_clock(
        config,
        storage.clone(),
        events.clone(),
        registry,
        clock.clone(),
    )
    .unwrap();

    Harness {
        engine: Arc::new(engine),
        storage,
        events,
        clock,
    }
}

pub fn names(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
