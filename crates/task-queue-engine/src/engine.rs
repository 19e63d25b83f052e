use crate::clock::{deadline_after, Clock, SystemClock};
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::events::EventPublisher;
use crate::handler::HandlerRegistry;
use crate::lease::{Lease, LeaseManager};
use crate::metrics::EngineMetrics;
use crate::queue::{QueueStore, QueuedTask};
use crate::storage::{StorageError, StorageRetry, TaskStorage};
use crate::worker_registry::{WorkerRegistry, WorkerSnapshot};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use task_queue_core::{
    BackoffPolicy, Result, RetryDecision, Task, TaskError, TaskEvent, TaskId, TaskSpec,
    TaskStatus,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Re-reads allowed when an optimistic update loses a race
const CONFLICT_RETRIES: usize = 5;

/// Snapshot of one queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue: String,
    pub ready_count: usize,
    /// Waiting for `scheduled_at` or a retry delay
    pub scheduled_count: usize,
    pub running_count: usize,
    pub oldest_ready_age: Option<Duration>,
}

/// What `Engine::recover` rebuilt from storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub pending: usize,
    pub retrying: usize,
    pub running: usize,
    pub reclaimed: usize,
}

/// The scheduling engine.
///
/// Owns the Queue Store, the lease and worker tables and the dispatcher.
/// Task records live behind the storage port; every transition is persisted
/// with an optimistic version check before its event is published.
pub struct Engine {
    config: EngineConfig,
    storage: Arc<dyn TaskStorage>,
    publisher: Arc<dyn EventPublisher>,
    handlers: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    queues: Arc<QueueStore>,
    dispatcher: Dispatcher,
    leases: LeaseManager,
    workers: WorkerRegistry,
    backoff: BackoffPolicy,
    storage_retry: StorageRetry,
    metrics: EngineMetrics,
    shutdown: Notify,
    stopping: AtomicBool,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        storage: Arc<dyn TaskStorage>,
        publisher: Arc<dyn EventPublisher>,
        handlers: Arc<HandlerRegistry>,
    ) -> anyhow::Result<Self> {
        Self::with_clock(config, storage, publisher, handlers, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: EngineConfig,
        storage: Arc<dyn TaskStorage>,
        publisher: Arc<dyn EventPublisher>,
        handlers: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let queues = Arc::new(QueueStore::new());
        let dispatcher = Dispatcher::new(
            queues.clone(),
            handlers.clone(),
            config.engine.default_queue_order.clone(),
        );
        let storage_retry = StorageRetry::new(
            config.storage.retry_attempts,
            Duration::from_millis(config.storage.retry_base_delay_ms),
        );
        let workers = WorkerRegistry::new(config.worker_timeout());
        let backoff = config.backoff_policy();
        let metrics = EngineMetrics::new()?;

        Ok(Engine {
            config,
            storage,
            publisher,
            handlers,
            clock,
            queues,
            dispatcher,
            leases: LeaseManager::new(),
            workers,
            backoff,
            storage_retry,
            metrics,
            shutdown: Notify::new(),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ---- storage helpers ----

    async fn load(&self, task_id: TaskId) -> std::result::Result<Task, StorageError> {
        self.storage_retry
            .run("load", || self.storage.load(task_id))
            .await
    }

    async fn persist(
        &self,
        task: &Task,
        expected_version: u64,
    ) -> std::result::Result<(), StorageError> {
        self.storage_retry
            .run("update", || self.storage.update_status(task, expected_version))
            .await
    }

    /// Convert a storage error for the caller, logging exhausted retries
    fn surface(&self, err: StorageError) -> TaskError {
        if let StorageError::Unavailable(msg) = &err {
            error!(
                "Storage unavailable after {} attempts: {}",
                self.storage_retry.attempts, msg
            );
        }
        err.into()
    }

    fn record_transition(&self, task: &Task, from: TaskStatus, worker_id: Option<&str>) {
        debug!("Task {} {} -> {}", task.id, from, task.status);
        self.metrics.inc_transition(task.status, &task.queue);
        self.publisher.publish(
            TaskEvent::transition(task.id, task.queue.clone(), from, task.status, task.updated_at)
                .with_worker(worker_id.map(str::to_string)),
        );
    }

    fn refresh_gauges(&self, queue: &str) {
        self.metrics
            .set_queue_depth(queue, self.queues.ready_count(queue));
        self.metrics.tasks_running.set(self.leases.len() as i64);
    }

    // ---- administrative operations ----

    /// Persist a new task and make it dispatchable (now or at `scheduled_at`)
    pub async fn submit(&self, spec: TaskSpec) -> Result<TaskId> {
        let now = self.clock.now();
        let task = Task::from_spec(spec, now)?;

        self.storage_retry
            .run("save", || self.storage.save(&task))
            .await
            .map_err(|e| self.surface(e))?;

        self.queues.enqueue_task(&task, now);
        self.metrics.inc_transition(TaskStatus::Pending, &task.queue);
        self.refresh_gauges(&task.queue);
        self.publisher
            .publish(TaskEvent::created(task.id, task.queue.clone(), now));

        info!(
            "Submitted task {} ({}) to queue {} with priority {}",
            task.id, task.name, task.queue, task.priority
        );
        Ok(task.id)
    }

    pub async fn get(&self, task_id: TaskId) -> Result<Task> {
        self.load(task_id).await.map_err(|e| self.surface(e))
    }

    pub async fn list_tasks(&self, queue: &str, status: TaskStatus) -> Result<Vec<Task>> {
        self.storage_retry
            .run("list", || self.storage.list_by_queue(queue, status))
            .await
            .map_err(|e| self.surface(e))
    }

    /// Cancel a task that has not reached a terminal status.
    ///
    /// A running task loses its lease; the worker's later report is rejected
    /// with `TaskCancelled`.
    pub async fn cancel(&self, task_id: TaskId) -> Result<Task> {
        let mut attempt = 1;
        loop {
            let task = self.get(task_id).await?;
            match self.cancel_loaded(task).await {
                Err(TaskError::Conflict { .. }) if attempt < CONFLICT_RETRIES => {
                    debug!("Cancel of task {} raced another update, re-reading", task_id);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn cancel_loaded(&self, mut task: Task) -> Result<Task> {
        let now = self.clock.now();
        let expected = task.version;
        let holder = task.worker_id.clone();

        let from = task.cancel(now)?;
        task.version = expected + 1;
        self.persist(&task, expected)
            .await
            .map_err(|e| self.surface(e))?;

        // Stored first, so a report racing the revoke already sees Cancelled
        if from == TaskStatus::Running {
            if let Some(lease) = self.leases.revoke(&task.id) {
                self.workers.clear_task(&lease.worker_id, &task.id);
            }
        } else {
            self.queues.remove(&task.queue, &task.id);
        }

        self.record_transition(&task, from, holder.as_deref());
        self.refresh_gauges(&task.queue);
        info!("Cancelled task {} (was {})", task.id, from);
        Ok(task)
    }

    /// Cancel every task of `queue` that is not running yet, including tasks
    /// waiting out a retry delay. Returns how many were cancelled.
    pub async fn purge_queue(&self, queue: &str) -> Result<usize> {
        let mut purged = 0;
        for status in [TaskStatus::Pending, TaskStatus::Retrying] {
            for task in self.list_tasks(queue, status).await? {
                if self.cancel_waiting(task).await? {
                    purged += 1;
                }
            }
        }

        info!("Purged {} tasks from queue {}", purged, queue);
        Ok(purged)
    }

    async fn cancel_waiting(&self, mut task: Task) -> Result<bool> {
        let mut attempt = 1;
        loop {
            if !matches!(task.status, TaskStatus::Pending | TaskStatus::Retrying) {
                return Ok(false);
            }
            let task_id = task.id;
            match self.cancel_loaded(task).await {
                Ok(_) => return Ok(true),
                Err(TaskError::Conflict { .. }) if attempt < CONFLICT_RETRIES => {
                    attempt += 1;
                    task = match self.load(task_id).await {
                        Ok(task) => task,
                        Err(StorageError::NotFound(_)) => return Ok(false),
                        Err(e) => return Err(self.surface(e)),
                    };
                }
                Err(TaskError::InvalidTransition { .. }) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }

    pub fn queue_stats(&self, queue: &str) -> QueueStats {
        let now = self.clock.now();
        QueueStats {
            queue: queue.to_string(),
            ready_count: self.queues.ready_count(queue),
            scheduled_count: self.queues.scheduled_count(queue),
            running_count: self.leases.running_in(queue),
            oldest_ready_age: self
                .queues
                .oldest_ready(queue)
                .and_then(|at| (now - at).to_std().ok()),
        }
    }

    /// Stats for every queue known to storage or the Queue Store
    pub async fn list_queues(&self) -> Result<Vec<QueueStats>> {
        let stored = self
            .storage_retry
            .run("list_queues", || self.storage.list_queues())
            .await
            .map_err(|e| self.surface(e))?;

        let mut names: BTreeSet<String> = stored.into_iter().collect();
        names.extend(self.queues.queue_names());
        Ok(names.iter().map(|queue| self.queue_stats(queue)).collect())
    }

    pub fn list_workers(&self) -> Vec<WorkerSnapshot> {
        self.workers.all_workers()
    }

    pub fn get_worker(&self, worker_id: &str) -> Result<WorkerSnapshot> {
        self.workers
            .get(worker_id)
            .ok_or_else(|| TaskError::NotFound(format!("worker {}", worker_id)))
    }

    // ---- worker-facing operations ----

    /// Assign the next eligible task to `worker_id` without waiting.
    ///
    /// `queues` is scanned in order (the configured default order when
    /// empty). Fails with `NoEligibleTask` when nothing is ready.
    pub async fn request_task(
        &self,
        worker_id: &str,
        queues: &[String],
        capabilities: &[String],
    ) -> Result<Task> {
        let _timer = self.metrics.dispatch_duration.start_timer();
        let now = self.clock.now();

        if self.workers.touch(worker_id, queues, now) {
            info!("Registered new worker: {}", worker_id);
            self.metrics
                .workers_connected
                .set(self.workers.count_alive(now) as i64);
        }

        if let Some(task_id) = self.workers.leased_task(worker_id) {
            let holds = self
                .leases
                .get(&task_id)
                .map_or(false, |lease| lease.worker_id == worker_id);
            if holds {
                return Err(TaskError::WorkerBusy(worker_id.to_string()));
            }
            self.workers.clear_task(worker_id, &task_id);
        }

        let order = self.dispatcher.scan_order(queues);
        loop {
            let entry = match self.dispatcher.next_eligible(order, capabilities) {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Nothing to assign to worker {}: {}", worker_id, e);
                    return Err(e);
                }
            };

            // Stale entries are dropped and the scan continues
            if let Some(task) = self.try_assign(entry, worker_id).await? {
                return Ok(task);
            }
        }
    }

    async fn try_assign(&self, entry: QueuedTask, worker_id: &str) -> Result<Option<Task>> {
        let mut task = match self.load(entry.task_id).await {
            Ok(task) => task,
            Err(StorageError::NotFound(_)) => {
                warn!("Dropping queue entry for missing task {}", entry.task_id);
                return Ok(None);
            }
            Err(e) => {
                self.queues.restore(entry);
                return Err(self.surface(e));
            }
        };

        if task.status != TaskStatus::Pending {
            debug!("Dropping stale queue entry for task {} ({})", task.id, task.status);
            return Ok(None);
        }

        let now = self.clock.now();
        let ttl = task.lease_ttl(self.config.default_lease_ttl());
        let expires_at = deadline_after(now, ttl);
        let expected = task.version;
        task.start(worker_id, expires_at, now)?;
        task.version = expected + 1;

        let lease = self
            .leases
            .acquire_until(task.id, worker_id, &task.queue, ttl, now, expires_at);

        match self.persist(&task, expected).await {
            Ok(()) => {}
            Err(e @ StorageError::Unavailable(_)) => {
                // Back to the front of its queue, nothing is lost
                self.leases.release(&lease);
                self.queues.restore(entry);
                return Err(self.surface(e));
            }
            Err(e) => {
                debug!("Task {} changed while being dispatched: {}", task.id, e);
                self.leases.release(&lease);
                return Ok(None);
            }
        }

        self.workers.assign_task(worker_id, task.id);
        self.record_transition(&task, TaskStatus::Pending, Some(worker_id));
        self.refresh_gauges(&task.queue);

        info!(
            "Assigned task {} ({}) to worker {}, lease until {}",
            task.id, task.name, worker_id, expires_at
        );
        Ok(Some(task))
    }

    /// `request_task` with a bounded wait for work to arrive.
    ///
    /// Returns `Ok(None)` when nothing became available within `wait`
    /// (clamped to `max_poll_wait_ms`).
    pub async fn poll_task(
        &self,
        worker_id: &str,
        queues: &[String],
        capabilities: &[String],
        wait: Duration,
    ) -> Result<Option<Task>> {
        let deadline = tokio::time::Instant::now() + wait.min(self.config.max_poll_wait());

        loop {
            let notified = self.queues.ready_notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.request_task(worker_id, queues, capabilities).await {
                Ok(task) => return Ok(Some(task)),
                Err(TaskError::NoEligibleTask) => {}
                Err(e) => return Err(e),
            }

            if self.stopping.load(Ordering::Acquire) {
                return Ok(None);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Heartbeat for a running task, extending its lease by the lease TTL
    pub async fn renew_lease(&self, task_id: TaskId, worker_id: &str) -> Result<Lease> {
        let now = self.clock.now();
        let lease = match self.leases.renew(task_id, worker_id, now) {
            Ok(lease) => lease,
            Err(_) => return Err(self.lost_lease_error(task_id).await),
        };

        self.workers.heartbeat(worker_id, now);
        self.persist_lease_deadline(&lease).await?;
        debug!("Renewed lease on task {} until {}", task_id, lease.expires_at);
        Ok(lease)
    }

    /// Keep the stored deadline close to the live one for restart recovery.
    /// The in-memory lease stays authoritative if storage is down.
    async fn persist_lease_deadline(&self, lease: &Lease) -> Result<()> {
        let mut attempt = 1;
        loop {
            let still_held = self
                .leases
                .get(&lease.task_id)
                .map_or(false, |current| current.token == lease.token);
            if !still_held {
                return Err(self.lost_lease_error(lease.task_id).await);
            }

            let mut task = match self.load(lease.task_id).await {
                Ok(task) => task,
                Err(StorageError::Unavailable(msg)) => {
                    warn!("Could not persist renewed lease for task {}: {}", lease.task_id, msg);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            if task.status != TaskStatus::Running {
                return Err(self.lost_lease_error(lease.task_id).await);
            }

            let expected = task.version;
            task.lease_expires_at = Some(lease.expires_at);
            task.updated_at = self.clock.now();
            task.version = expected + 1;

            match self.persist(&task, expected).await {
                Ok(()) => return Ok(()),
                Err(StorageError::Conflict { .. }) if attempt < CONFLICT_RETRIES => attempt += 1,
                Err(StorageError::Unavailable(msg)) => {
                    warn!("Could not persist renewed lease for task {}: {}", lease.task_id, msg);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Error for a caller whose lease is gone: `TaskCancelled` when the task
    /// was cancelled, `LeaseLost` otherwise
    async fn lost_lease_error(&self, task_id: TaskId) -> TaskError {
        match self.load(task_id).await {
            Ok(task) if task.status == TaskStatus::Cancelled => TaskError::TaskCancelled(task_id),
            _ => TaskError::LeaseLost(task_id),
        }
    }

    /// Record a successful attempt. Only the current lease holder may do so.
    pub async fn report_success(
        &self,
        task_id: TaskId,
        worker_id: &str,
        result: Vec<u8>,
    ) -> Result<Task> {
        let lease = match self.leases.release_held(task_id, worker_id) {
            Ok(lease) => lease,
            Err(_) => return Err(self.lost_lease_error(task_id).await),
        };
        self.workers.clear_task(worker_id, &task_id);

        let task = self
            .commit_running(&lease, |task, now| task.complete(result.clone(), now))
            .await?;

        self.record_transition(&task, TaskStatus::Running, Some(worker_id));
        self.refresh_gauges(&task.queue);
        info!("Task {} completed by worker {}", task_id, worker_id);
        Ok(task)
    }

    /// Record a failed attempt; the backoff policy decides retry or failure
    pub async fn report_failure(
        &self,
        task_id: TaskId,
        worker_id: &str,
        error: impl Into<String>,
    ) -> Result<Task> {
        let error = error.into();
        let lease = match self.leases.release_held(task_id, worker_id) {
            Ok(lease) => lease,
            Err(_) => return Err(self.lost_lease_error(task_id).await),
        };
        self.workers.clear_task(worker_id, &task_id);

        let task = self
            .commit_running(&lease, |task, now| self.apply_failure(task, &error, now))
            .await?;

        self.after_failure(&task, Some(worker_id));
        Ok(task)
    }

    fn apply_failure(&self, task: &mut Task, error: &str, now: DateTime<Utc>) -> Result<()> {
        match self.backoff.decide(task) {
            RetryDecision::Retry { delay, .. } => {
                task.schedule_retry(error.to_string(), deadline_after(now, delay), now)
            }
            RetryDecision::Fail => task.fail(error.to_string(), now),
        }
    }

    fn after_failure(&self, task: &Task, worker_id: Option<&str>) {
        self.record_transition(task, TaskStatus::Running, worker_id);

        if task.status == TaskStatus::Retrying {
            self.queues.schedule_task(task, task.updated_at);
            info!(
                "Task {} failed, retry {}/{} scheduled",
                task.id, task.retry_count, task.max_retries
            );
        } else {
            warn!(
                "Task {} failed permanently after {} retries: {}",
                task.id,
                task.retry_count,
                task.error.as_deref().unwrap_or_default()
            );
        }
        self.refresh_gauges(&task.queue);
    }

    /// Apply an outcome to the running attempt guarded by `lease`.
    ///
    /// The lease has already been cleared by the caller. It is put back when
    /// the outcome could not be stored, so the attempt stays owned.
    async fn commit_running<F>(&self, lease: &Lease, mut apply: F) -> Result<Task>
    where
        F: FnMut(&mut Task, DateTime<Utc>) -> Result<()> + Send,
    {
        let mut attempt = 1;
        loop {
            let mut task = match self.load(lease.task_id).await {
                Ok(task) => task,
                Err(e @ StorageError::NotFound(_)) => return Err(e.into()),
                Err(e) => {
                    self.reinstate(lease);
                    return Err(self.surface(e));
                }
            };

            let holder = task.worker_id.as_deref().unwrap_or_default();
            if task.status != TaskStatus::Running || holder != lease.worker_id {
                return Err(if task.status == TaskStatus::Cancelled {
                    TaskError::TaskCancelled(task.id)
                } else {
                    TaskError::LeaseLost(task.id)
                });
            }

            let expected = task.version;
            let now = self.clock.now();
            if let Err(e) = apply(&mut task, now) {
                self.reinstate(lease);
                return Err(e);
            }
            task.version = expected + 1;

            match self.persist(&task, expected).await {
                Ok(()) => return Ok(task),
                Err(StorageError::Conflict { .. }) if attempt < CONFLICT_RETRIES => attempt += 1,
                Err(e @ StorageError::NotFound(_)) => return Err(e.into()),
                Err(e) => {
                    self.reinstate(lease);
                    return Err(self.surface(e));
                }
            }
        }
    }

    fn reinstate(&self, lease: &Lease) {
        self.leases.reinstate(lease.clone());
        self.workers.assign_task(&lease.worker_id, lease.task_id);
    }

    /// Take back an abandoned attempt and run it through the failure path
    async fn reclaim(&self, lease: Lease, reason: &str) -> Result<Option<Task>> {
        // Lost the compare-and-clear to a report or a cancel
        if !self.leases.release(&lease) {
            return Ok(None);
        }
        self.workers.clear_task(&lease.worker_id, &lease.task_id);

        let error = format!("Task timed out: {}", reason);
        match self
            .commit_running(&lease, |task, now| self.apply_failure(task, &error, now))
            .await
        {
            Ok(task) => {
                self.metrics.leases_reclaimed_total.inc();
                warn!(
                    "Reclaimed task {} from worker {}: {}",
                    task.id, lease.worker_id, reason
                );
                self.after_failure(&task, Some(&lease.worker_id));
                Ok(Some(task))
            }
            Err(e) if e.is_lease_lost() => {
                self.refresh_gauges(&lease.queue);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    // ---- background maintenance ----

    /// Move scheduled and retrying tasks whose time has come into their
    /// ready queues. Returns the number promoted.
    pub async fn promote_due(&self) -> usize {
        let now = self.clock.now();
        let mut promoted = 0;

        for entry in self.queues.take_due(now) {
            match self.promote(&entry, now).await {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(e) => {
                    error!("Failed to promote task {}: {}", entry.task_id, e);
                    self.queues.reschedule(entry);
                }
            }
        }

        if promoted > 0 {
            debug!("Promoted {} due tasks", promoted);
        }
        promoted
    }

    async fn promote(&self, entry: &QueuedTask, now: DateTime<Utc>) -> Result<bool> {
        let mut task = match self.load(entry.task_id).await {
            Ok(task) => task,
            Err(StorageError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(self.surface(e)),
        };

        match task.status {
            TaskStatus::Pending => {}
            TaskStatus::Retrying => {
                let expected = task.version;
                task.requeue(now)?;
                task.version = expected + 1;

                match self.persist(&task, expected).await {
                    Ok(()) => self.record_transition(&task, TaskStatus::Retrying, None),
                    Err(StorageError::Conflict { .. }) => {
                        // Re-read on the next pass
                        self.queues.reschedule(entry.clone());
                        return Ok(false);
                    }
                    Err(e) => return Err(self.surface(e)),
                }
            }
            // Cancelled while waiting
            _ => return Ok(false),
        }

        self.queues
            .enqueue(task.id, &task.queue, &task.name, task.priority, None, now);
        self.refresh_gauges(&task.queue);
        Ok(true)
    }

    /// Reclaim expired leases and the leases of dead workers, then forget
    /// dead workers. Returns the number of reclaimed tasks.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for lease in self.leases.expired(now) {
            if seen.insert(lease.task_id) {
                let reason = format!("lease expired at {}", lease.expires_at);
                candidates.push((lease, reason));
            }
        }

        for worker in self.workers.dead_workers(now) {
            let held = self.leases.held_by(&worker.worker_id);
            if !held.is_empty() {
                warn!(
                    "Worker {} missed heartbeats since {}, reclaiming {} tasks",
                    worker.worker_id,
                    worker.last_heartbeat,
                    held.len()
                );
            }
            for lease in held {
                if seen.insert(lease.task_id) {
                    let reason = format!("worker {} stopped sending heartbeats", worker.worker_id);
                    candidates.push((lease, reason));
                }
            }
        }

        let mut reclaimed = 0;
        for (lease, reason) in candidates {
            let task_id = lease.task_id;
            match self.reclaim(lease, &reason).await {
                Ok(Some(_)) => reclaimed += 1,
                Ok(None) => {}
                Err(e) => error!("Failed to reclaim task {}: {}", task_id, e),
            }
        }

        for worker in self.workers.remove_dead(now) {
            info!("Removed dead worker: {}", worker.worker_id);
        }
        self.metrics
            .workers_connected
            .set(self.workers.count_alive(now) as i64);
        self.metrics.tasks_running.set(self.leases.len() as i64);

        reclaimed
    }

    /// Rebuild in-memory scheduling state from storage after a restart.
    ///
    /// Running tasks whose deadline already passed go through the normal
    /// reclaim path, as if the sweep had never stopped.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let now = self.clock.now();
        let mut report = RecoveryReport::default();
        let mut expired = Vec::new();

        let queues = self
            .storage_retry
            .run("list_queues", || self.storage.list_queues())
            .await
            .map_err(|e| self.surface(e))?;

        for queue in &queues {
            for task in self.list_tasks(queue, TaskStatus::Pending).await? {
                if !self.queues.contains(queue, &task.id) {
                    self.queues.enqueue_task(&task, now);
                }
                report.pending += 1;
            }

            for task in self.list_tasks(queue, TaskStatus::Retrying).await? {
                if !self.queues.contains(queue, &task.id) {
                    self.queues.schedule_task(&task, now);
                }
                report.retrying += 1;
            }

            for task in self.list_tasks(queue, TaskStatus::Running).await? {
                report.running += 1;
                let lease = match self.leases.get(&task.id) {
                    Some(lease) => lease,
                    None => {
                        let ttl = task.lease_ttl(self.config.default_lease_ttl());
                        let expires_at = task
                            .lease_expires_at
                            .or_else(|| task.started_at.map(|at| deadline_after(at, ttl)))
                            .unwrap_or(now);
                        self.leases.acquire_until(
                            task.id,
                            task.worker_id.as_deref().unwrap_or_default(),
                            queue,
                            ttl,
                            now,
                            expires_at,
                        )
                    }
                };
                if lease.is_expired(now) {
                    expired.push(lease);
                }
            }

            self.refresh_gauges(queue);
        }

        for lease in expired {
            if self.reclaim(lease, "lease expired before restart").await?.is_some() {
                report.reclaimed += 1;
            }
        }

        info!(
            "Recovered {} pending, {} retrying and {} running tasks ({} reclaimed)",
            report.pending, report.retrying, report.running, report.reclaimed
        );
        Ok(report)
    }

    /// Run promotion and the lease sweep on their intervals until
    /// `shutdown` is called
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.maintenance_loop().await })
    }

    async fn maintenance_loop(&self) {
        let mut promote = tokio::time::interval(self.config.promote_interval());
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        promote.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Engine maintenance started (promote every {:?}, sweep every {:?})",
            self.config.promote_interval(),
            self.config.sweep_interval()
        );

        while !self.stopping.load(Ordering::Acquire) {
            tokio::select! {
                _ = promote.tick() => {
                    self.promote_due().await;
                }
                _ = sweep.tick() => {
                    self.sweep_expired().await;
                }
                _ = self.shutdown.notified() => {
                    break;
                }
            }
        }

        info!("Engine maintenance stopped");
    }

    /// Stop the maintenance loop and release long-polling workers
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        self.shutdown.notify_one();
        self.queues.wake_pollers();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}
