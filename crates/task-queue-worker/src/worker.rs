use crate::{config::WorkerConfig, executor::TaskExecutor};
use task_queue_core::{Task, TaskError};
use task_queue_engine::{Engine, TaskResult};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// First wait before re-sending a report the engine could not store
const REPORT_RETRY_BASE: Duration = Duration::from_millis(100);
const REPORT_RETRY_MAX: Duration = Duration::from_secs(5);

/// Worker runtime driving an in-process engine.
///
/// Runs `concurrency` logical workers, each holding at most one task, with
/// ids `<worker_id>-<n>`.
pub struct Worker {
    engine: Arc<Engine>,
    config: WorkerConfig,
    worker_id: String,
    active_tasks: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(engine: Arc<Engine>, config: WorkerConfig) -> Self {
        let worker_id = config.generate_worker_id();

        Worker {
            engine,
            config,
            worker_id,
            active_tasks: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::SeqCst)
    }

    /// Token that stops the worker when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Trigger shutdown
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run until shutdown, then wait for in-flight tasks
    pub async fn run(&self) -> anyhow::Result<()> {
        self.config.validate()?;
        info!(
            "Starting worker {} (concurrency: {}, queues: {:?})",
            self.worker_id, self.config.concurrency, self.config.queues
        );

        let slots = futures::future::join_all(
            (0..self.config.concurrency).map(|n| self.run_slot(format!("{}-{}", self.worker_id, n))),
        );
        tokio::pin!(slots);

        tokio::select! {
            _ = &mut slots => return Ok(()),
            _ = self.shutdown.cancelled() => {
                info!("Worker {} shutting down gracefully", self.worker_id);
            }
        }

        info!("Waiting for active tasks to complete...");
        let deadline = self.config.graceful_shutdown_timeout();
        match tokio::time::timeout(deadline, &mut slots).await {
            Ok(_) => info!("All tasks completed, shutting down"),
            Err(_) => warn!(
                "Shutdown deadline exceeded, {} tasks still active",
                self.active_tasks()
            ),
        }

        Ok(())
    }

    /// One logical worker: poll, execute, report, repeat
    async fn run_slot(&self, slot_id: String) {
        let poll_wait = self.config.poll_wait();

        while !self.shutdown.is_cancelled() {
            match self
                .engine
                .poll_task(&slot_id, &self.config.queues, &[], poll_wait)
                .await
            {
                Ok(Some(task)) => self.process(&slot_id, task).await,
                Ok(None) => {}
                Err(TaskError::UnknownHandler(name)) => {
                    debug!("{} skipping tasks without handler: {}", slot_id, name);
                    self.pause(poll_wait).await;
                }
                Err(e) => {
                    warn!("{} failed to poll for work: {}", slot_id, e);
                    self.pause(poll_wait).await;
                }
            }
        }

        debug!("{} stopped", slot_id);
    }

    async fn pause(&self, wait: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    async fn process(&self, slot_id: &str, task: Task) {
        self.active_tasks.fetch_add(1, Ordering::SeqCst);
        info!("Executing task {} (name: {}) on {}", task.id, task.name, slot_id);

        let outcome = match self.engine.handlers().get(&task.name) {
            Some(handler) => {
                let executor = TaskExecutor::new(handler, self.engine.config().default_lease_ttl());
                self.execute_with_heartbeat(slot_id, &task, &executor).await
            }
            None => Some(Err(format!("No handler registered for task name: {}", task.name))),
        };

        // None: lease gone, whoever holds the task now owns the outcome
        if let Some(outcome) = outcome {
            self.report(slot_id, &task, outcome).await;
        }

        self.active_tasks.fetch_sub(1, Ordering::SeqCst);
    }

    /// Hand the outcome to the engine.
    ///
    /// A report the engine could not store leaves the lease with this slot,
    /// which keeps it from polling, so it is re-sent until stored or the
    /// lease is gone. A result the engine refuses becomes a failure.
    async fn report(&self, slot_id: &str, task: &Task, mut outcome: TaskResult) {
        let mut delay = REPORT_RETRY_BASE;

        loop {
            let reported = match &outcome {
                Ok(result) => {
                    self.engine
                        .report_success(task.id, slot_id, result.clone())
                        .await
                }
                Err(error) => {
                    self.engine
                        .report_failure(task.id, slot_id, error.clone())
                        .await
                }
            };

            match reported {
                Ok(stored) => {
                    debug!("Task {} reported, now {}", task.id, stored.status);
                    return;
                }
                Err(e) if e.is_lease_lost() => {
                    warn!("Dropping outcome of task {}: {}", task.id, e);
                    return;
                }
                Err(e) if e.is_retryable() => {
                    if self.shutdown.is_cancelled() {
                        error!("Giving up on reporting task {} at shutdown: {}", task.id, e);
                        return;
                    }
                    warn!(
                        "Failed to report task {}: {}, retrying in {:?}",
                        task.id, e, delay
                    );
                    self.pause(delay).await;
                    delay = (delay * 2).min(REPORT_RETRY_MAX);
                }
                Err(e) if outcome.is_ok() => {
                    warn!("Result of task {} rejected: {}", task.id, e);
                    outcome = Err(e.to_string());
                }
                Err(e) => {
                    error!("Failed to report failure of task {}: {}", task.id, e);
                    return;
                }
            }
        }
    }

    /// Run the handler while renewing the lease.
    ///
    /// Returns `None` when the lease was lost or the task cancelled; the
    /// handler is aborted and its result dropped.
    async fn execute_with_heartbeat(
        &self,
        slot_id: &str,
        task: &Task,
        executor: &TaskExecutor,
    ) -> Option<TaskResult> {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        heartbeat.tick().await;

        let execution = executor.execute(task);
        tokio::pin!(execution);

        loop {
            tokio::select! {
                result = &mut execution => return Some(result),
                _ = heartbeat.tick() => {
                    match self.engine.renew_lease(task.id, slot_id).await {
                        Ok(lease) => debug!("Task {} lease extended to {}", task.id, lease.expires_at),
                        Err(e) if e.is_lease_lost() => {
                            warn!("Abandoning task {}: {}", task.id, e);
                            return None;
                        }
                        Err(e) => warn!("Failed to renew lease on task {}: {}", task.id, e),
                    }
                }
            }
        }
    }
}
