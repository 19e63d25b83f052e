use crate::clock::deadline_after;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use task_queue_core::TaskId;

/// Point-in-time view of a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    /// Queues in the worker's preference order
    pub queues: Vec<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub leased_task: Option<TaskId>,
}

impl WorkerSnapshot {
    fn new(worker_id: &str, queues: &[String], now: DateTime<Utc>) -> Self {
        WorkerSnapshot {
            worker_id: worker_id.to_string(),
            queues: queues.to_vec(),
            registered_at: now,
            last_heartbeat: now,
            leased_task: None,
        }
    }

    /// Alive while the last heartbeat is younger than `timeout`
    pub fn is_alive(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now < deadline_after(self.last_heartbeat, timeout)
    }
}

/// Workers seen by the engine.
///
/// A worker registers implicitly on its first poll. Polls and lease renewals
/// count as heartbeats.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerSnapshot>>,
    heartbeat_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        WorkerRegistry {
            workers: RwLock::new(HashMap::new()),
            heartbeat_timeout,
        }
    }

    /// Record a poll. Returns true when the worker was not known before.
    pub fn touch(&self, worker_id: &str, queues: &[String], now: DateTime<Utc>) -> bool {
        let mut workers = self.workers.write();
        match workers.get_mut(worker_id) {
            Some(worker) => {
                worker.last_heartbeat = now;
                if !queues.is_empty() {
                    worker.queues = queues.to_vec();
                }
                false
            }
            None => {
                workers.insert(
                    worker_id.to_string(),
                    WorkerSnapshot::new(worker_id, queues, now),
                );
                true
            }
        }
    }

    /// Update heartbeat
    pub fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        let mut workers = self.workers.write();
        if let Some(worker) = workers.get_mut(worker_id) {
            worker.last_heartbeat = now;
            true
        } else {
            false
        }
    }

    pub fn assign_task(&self, worker_id: &str, task_id: TaskId) {
        let mut workers = self.workers.write();
        if let Some(worker) = workers.get_mut(worker_id) {
            worker.leased_task = Some(task_id);
        }
    }

    /// Forget the worker's task if it is still `task_id`
    pub fn clear_task(&self, worker_id: &str, task_id: &TaskId) {
        let mut workers = self.workers.write();
        if let Some(worker) = workers.get_mut(worker_id) {
            if worker.leased_task.as_ref() == Some(task_id) {
                worker.leased_task = None;
            }
        }
    }

    pub fn leased_task(&self, worker_id: &str) -> Option<TaskId> {
        self.workers
            .read()
            .get(worker_id)
            .and_then(|worker| worker.leased_task)
    }

    pub fn get(&self, worker_id: &str) -> Option<WorkerSnapshot> {
        self.workers.read().get(worker_id).cloned()
    }

    /// All workers, sorted by id
    pub fn all_workers(&self) -> Vec<WorkerSnapshot> {
        let mut workers: Vec<WorkerSnapshot> = self.workers.read().values().cloned().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    pub fn dead_workers(&self, now: DateTime<Utc>) -> Vec<WorkerSnapshot> {
        self.workers
            .read()
            .values()
            .filter(|w| !w.is_alive(now, self.heartbeat_timeout))
            .cloned()
            .collect()
    }

    /// Remove workers that are still dead at `now`
    pub fn remove_dead(&self, now: DateTime<Utc>) -> Vec<WorkerSnapshot> {
        let mut workers = self.workers.write();
        let dead_ids: Vec<String> = workers
            .values()
            .filter(|w| !w.is_alive(now, self.heartbeat_timeout))
            .map(|w| w.worker_id.clone())
            .collect();

        dead_ids
            .into_iter()
            .filter_map(|id| workers.remove(&id))
            .collect()
    }

    pub fn count_alive(&self, now: DateTime<Utc>) -> usize {
        self.workers
            .read()
            .values()
            .filter(|w| w.is_alive(now, self.heartbeat_timeout))
            .count()
    }

    pub fn count_total(&self) -> usize {
        self.workers.read().len()
    }
}
