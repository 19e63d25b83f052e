use crate::clock::deadline_after;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use task_queue_core::{Result, TaskError, TaskId};

/// Exclusive, time-bounded claim of a worker on one running task.
///
/// `token` identifies the current term of the lease: a lease can only be
/// cleared by whoever still holds the same token. Every renewal issues a new
/// one, so a snapshot taken before a heartbeat can no longer reclaim it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub task_id: TaskId,
    pub worker_id: String,
    pub queue: String,
    pub token: u64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Active leases keyed by task id.
///
/// Completion, failure, cancellation and reclaim all end a lease through the
/// same compare-and-clear, so only one of them can win per attempt.
pub struct LeaseManager {
    leases: DashMap<TaskId, Lease>,
    next_token: AtomicU64,
}

impl LeaseManager {
    pub fn new() -> Self {
        LeaseManager {
            leases: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    /// Create a lease for a freshly dispatched task
    pub fn acquire(
        &self,
        task_id: TaskId,
        worker_id: &str,
        queue: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Lease {
        self.acquire_until(task_id, worker_id, queue, ttl, now, deadline_after(now, ttl))
    }

    /// Create a lease with an explicit deadline (restart recovery)
    pub fn acquire_until(
        &self,
        task_id: TaskId,
        worker_id: &str,
        queue: &str,
        ttl: Duration,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Lease {
        let lease = Lease {
            task_id,
            worker_id: worker_id.to_string(),
            queue: queue.to_string(),
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
            acquired_at: now,
            expires_at,
            ttl,
        };
        self.leases.insert(task_id, lease.clone());
        lease
    }

    /// Extend the lease by its TTL under a fresh token.
    ///
    /// Rejected with `LeaseLost` when the caller does not hold the lease or
    /// it has already expired; an expired lease belongs to the sweep.
    pub fn renew(&self, task_id: TaskId, worker_id: &str, now: DateTime<Utc>) -> Result<Lease> {
        let mut lease = self
            .leases
            .get_mut(&task_id)
            .ok_or(TaskError::LeaseLost(task_id))?;

        if lease.worker_id != worker_id || lease.is_expired(now) {
            return Err(TaskError::LeaseLost(task_id));
        }

        let ttl = lease.ttl;
        lease.expires_at = deadline_after(now, ttl);
        lease.token = self.next_token.fetch_add(1, Ordering::Relaxed);
        Ok(lease.clone())
    }

    pub fn get(&self, task_id: &TaskId) -> Option<Lease> {
        self.leases.get(task_id).map(|lease| lease.clone())
    }

    /// Clear the lease if `worker_id` holds it, returning the cleared lease
    pub fn release_held(&self, task_id: TaskId, worker_id: &str) -> Result<Lease> {
        self.leases
            .remove_if(&task_id, |_, lease| lease.worker_id == worker_id)
            .map(|(_, lease)| lease)
            .ok_or(TaskError::LeaseLost(task_id))
    }

    /// Compare-and-clear on (task id, token)
    pub fn release(&self, lease: &Lease) -> bool {
        self.leases
            .remove_if(&lease.task_id, |_, current| current.token == lease.token)
            .is_some()
    }

    /// Clear whatever lease the task has
    pub fn revoke(&self, task_id: &TaskId) -> Option<Lease> {
        self.leases.remove(task_id).map(|(_, lease)| lease)
    }

    /// Put a released lease back after the transition it guarded failed
    pub fn reinstate(&self, lease: Lease) {
        self.leases.entry(lease.task_id).or_insert(lease);
    }

    pub fn expired(&self, now: DateTime<Utc>) -> Vec<Lease> {
        self.leases
            .iter()
            .filter(|lease| lease.is_expired(now))
            .map(|lease| lease.clone())
            .collect()
    }

    pub fn held_by(&self, worker_id: &str) -> Vec<Lease> {
        self.leases
            .iter()
            .filter(|lease| lease.worker_id == worker_id)
            .map(|lease| lease.clone())
            .collect()
    }

    pub fn running_in(&self, queue: &str) -> usize {
        self.leases.iter().filter(|lease| lease.queue == queue).count()
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

impl Default for LeaseManager {
    fn default() -> Self {
        Self::new()
    }
}
