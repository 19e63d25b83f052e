use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use task_queue_core::{Priority, Task, TaskId};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Routing entry for a task waiting in the Queue Store.
///
/// Holds only what dispatch needs to pick a task; the task record itself
/// lives in storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub task_id: TaskId,
    pub queue: String,
    pub name: String,
    pub priority: Priority,
    /// Enqueue sequence, the FIFO tie-break within a priority
    pub seq: u64,
    pub enqueued_at: DateTime<Utc>,
    /// Not dispatchable before this instant
    pub ready_at: Option<DateTime<Utc>>,
}

/// Ready ordering: higher priority first, then lower sequence
#[derive(Debug, Clone)]
struct ReadyEntry(QueuedTask);

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.0.priority.cmp(&other.0.priority) {
            Ordering::Equal => other.0.seq.cmp(&self.0.seq),
            ordering => ordering,
        }
    }
}

/// Scheduled ordering: earliest `ready_at` on top of the max-heap
#[derive(Debug, Clone)]
struct ScheduledEntry(QueuedTask);

impl ScheduledEntry {
    fn key(&self) -> (Option<DateTime<Utc>>, u64) {
        (self.0.ready_at, self.0.seq)
    }
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ScheduledEntry {}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Ready,
    Scheduled,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    seq: u64,
    state: SlotState,
    enqueued_at: DateTime<Utc>,
}

/// One queue partition. Heap entries are deleted lazily: an entry is live
/// only while `members` still points at it with the same sequence and state.
#[derive(Default)]
struct QueueShard {
    ready: BinaryHeap<ReadyEntry>,
    scheduled: BinaryHeap<ScheduledEntry>,
    members: HashMap<TaskId, Slot>,
    ready_live: usize,
    scheduled_live: usize,
}

impl QueueShard {
    fn is_live(&self, entry: &QueuedTask, state: SlotState) -> bool {
        self.members
            .get(&entry.task_id)
            .map_or(false, |slot| slot.seq == entry.seq && slot.state == state)
    }

    fn insert(&mut self, entry: &QueuedTask, state: SlotState) {
        let slot = Slot {
            seq: entry.seq,
            state,
            enqueued_at: entry.enqueued_at,
        };
        if let Some(previous) = self.members.insert(entry.task_id, slot) {
            self.forget(previous.state);
        }
        match state {
            SlotState::Ready => self.ready_live += 1,
            SlotState::Scheduled => self.scheduled_live += 1,
        }
    }

    fn forget(&mut self, state: SlotState) {
        match state {
            SlotState::Ready => self.ready_live -= 1,
            SlotState::Scheduled => self.scheduled_live -= 1,
        }
    }

    fn push_ready(&mut self, entry: QueuedTask) {
        self.insert(&entry, SlotState::Ready);
        self.ready.push(ReadyEntry(entry));
    }

    fn push_scheduled(&mut self, entry: QueuedTask) {
        self.insert(&entry, SlotState::Scheduled);
        self.scheduled.push(ScheduledEntry(entry));
    }

    fn pop_ready_matching<F>(&mut self, mut eligible: F) -> Option<QueuedTask>
    where
        F: FnMut(&QueuedTask) -> bool,
    {
        let mut skipped = Vec::new();
        let mut found = None;

        while let Some(ReadyEntry(entry)) = self.ready.pop() {
            if !self.is_live(&entry, SlotState::Ready) {
                continue;
            }
            if eligible(&entry) {
                self.members.remove(&entry.task_id);
                self.ready_live -= 1;
                found = Some(entry);
                break;
            }
            skipped.push(ReadyEntry(entry));
        }

        // Skipped entries keep their sequence, so their position is unchanged
        self.ready.extend(skipped);
        found
    }

    fn take_due(&mut self, now: DateTime<Utc>, due: &mut Vec<QueuedTask>) {
        while let Some(top) = self.scheduled.peek() {
            if !self.is_live(&top.0, SlotState::Scheduled) {
                self.scheduled.pop();
                continue;
            }
            if top.0.ready_at.map_or(false, |at| at > now) {
                break;
            }
            if let Some(ScheduledEntry(entry)) = self.scheduled.pop() {
                self.members.remove(&entry.task_id);
                self.scheduled_live -= 1;
                due.push(entry);
            }
        }
    }

    fn remove(&mut self, task_id: &TaskId) -> bool {
        let Some(slot) = self.members.remove(task_id) else {
            return false;
        };
        self.forget(slot.state);
        self.compact();
        true
    }

    fn compact(&mut self) {
        if self.ready.len() > 2 * self.ready_live + 64 {
            let members = &self.members;
            self.ready.retain(|ReadyEntry(e)| {
                members
                    .get(&e.task_id)
                    .map_or(false, |s| s.seq == e.seq && s.state == SlotState::Ready)
            });
        }
        if self.scheduled.len() > 2 * self.scheduled_live + 64 {
            let members = &self.members;
            self.scheduled.retain(|ScheduledEntry(e)| {
                members
                    .get(&e.task_id)
                    .map_or(false, |s| s.seq == e.seq && s.state == SlotState::Scheduled)
            });
        }
    }

    fn oldest_ready(&self) -> Option<DateTime<Utc>> {
        self.members
            .values()
            .filter(|slot| slot.state == SlotState::Ready)
            .map(|slot| slot.enqueued_at)
            .min()
    }
}

/// Per-queue ready orderings plus the scheduled set awaiting promotion.
///
/// Each queue has its own lock; no operation holds more than one shard lock
/// and none waits on I/O while holding it.
pub struct QueueStore {
    shards: DashMap<String, Arc<Mutex<QueueShard>>>,
    next_seq: AtomicU64,
    ready_signal: Notify,
}

impl QueueStore {
    pub fn new() -> Self {
        QueueStore {
            shards: DashMap::new(),
            next_seq: AtomicU64::new(0),
            ready_signal: Notify::new(),
        }
    }

    fn shard(&self, queue: &str) -> Arc<Mutex<QueueShard>> {
        if let Some(shard) = self.shards.get(queue) {
            return shard.clone();
        }
        self.shards.entry(queue.to_string()).or_default().clone()
    }

    fn existing_shard(&self, queue: &str) -> Option<Arc<Mutex<QueueShard>>> {
        self.shards.get(queue).map(|shard| shard.clone())
    }

    fn entry(
        &self,
        task_id: TaskId,
        queue: &str,
        name: &str,
        priority: Priority,
        ready_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> QueuedTask {
        QueuedTask {
            task_id,
            queue: queue.to_string(),
            name: name.to_string(),
            priority,
            seq: self.next_seq.fetch_add(1, AtomicOrdering::Relaxed),
            enqueued_at: now,
            ready_at,
        }
    }

    /// Add a task. It becomes ready immediately unless `ready_at` lies after
    /// `now`, in which case it waits for `take_due`.
    pub fn enqueue(
        &self,
        task_id: TaskId,
        queue: &str,
        name: &str,
        priority: Priority,
        ready_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> QueuedTask {
        let entry = self.entry(task_id, queue, name, priority, ready_at, now);
        let shard = self.shard(queue);
        if ready_at.map_or(true, |at| at <= now) {
            shard.lock().push_ready(entry.clone());
            self.ready_signal.notify_waiters();
        } else {
            shard.lock().push_scheduled(entry.clone());
        }
        entry
    }

    /// Enqueue a task record at its `scheduled_at`
    pub fn enqueue_task(&self, task: &Task, now: DateTime<Utc>) -> QueuedTask {
        self.enqueue(
            task.id,
            &task.queue,
            &task.name,
            task.priority,
            task.scheduled_at,
            now,
        )
    }

    /// Hold a task in the scheduled set until `take_due` returns it, even if
    /// its time has already come. Used for tasks that need a status change
    /// before they may be dispatched.
    pub fn schedule_task(&self, task: &Task, now: DateTime<Utc>) -> QueuedTask {
        let entry = self.entry(
            task.id,
            &task.queue,
            &task.name,
            task.priority,
            task.scheduled_at,
            now,
        );
        self.shard(&task.queue).lock().push_scheduled(entry.clone());
        entry
    }

    /// Put a previously dequeued entry back. It keeps its sequence and so
    /// returns to the front of its priority band.
    pub fn restore(&self, entry: QueuedTask) {
        self.shard(&entry.queue).lock().push_ready(entry);
        self.ready_signal.notify_waiters();
    }

    /// Put an entry taken by `take_due` back into the scheduled set
    pub fn reschedule(&self, entry: QueuedTask) {
        self.shard(&entry.queue).lock().push_scheduled(entry);
    }

    pub fn dequeue(&self, queue: &str) -> Option<QueuedTask> {
        self.dequeue_matching(queue, |_| true)
    }

    /// Pop the first ready entry accepted by `eligible`.
    ///
    /// Entries rejected by the predicate stay in place. Each entry is handed
    /// out to exactly one caller.
    pub fn dequeue_matching<F>(&self, queue: &str, eligible: F) -> Option<QueuedTask>
    where
        F: FnMut(&QueuedTask) -> bool,
    {
        let shard = self.existing_shard(queue)?;
        let mut guard = shard.lock();
        guard.pop_ready_matching(eligible)
    }

    /// Remove and return every scheduled entry whose time has come
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<QueuedTask> {
        let shards: Vec<Arc<Mutex<QueueShard>>> =
            self.shards.iter().map(|s| s.value().clone()).collect();

        let mut due = Vec::new();
        for shard in shards {
            shard.lock().take_due(now, &mut due);
        }
        due
    }

    /// Drop a task from its queue, ready or scheduled
    pub fn remove(&self, queue: &str, task_id: &TaskId) -> bool {
        self.existing_shard(queue)
            .map_or(false, |shard| shard.lock().remove(task_id))
    }

    pub fn contains(&self, queue: &str, task_id: &TaskId) -> bool {
        self.existing_shard(queue)
            .map_or(false, |shard| shard.lock().members.contains_key(task_id))
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.existing_shard(queue)
            .map_or(0, |shard| shard.lock().ready_live)
    }

    pub fn scheduled_count(&self, queue: &str) -> usize {
        self.existing_shard(queue)
            .map_or(0, |shard| shard.lock().scheduled_live)
    }

    /// Enqueue time of the longest-waiting ready entry
    pub fn oldest_ready(&self, queue: &str) -> Option<DateTime<Utc>> {
        self.existing_shard(queue)
            .and_then(|shard| shard.lock().oldest_ready())
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shards.iter().map(|s| s.key().clone()).collect();
        names.sort();
        names
    }

    /// Future resolved the next time any entry becomes ready.
    ///
    /// Enable it before checking the queues to avoid missing a wakeup.
    pub fn ready_notified(&self) -> Notified<'_> {
        self.ready_signal.notified()
    }

    /// Wake every waiting poller without adding work
    pub fn wake_pollers(&self) {
        self.ready_signal.notify_waiters();
    }
}

impl Default for QueueStore {
    fn default() -> Self {
        Self::new()
    }
}
