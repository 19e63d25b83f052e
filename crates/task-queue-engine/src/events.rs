use task_queue_core::TaskEvent;
use tokio::sync::broadcast;
use tracing::debug;

/// Sink for lifecycle transitions.
///
/// Called after the transition is persisted. Implementations must not block;
/// delivery is best effort and never affects engine state.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: TaskEvent);
}

/// Fan-out over a tokio broadcast channel.
///
/// Slow subscribers lag and lose the oldest events; the engine never waits
/// for them.
pub struct BroadcastPublisher {
    sender: broadcast::Sender<TaskEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        BroadcastPublisher { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: TaskEvent) {
        // No subscribers is not an error
        if self.sender.send(event).is_err() {
            debug!("Dropped task event, no subscribers");
        }
    }
}

/// Publisher for engines embedded without observers
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _event: TaskEvent) {}
}
