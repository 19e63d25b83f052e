use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use task_queue_core::TaskStatus;

/// Prometheus metrics for the engine.
///
/// Each instance owns its registry so several engines can live in one process.
pub struct EngineMetrics {
    pub registry: Registry,

    // Transition counters
    pub task_transitions_total: IntCounterVec,

    // Running tasks (live leases)
    pub tasks_running: IntGauge,

    pub leases_reclaimed_total: IntCounter,

    pub workers_connected: IntGauge,

    // Ready depth per queue
    pub queue_depth: IntGaugeVec,

    pub dispatch_duration: Histogram,
}

impl EngineMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let task_transitions_total = IntCounterVec::new(
            Opts::new(
                "tq_task_transitions_total",
                "Task status transitions by target status and queue",
            ),
            &["to", "queue"],
        )?;
        registry.register(Box::new(task_transitions_total.clone()))?;

        let tasks_running = IntGauge::new("tq_tasks_running", "Number of leased tasks")?;
        registry.register(Box::new(tasks_running.clone()))?;

        let leases_reclaimed_total = IntCounter::new(
            "tq_leases_reclaimed_total",
            "Leases reclaimed after expiry or worker death",
        )?;
        registry.register(Box::new(leases_reclaimed_total.clone()))?;

        let workers_connected =
            IntGauge::new("tq_workers_connected", "Number of live workers")?;
        registry.register(Box::new(workers_connected.clone()))?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("tq_queue_depth", "Ready tasks per queue"),
            &["queue"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let dispatch_duration = Histogram::with_opts(HistogramOpts::new(
            "tq_dispatch_duration_seconds",
            "Time spent assigning a task to a polling worker",
        ))?;
        registry.register(Box::new(dispatch_duration.clone()))?;

        Ok(EngineMetrics {
            registry,
            task_transitions_total,
            tasks_running,
            leases_reclaimed_total,
            workers_connected,
            queue_depth,
            dispatch_duration,
        })
    }

    /// Count a transition into `to`
    pub fn inc_transition(&self, to: TaskStatus, queue: &str) {
        self.task_transitions_total
            .with_label_values(&[to.as_str(), queue])
            .inc();
    }

    pub fn transitions(&self, to: TaskStatus, queue: &str) -> u64 {
        self.task_transitions_total
            .with_label_values(&[to.as_str(), queue])
            .get()
    }

    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        self.queue_depth
            .with_label_values(&[queue])
            .set(depth as i64);
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> anyhow::Result<String> {
        use prometheus::{Encoder, TextEncoder};

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instances_do_not_collide() {
        let a = EngineMetrics::new().unwrap();
        let b = EngineMetrics::new().unwrap();

        a.inc_transition(TaskStatus::Completed, "default");
        assert_eq!(a.transitions(TaskStatus::Completed, "default"), 1);
        assert_eq!(b.transitions(TaskStatus::Completed, "default"), 0);
    }

    #[test]
    fn test_encode_contains_metric_names() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.set_queue_depth("emails", 3);
        metrics.leases_reclaimed_total.inc();

        let text = metrics.encode().unwrap();
        assert!(text.contains("tq_queue_depth{queue=\"emails\"} 3"));
        assert!(text.contains("tq_leases_reclaimed_total 1"));
    }
}
