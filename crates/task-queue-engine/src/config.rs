use serde::{Deserialize, Serialize};
use std::time::Duration;
use task_queue_core::{BackoffPolicy, BackoffStrategy, TaskError, DEFAULT_QUEUE};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: SchedulingConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Lease TTL for tasks without their own timeout
    pub default_lease_ttl_secs: u64,
    /// How often expired leases and dead workers are reclaimed
    pub sweep_interval_ms: u64,
    /// How often scheduled and retrying tasks are promoted
    pub promote_interval_ms: u64,
    /// Workers silent for longer than this are considered dead
    pub worker_timeout_secs: u64,
    /// Queue scan order for workers that do not declare one
    pub default_queue_order: Vec<String>,
    /// Upper bound for long-poll waits
    pub max_poll_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub strategy: BackoffStrategy,
    pub base_ms: u64,
    pub cap_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Attempts per storage call before surfacing `StorageUnavailable`
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        SchedulingConfig {
            default_lease_ttl_secs: 30,
            sweep_interval_ms: 1000,
            promote_interval_ms: 250,
            worker_timeout_secs: 30,
            default_queue_order: vec![DEFAULT_QUEUE.to_string()],
            max_poll_wait_ms: 30_000,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            strategy: BackoffStrategy::Exponential,
            base_ms: 1000,
            cap_ms: 30_000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            retry_attempts: 3,
            retry_base_delay_ms: 50,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            log_level: "info".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            engine: SchedulingConfig::default(),
            backoff: BackoffConfig::default(),
            storage: StorageConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        let invalid = |msg: &str| Err(TaskError::InvalidConfig(msg.to_string()));

        if self.engine.sweep_interval_ms == 0 {
            return invalid("engine.sweep_interval_ms must be positive");
        }
        if self.engine.promote_interval_ms == 0 {
            return invalid("engine.promote_interval_ms must be positive");
        }
        if self.engine.default_lease_ttl_secs == 0 {
            return invalid("engine.default_lease_ttl_secs must be positive");
        }
        if self.engine.worker_timeout_secs == 0 {
            return invalid("engine.worker_timeout_secs must be positive");
        }
        if self.backoff.cap_ms < self.backoff.base_ms {
            return invalid("backoff.cap_ms must not be smaller than backoff.base_ms");
        }
        if self.storage.retry_attempts == 0 {
            return invalid("storage.retry_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            strategy: self.backoff.strategy,
            base: Duration::from_millis(self.backoff.base_ms),
            cap: Duration::from_millis(self.backoff.cap_ms),
        }
    }

    pub fn default_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.engine.default_lease_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.engine.sweep_interval_ms)
    }

    pub fn promote_interval(&self) -> Duration {
        Duration::from_millis(self.engine.promote_interval_ms)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.worker_timeout_secs)
    }

    pub fn max_poll_wait(&self) -> Duration {
        Duration::from_millis(self.engine.max_poll_wait_ms)
    }
}
