use crate::Task;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay grows between retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Every retry waits `base`
    Fixed,
    /// Retry k waits `base * 2^(k-1)`, never more than `cap`
    Exponential,
}

/// Deterministic retry delay policy.
///
/// The delay depends only on the retry number and the configured base/cap,
/// so the same inputs always give the same schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    pub base: Duration,
    pub cap: Duration,
}

/// Outcome of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Hold the task for `delay`, then make it pending again
    Retry { retry: u32, delay: Duration },
    /// Retries exhausted
    Fail,
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        BackoffPolicy {
            strategy: BackoffStrategy::Fixed,
            base: delay,
            cap: delay,
        }
    }

    pub fn exponential(base: Duration, cap: Duration) -> Self {
        BackoffPolicy {
            strategy: BackoffStrategy::Exponential,
            base,
            cap,
        }
    }

    /// Delay before retry number `retry` (1-indexed).
    ///
    /// `base_override` replaces the configured base, the cap still applies.
    pub fn delay(&self, retry: u32, base_override: Option<Duration>) -> Duration {
        let base = base_override.unwrap_or(self.base);
        match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential => {
                let exponent = retry.saturating_sub(1);
                2u32.checked_pow(exponent)
                    .and_then(|factor| base.checked_mul(factor))
                    .map_or(self.cap, |delay| delay.min(self.cap))
            }
        }
    }

    /// Decide what happens to a task whose current attempt just failed
    pub fn decide(&self, task: &Task) -> RetryDecision {
        if task.can_retry() {
            let retry = task.retry_count + 1;
            RetryDecision::Retry {
                retry,
                delay: self.delay(retry, task.retry_delay),
            }
        } else {
            RetryDecision::Fail
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(30))
    }
}
