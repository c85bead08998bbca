use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{PersistError, Result};

/// How far the atomic writer goes before renaming the temp file into place.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// Flush and `fsync` the temp file before the rename.
    #[default]
    Sync,
    /// Flush userspace buffers only; the rename is still atomic.
    Flush,
}

/// Configuration for retry behavior on transient IO failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt in milliseconds.
    pub initial_delay_ms: u64,
    /// Factor applied to the delay after every failed attempt.
    pub backoff_multiplier: f64,
    /// Upper bound for a single delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Short policy used on the load path.
    pub fn fast() -> Self {
        Self {
            max_attempts: 2,
            initial_delay_ms: 50,
            backoff_multiplier: 2.0,
            max_delay_ms: 500,
        }
    }

    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
            backoff_multiplier: 1.0,
            max_delay_ms: 0,
        }
    }

    /// Computes the delay that follows failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.max(1.0);
        let mut delay = self.initial_delay_ms as f64;
        for _ in 1..attempt {
            delay *= multiplier;
        }
        let capped = delay.min(self.max_delay_ms.max(self.initial_delay_ms) as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Backup retention settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupPolicy {
    /// Number of backups kept per source file.
    pub max_backups: usize,
    /// Retry applied to backup copies and restores.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            max_backups: 5,
            retry: RetryPolicy::default(),
        }
    }
}

/// Settings for the incremental save scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerPolicy {
    /// Time between incremental ticks in milliseconds.
    pub interval_ms: u64,
    /// Maximum number of datasets saved per tick.
    pub batch_size: usize,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            batch_size: 5,
        }
    }
}

impl SchedulerPolicy {
    pub const MAX_BATCH_SIZE: usize = 20;

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, Self::MAX_BATCH_SIZE)
    }
}

/// Full operational policy for datasets and the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistPolicy {
    #[serde(default)]
    pub durability: DurabilityMode,
    #[serde(default)]
    pub backup: BackupPolicy,
    #[serde(default)]
    pub write_retry: RetryPolicy,
    #[serde(default = "RetryPolicy::fast")]
    pub load_retry: RetryPolicy,
    #[serde(default)]
    pub scheduler: SchedulerPolicy,
}

impl Default for PersistPolicy {
    fn default() -> Self {
        Self {
            durability: DurabilityMode::default(),
            backup: BackupPolicy::default(),
            write_retry: RetryPolicy::default(),
            load_retry: RetryPolicy::fast(),
            scheduler: SchedulerPolicy::default(),
        }
    }
}

impl PersistPolicy {
    /// Parses a policy embedded in a host configuration document.
    ///
    /// Missing sections fall back to their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| PersistError::ExecutionError(format!("parse persist policy: {}", err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 300,
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(300));
        assert_eq!(policy.delay_after(4), Duration::from_millis(300));
    }

    #[test]
    fn test_partial_policy_uses_defaults() {
        let policy =
            PersistPolicy::from_json_str(r#"{"scheduler": {"interval_ms": 50, "batch_size": 2}}"#)
                .unwrap();
        assert_eq!(policy.scheduler.batch_size, 2);
        assert_eq!(policy.backup.max_backups, 5);
        assert_eq!(policy.load_retry, RetryPolicy::fast());
        assert_eq!(policy.durability, DurabilityMode::Sync);
    }

    #[test]
    fn test_batch_size_is_clamped() {
        let policy = SchedulerPolicy {
            interval_ms: 0,
            batch_size: 0,
        };
        assert_eq!(policy.effective_batch_size(), 1);
        assert_eq!(policy.interval(), Duration::from_millis(1));
    }
}
