//! Engine tuning knobs.

use std::time::Duration;

use megamodel_storage::ConsistencyType;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Configuration for [`CoherenceEngine`](crate::CoherenceEngine) and the
/// background tasks around it.
///
/// Every field has a default, so a partial TOML table is enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Retries of a whole write after a CAS or fencing conflict.
    pub max_write_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Bound on each peer invalidation and on fence-lock acquisition.
    pub fence_timeout_ms: u64,
    /// Bound on a coherence fetch from the authoritative holder.
    pub refetch_timeout_ms: u64,
    /// Installed when a row switches to `BOUNDED_STALENESS` without a bound.
    pub default_staleness_bound_ms: u64,
    /// Consistency type of implicitly registered rows.
    pub default_consistency: ConsistencyType,
    /// Period of the anti-entropy sweeper; 0 disables it.
    pub sweep_interval_ms: u64,
    /// Default number of entries in recent-transition and activity feeds.
    pub recent_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_write_retries: 5,
            backoff_base_ms: 10,
            backoff_max_ms: 500,
            fence_timeout_ms: 2_000,
            refetch_timeout_ms: 2_000,
            default_staleness_bound_ms: 30_000,
            default_consistency: ConsistencyType::Eventual,
            sweep_interval_ms: 10_000,
            recent_window: 50,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fence_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "fence_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.refetch_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "refetch_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(ConfigError::Invalid {
                field: "backoff_base_ms",
                reason: format!(
                    "({}) exceeds backoff_max_ms ({})",
                    self.backoff_base_ms, self.backoff_max_ms
                ),
            });
        }
        if self.recent_window == 0 {
            return Err(ConfigError::Invalid {
                field: "recent_window",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    pub fn refetch_timeout(&self) -> Duration {
        Duration::from_millis(self.refetch_timeout_ms)
    }

    /// `None` when the sweeper is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms > 0).then(|| Duration::from_millis(self.sweep_interval_ms))
    }

    /// Staleness bound for a row switching to `consistency_type`.
    pub fn bound_for(
        &self,
        consistency_type: ConsistencyType,
        requested: Option<u64>,
    ) -> Option<u64> {
        match (consistency_type, requested) {
            (_, Some(bound)) => Some(bound),
            (ConsistencyType::BoundedStaleness, None) => Some(self.default_staleness_bound_ms),
            _ => None,
        }
    }

    /// Delay before retry number `attempt` (0-based): exponential from
    /// `backoff_base_ms`, capped at `backoff_max_ms`, plus up to one base
    /// unit of jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.min(20))
            .min(self.backoff_max_ms);
        let jitter = if self.backoff_base_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.backoff_base_ms)
        };
        Duration::from_millis(exp.saturating_add(jitter))
    }
}
