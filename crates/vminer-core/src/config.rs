//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use vminer_api::ResourceKind;
use vminer_inventory::CollectorConfig;

use crate::error::CoreError;

/// Sync engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of workers, i.e. sources synced at once
    pub pool_size: usize,
    /// Connect timeout per source
    pub connect_timeout_secs: u64,
    /// Timeout for collecting one resource kind
    pub collect_timeout_secs: u64,
    /// Upper bound on event records per pass
    pub max_events: usize,
    /// Kinds to collect; parents of child kinds are added automatically
    pub kinds: Vec<ResourceKind>,
    /// Event broadcast channel capacity
    pub event_channel_capacity: usize,
    /// Retry policy for transient connect failures
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            connect_timeout_secs: 30,
            collect_timeout_secs: 300,
            max_events: 100,
            kinds: ResourceKind::ALL.to_vec(),
            event_channel_capacity: 1024,
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Connect timeout
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Per-kind collect timeout
    #[must_use]
    pub fn collect_timeout(&self) -> Duration {
        Duration::from_secs(self.collect_timeout_secs)
    }

    /// Collector settings derived from this config
    #[must_use]
    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            max_events: self.max_events,
            collect_timeout: self.collect_timeout(),
        }
    }

    /// Kinds in collection order, parents included
    #[must_use]
    pub fn plan(&self) -> Vec<ResourceKind> {
        ResourceKind::plan(&self.kinds)
    }

    /// Check settings for values the engine cannot run with
    ///
    /// # Errors
    /// Returns `CoreError::ConfigError` describing the first invalid value.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.pool_size == 0 {
            return Err(CoreError::ConfigError("pool_size must be at least 1".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(CoreError::ConfigError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(CoreError::ConfigError(
                "retry.base_delay_ms exceeds retry.max_delay_ms".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(CoreError::ConfigError(
                "event_channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry settings
///
/// A job waiting out its backoff does not hold a worker; it re-enters the
/// queue once the delay has passed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per job, first one included
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay_ms: u64,
    /// Upper bound on any single delay
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            max_delay_ms: 60_000,
        }
    }
}
