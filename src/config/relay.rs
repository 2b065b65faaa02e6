//! Relay configuration

use serde::Deserialize;
use std::time::Duration;

use super::error::ValidationError;

/// Relay configuration
///
/// Tuning for the outbox drain loop, the leadership lock, and the retention
/// sweep.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Maximum events drained per relay cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Fallback poll interval between drain cycles in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Publish attempts per event before it is marked terminally failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Leadership lock key (namespaced by the lock manager)
    #[serde(default = "default_lock_key")]
    pub lock_key: String,

    /// Leadership lease TTL in seconds
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// Standby wait before re-contending for leadership in seconds
    #[serde(default = "default_standby_interval")]
    pub standby_interval_secs: u64,

    /// Published rows older than this many hours are purged
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u32,
}

impl RelayConfig {
    /// Get poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Get lock TTL as Duration
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    /// Get standby interval as Duration
    pub fn standby_interval(&self) -> Duration {
        Duration::from_secs(self.standby_interval_secs)
    }

    /// Validate relay configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.batch_size == 0 {
            return Err(ValidationError::InvalidBatchSize);
        }
        if self.poll_interval_ms == 0 {
            return Err(ValidationError::InvalidPollInterval);
        }
        if self.max_retries == 0 {
            return Err(ValidationError::InvalidMaxRetries);
        }
        // Renewal runs at two-thirds of the TTL; below 2s the lease math
        // degenerates.
        if self.lock_ttl_secs < 2 {
            return Err(ValidationError::InvalidLockTtl);
        }
        Ok(())
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval(),
            max_retries: default_max_retries(),
            lock_key: default_lock_key(),
            lock_ttl_secs: default_lock_ttl(),
            standby_interval_secs: default_standby_interval(),
            retention_hours: default_retention_hours(),
        }
    }
}

fn default_batch_size() -> u32 {
    100
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_lock_key() -> String {
    "outbox-relay".to_string()
}

fn default_lock_ttl() -> u64 {
    30
}

fn default_standby_interval() -> u64 {
    5
}

fn default_retention_hours() -> u32 {
    72
}
