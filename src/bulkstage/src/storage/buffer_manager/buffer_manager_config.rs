use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct BufferManagerConfig {
    /// Maximum number of write buffers held per tablet. Must be a power of
    /// two; hitting the limit means the release path has fallen behind and
    /// surfaces as a hard error rather than silent eviction.
    #[serde(default = "BufferManagerConfig::default_ring_capacity")]
    pub ring_capacity: usize,

    /// Delay between merge-job submissions while the scheduler reports
    /// backpressure, in milliseconds.
    #[serde(default = "BufferManagerConfig::default_schedule_retry_interval_ms")]
    pub schedule_retry_interval_ms: u64,
}

impl BufferManagerConfig {
    pub(crate) const DEFAULT_RING_CAPACITY: usize = 16;
    pub(crate) const DEFAULT_SCHEDULE_RETRY_INTERVAL_MS: u64 = 10;

    pub fn default_ring_capacity() -> usize {
        Self::DEFAULT_RING_CAPACITY
    }

    pub fn default_schedule_retry_interval_ms() -> u64 {
        Self::DEFAULT_SCHEDULE_RETRY_INTERVAL_MS
    }

    pub(crate) fn schedule_retry_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_retry_interval_ms)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.ring_capacity == 0 || !self.ring_capacity.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "ring capacity {} is not a power of two",
                self.ring_capacity
            )));
        }
        Ok(())
    }
}

impl Default for BufferManagerConfig {
    fn default() -> Self {
        BufferManagerConfig {
            ring_capacity: Self::DEFAULT_RING_CAPACITY,
            schedule_retry_interval_ms: Self::DEFAULT_SCHEDULE_RETRY_INTERVAL_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BufferManagerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ring_capacity, 16);
        assert_eq!(config.schedule_retry_interval(), Duration::from_millis(10));
    }

    #[test]
    fn test_non_power_of_two_capacity_rejected() {
        let config = BufferManagerConfig {
            ring_capacity: 12,
            ..BufferManagerConfig::default()
        };
        assert!(config.validate().is_err());
        let config = BufferManagerConfig {
            ring_capacity: 0,
            ..BufferManagerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
