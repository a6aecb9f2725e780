use rpcproxy_common::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What `borrow` does when `max_size` connections already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Create a transient surplus connection rather than make the caller wait.
    #[default]
    Grow,
    /// Wait for a connection to be returned or invalidated, up to `max_wait_ms`.
    Block,
    /// Fail immediately with `PoolExhausted`.
    FailFast,
}

/// Connection pool configuration.
///
/// # Default Configuration
///
/// - `max_size`: 10
/// - `max_wait_ms`: 100
/// - `max_idle`: same as `max_size`
/// - `min_idle`: half of `max_size`
/// - `eviction_interval_ms`: 20000 (0 disables the evictor)
/// - `tests_per_eviction_run`: 3
/// - `min_evictable_idle_ms`: 1800000, 30 minutes (0 disables idle-time eviction)
/// - `exhaustion_policy`: [`ExhaustionPolicy::Grow`]
///
/// # Example
///
/// ```rust
/// use rpcproxy_client::{ExhaustionPolicy, PoolConfig};
///
/// let config = PoolConfig {
///     max_size: 2,
///     exhaustion_policy: ExhaustionPolicy::Block,
///     ..PoolConfig::default()
/// };
/// assert_eq!(config.max_idle(), 2);
/// assert_eq!(config.min_idle(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of connections before the exhaustion policy applies
    pub max_size: usize,
    /// Maximum time a borrow may wait for a connection, in milliseconds
    pub max_wait_ms: u64,
    /// Maximum idle connections kept; `None` means `max_size`
    pub max_idle: Option<usize>,
    /// Idle connections the evictor tops up to; `None` means `max_size / 2`
    pub min_idle: Option<usize>,
    /// Interval between eviction sweeps in milliseconds
    pub eviction_interval_ms: u64,
    /// Idle connections examined per eviction sweep
    pub tests_per_eviction_run: usize,
    /// Idle time after which a connection is evicted without testing
    pub min_evictable_idle_ms: u64,
    pub exhaustion_policy: ExhaustionPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            max_wait_ms: 100,
            max_idle: None,
            min_idle: None,
            eviction_interval_ms: 20_000,
            tests_per_eviction_run: 3,
            min_evictable_idle_ms: 30 * 60 * 1000,
            exhaustion_policy: ExhaustionPolicy::Grow,
        }
    }
}

impl PoolConfig {
    pub fn max_idle(&self) -> usize {
        self.max_idle.unwrap_or(self.max_size)
    }

    /// Effective minimum idle count, never above `max_idle`.
    pub fn min_idle(&self) -> usize {
        self.min_idle
            .unwrap_or(self.max_size / 2)
            .min(self.max_idle())
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn eviction_interval(&self) -> Option<Duration> {
        if self.eviction_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.eviction_interval_ms))
        }
    }

    pub fn min_evictable_idle(&self) -> Option<Duration> {
        if self.min_evictable_idle_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.min_evictable_idle_ms))
        }
    }

    /// Rejects sizing that would make the pool unusable.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(ProxyError::Configuration(
                "pool max_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_size, 10);
        assert_eq!(config.max_wait(), Duration::from_millis(100));
        assert_eq!(config.max_idle(), 10);
        assert_eq!(config.min_idle(), 5);
        assert_eq!(config.eviction_interval(), Some(Duration::from_secs(20)));
        assert_eq!(config.tests_per_eviction_run, 3);
        assert_eq!(config.min_evictable_idle(), Some(Duration::from_secs(1800)));
        assert_eq!(config.exhaustion_policy, ExhaustionPolicy::Grow);
    }

    #[test]
    fn test_idle_bounds_follow_max_size() {
        let config = PoolConfig {
            max_size: 4,
            ..PoolConfig::default()
        };
        assert_eq!(config.max_idle(), 4);
        assert_eq!(config.min_idle(), 2);
    }

    #[test]
    fn test_min_idle_clamped_to_max_idle() {
        let config = PoolConfig {
            max_idle: Some(1),
            min_idle: Some(6),
            ..PoolConfig::default()
        };
        assert_eq!(config.min_idle(), 1);
    }

    #[test]
    fn test_zero_intervals_disable_features() {
        let config = PoolConfig {
            eviction_interval_ms: 0,
            min_evictable_idle_ms: 0,
            ..PoolConfig::default()
        };
        assert!(config.eviction_interval().is_none());
        assert!(config.min_evictable_idle().is_none());
    }

    #[test]
    fn test_zero_max_size_rejected() {
        let config = PoolConfig {
            max_size: 0,
            ..PoolConfig::default()
        };
        assert!(matches!(config.validate(), Err(ProxyError::Configuration(_))));
    }

    #[test]
    fn test_deserialize_partial_json_uses_defaults() {
        let config: PoolConfig =
            serde_json::from_str(r#"{"max_size": 2, "exhaustion_policy": "fail_fast"}"#).unwrap();
        assert_eq!(config.max_size, 2);
        assert_eq!(config.max_wait_ms, 100);
        assert_eq!(config.max_idle(), 2);
        assert_eq!(config.exhaustion_policy, ExhaustionPolicy::FailFast);
    }
}
