//! Boot configuration
//!
//! Timings and limits for the boot layer. Loadable from TOML; every field
//! has a default so partial files are accepted.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Automatic retry policy for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Automatic retries after the first attempt
    pub max_auto_retries: u32,
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Backoff multiplier (1.0 = fixed delay)
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Policy that never retries automatically
    #[inline]
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_auto_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based)
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        // Saturate rather than overflow on absurd exponents
        let millis = (self.base_delay_ms as f64 * factor).min(u64::MAX as f64);
        Duration::from_millis(millis as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_auto_retries: 2,
            base_delay_ms: 1_000,
            multiplier: 1.0,
        }
    }
}

/// Boot layer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    /// Deadline before a waiting boot is declared stuck, in milliseconds
    pub watchdog_timeout_ms: u64,
    /// Retry policy for connection construction and profile fetch
    pub retry: RetryPolicy,
    /// Pause between eviction and reconstruction on user Retry, in milliseconds
    pub retry_settle_delay_ms: u64,
    /// Maximum cached entries
    pub cache_capacity: u64,
}

impl BootConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML text and validate
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject values the boot layer cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watchdog_timeout_ms == 0 {
            return Err(ConfigError::Invalid("watchdog_timeout_ms must be non-zero".into()));
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::Invalid("cache_capacity must be non-zero".into()));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.multiplier must be at least 1.0".into()));
        }
        Ok(())
    }

    /// With watchdog deadline
    #[inline]
    #[must_use]
    pub fn with_watchdog_timeout(mut self, timeout: Duration) -> Self {
        self.watchdog_timeout_ms = duration_ms(timeout);
        self
    }

    /// With retry policy
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// With settle delay for user Retry
    #[inline]
    #[must_use]
    pub fn with_retry_settle_delay(mut self, delay: Duration) -> Self {
        self.retry_settle_delay_ms = duration_ms(delay);
        self
    }

    /// With cache capacity
    #[inline]
    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: u64) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Watchdog deadline
    #[inline]
    #[must_use]
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    /// Settle delay for user Retry
    #[inline]
    #[must_use]
    pub fn retry_settle_delay(&self) -> Duration {
        Duration::from_millis(self.retry_settle_delay_ms)
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout_ms: 15_000,
            retry: RetryPolicy::default(),
            retry_settle_delay_ms: 250,
            cache_capacity: 1_024,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
