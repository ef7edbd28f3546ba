//! Configuration Module
//!
//! Handles loading the demonstration binary's settings from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Demo configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of items seeded into the live cache
    pub item_count: usize,
    /// Base TTL in milliseconds; item `i` lives `(i + 1) * item_ttl_ms`
    pub item_ttl_ms: u64,
    /// Expiry polling interval in milliseconds, 0 = one timer per deadline
    pub polling_interval_ms: u64,
    /// How long the demo runs before shutting down by itself, in seconds
    pub run_secs: u64,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `ITEM_COUNT` - Items to seed (default: 10)
    /// - `ITEM_TTL_MS` - Base TTL in milliseconds (default: 1000)
    /// - `POLLING_INTERVAL_MS` - Expiry polling interval, 0 disables polling (default: 0)
    /// - `RUN_SECS` - Demo duration in seconds (default: 5)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            item_count: env_or("ITEM_COUNT", defaults.item_count),
            item_ttl_ms: env_or("ITEM_TTL_MS", defaults.item_ttl_ms),
            polling_interval_ms: env_or("POLLING_INTERVAL_MS", defaults.polling_interval_ms),
            run_secs: env_or("RUN_SECS", defaults.run_secs),
        }
    }

    /// TTL of the item at `index`.
    pub fn ttl_for(&self, index: usize) -> Duration {
        let factor = u64::try_from(index).unwrap_or(u64::MAX).saturating_add(1);
        Duration::from_millis(self.item_ttl_ms.saturating_mul(factor))
    }

    /// Polling interval to hand to the expiry operator.
    pub fn polling_interval(&self) -> Option<Duration> {
        (self.polling_interval_ms > 0).then(|| Duration::from_millis(self.polling_interval_ms))
    }

    pub fn run_duration(&self) -> Duration {
        Duration::from_secs(self.run_secs)
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            item_count: 10,
            item_ttl_ms: 1000,
            polling_interval_ms: 0,
            run_secs: 5,
        }
    }
}
