//! Retry policy for failed message sends.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Controls how the retry sweep re-attempts failed sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries per message log entry.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay before an entry becomes eligible again, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Growth factor applied per retry already made.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on the computed delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Add up to 10% jitter so concurrent sweepers spread out.
    #[serde(default)]
    pub use_jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5 * 60 * 1000
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

fn default_max_delay_ms() -> u64 {
    60 * 60 * 1000
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Delay to wait after the retry numbered `retry_count` (0-indexed) is claimed.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let base = self.retry_delay_ms as f64 * self.backoff_multiplier.powi(retry_count as i32);
        let delay_ms = base.min(self.max_delay_ms as f64).max(0.0) as u64;

        if self.use_jitter {
            let jitter = (delay_ms as f64 * 0.1 * rand::random::<f64>()) as u64;
            Duration::from_millis(delay_ms + jitter)
        } else {
            Duration::from_millis(delay_ms)
        }
    }

    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            use_jitter: false,
        }
    }
}
