//! Exponential backoff between task retries.
//!
//! The delay doubles with each retry and is capped:
//! 30s → 60s → 120s → ... → 1h (max), with the default configuration.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::domain::models::RetryConfig;

/// Bounded exponential backoff for task retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retry budget given to new tasks
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds
    pub initial_backoff_ms: u64,
    /// Upper bound on any delay, in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms.max(config.initial_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Policy with explicit limits; `max_backoff_ms` is raised to `initial_backoff_ms` if lower.
    pub fn new(max_retries: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            initial_backoff_ms,
            max_backoff_ms: max_backoff_ms.max(initial_backoff_ms),
        }
    }

    /// Delay before retry number `retry_count` (1-based).
    ///
    /// `min(initial * 2^(retry_count - 1), max)`. A count of zero is treated
    /// as the first retry.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1);
        let factor = 2u64.saturating_pow(exponent);
        let ms = self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// When a task that just failed for the `retry_count`-th time becomes due.
    pub fn next_retry_at(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.backoff(retry_count))
            .unwrap_or_else(|_| chrono::Duration::milliseconds(self.max_backoff_ms as i64));
        now + delay
    }
}
