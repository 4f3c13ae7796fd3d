//! Exponential backoff for deferred requests.
//!
//! The curve is `base_delay * retry_factor^retry_count`, capped at a
//! configurable ceiling. The factor is a per-row integer (default 2); base
//! and ceiling come from engine configuration.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backoff configuration shared by all rows a worker processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Ceiling on any computed delay.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base_delay: Duration::from_secs(1), max_delay: Duration::from_secs(3600) }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt, given the row's factor and the number
    /// of attempts already counted against it.
    ///
    /// The exponent is clamped to keep the multiplication in range; the cap
    /// makes anything past it irrelevant anyway.
    pub fn delay_for(&self, retry_factor: i32, retry_count: i32) -> Duration {
        let factor = u32::try_from(retry_factor).unwrap_or(1).max(1);
        let exponent = u32::try_from(retry_count).unwrap_or(0).min(20);
        let multiplier = factor.saturating_pow(exponent);

        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }

    /// Absolute timestamp of the next attempt.
    pub fn retry_at(
        &self,
        now: DateTime<Utc>,
        retry_factor: i32,
        retry_count: i32,
    ) -> DateTime<Utc> {
        let delay = self.delay_for(retry_factor, retry_count);
        let delay = chrono::Duration::from_std(delay)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::try_from(
                self.max_delay.as_secs(),
            )
            .unwrap_or(i64::MAX)));

        now + delay
    }
}
