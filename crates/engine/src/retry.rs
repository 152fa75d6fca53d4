//! Retry policy with exponential backoff and jitter
//!
//! Delay computation is a pure function of the attempt number and a jitter
//! sample so it can be tested without timers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-task retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Upper bound of the random extra delay, as a fraction of the backoff
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Attempts allowed, never less than one
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based)
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.attempts()
    }

    /// Delay before the retry that follows attempt `attempt` (1-based).
    ///
    /// `jitter_sample` is expected in `[0, 1)`; values outside are clamped.
    pub fn delay(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            1.0
        };
        let backoff = self.base_delay_ms as f64 * multiplier.powi(exponent);
        let capped = backoff.min(self.max_delay_ms as f64);

        let sample = if jitter_sample.is_finite() {
            jitter_sample.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let jitter = capped * self.jitter.clamp(0.0, 1.0) * sample;

        Duration::from_millis((capped + jitter) as u64)
    }

    /// Delay using a fresh random jitter sample
    pub fn delay_random(&self, attempt: u32) -> Duration {
        self.delay(attempt, rand::random::<f64>())
    }

    /// Worst-case wall time for all attempts of a task with `task_timeout`
    pub fn budget(&self, task_timeout: Duration) -> Duration {
        let mut total = task_timeout.saturating_mul(self.attempts());
        for attempt in 1..self.attempts() {
            total = total.saturating_add(self.delay(attempt, 1.0));
        }
        total
    }
}
