//! Retry policy with exponential backoff and jitter

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff schedule for transient provider failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Fractional jitter applied symmetrically around the computed delay
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            cap: Duration::from_secs(5),
            max_attempts: 3,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the given retry. `attempt` is zero-based: the delay after
    /// the first failed call is `delay_for(0)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self.base.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = exponential.min(self.cap.as_millis() as f64);

        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };

        Duration::from_millis(jittered.max(0.0) as u64)
    }
}
