//! Reconnection backoff

use rand::Rng;
use std::time::Duration;

use crate::config::BackoffConfig;

/// Exponential backoff with jitter. One per relay connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Delay before the next attempt, before jitter
    pub fn base_delay(&self) -> Duration {
        let exp = self.failures.min(63) as i32;
        let ms = (self.config.initial_ms as f64) * self.config.factor.powi(exp);
        Duration::from_millis(ms.min(self.config.max_ms as f64) as u64)
    }

    /// Record a failure and return how long to wait
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.failures = self.failures.saturating_add(1);

        let jitter = self.config.jitter;
        if jitter <= 0.0 {
            return base;
        }
        let scale = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(scale)
    }

    /// Called after a successful connect
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
