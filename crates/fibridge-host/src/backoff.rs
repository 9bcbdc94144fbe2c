//! Exponential reconnect backoff with a capped delay and a retry budget.

use rand::Rng;
use std::time::Duration;

/// Configuration for reconnect backoff
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt
    pub initial_delay: Duration,

    /// Maximum delay (caps exponential growth)
    pub max_delay: Duration,

    /// Multiplier applied to the delay after each failed attempt
    pub multiplier: f64,

    /// Attempts allowed before the session gives up
    pub max_retries: u32,

    /// Randomize each delay to 50–100% of its nominal value
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: 8,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Nominal (unjittered) delay before attempt number `attempt` (1-based).
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.initial_delay.min(self.max_delay);
        }

        let factor = self.multiplier.powi(attempt as i32 - 1);
        let delay_ms = self.initial_delay.as_millis() as f64 * factor;
        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(delay_ms as u64)
    }
}

/// Tracks reconnect attempts for one outage.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Attempts made since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_retries {
            return None;
        }
        self.attempt += 1;

        let nominal = self.config.nominal_delay(self.attempt);
        if !self.config.jitter || nominal.is_zero() {
            return Some(nominal);
        }

        let nominal_ms = nominal.as_millis() as u64;
        let jittered = rand::rng().random_range(nominal_ms / 2..=nominal_ms);
        Some(Duration::from_millis(jittered))
    }

    /// Called once a connection reaches Open again.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
