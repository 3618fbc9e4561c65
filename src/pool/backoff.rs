//! Exponential backoff with symmetric jitter for connection acquisition.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Delay schedule: `min(base * factor^(attempt-1), max)`, then jittered by up to
/// `±jitter` of itself and clamped at zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Backoff {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base: Duration::from_millis(config.delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            factor: config.factor.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let scaled = self.base.as_secs_f64() * self.factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Delay before retry number `attempt`, with random jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let unit = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.jittered(attempt, unit)
    }

    /// Applies jitter for a given draw `unit` in `[-1, 1]`.
    pub fn jittered(&self, attempt: u32, unit: f64) -> Duration {
        let delay = self.base_delay(attempt).as_secs_f64();
        let jittered = delay + delay * self.jitter * unit.clamp(-1.0, 1.0);
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Smallest total wait across `retries` retries (every draw at -1).
    pub fn min_total(&self, retries: u32) -> Duration {
        (1..=retries).map(|attempt| self.jittered(attempt, -1.0)).sum()
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
