//! Batch load timings.

use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchMetrics {
    pub items: usize,
    pub validation: Duration,
    pub sql_generation: Duration,
    pub execution: Duration,
    pub total: Duration,
}

impl BatchMetrics {
    /// Items per second over the whole load; zero when nothing was timed.
    pub fn throughput(&self) -> f64 {
        let secs = self.total.as_secs_f64();
        if secs > 0.0 {
            self.items as f64 / secs
        } else {
            0.0
        }
    }
}
