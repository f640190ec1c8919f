use std::time::Duration;

use tracing::info;

use super::batch::BatchRun;

/// Adapts concurrency and the inter-cycle interval to how the last cycle went.
#[derive(Debug, Clone)]
pub struct Pacer {
    base_interval: Duration,
    max_interval: Duration,
    max_concurrency: usize,
    error_rate_threshold: f64,
    interval: Duration,
    concurrency: usize,
}

impl Pacer {
    pub fn new(
        base_interval: Duration,
        max_interval: Duration,
        initial_concurrency: usize,
        max_concurrency: usize,
        error_rate_threshold: f64,
    ) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            base_interval,
            max_interval: max_interval.max(base_interval),
            max_concurrency,
            error_rate_threshold,
            interval: base_interval,
            concurrency: initial_concurrency.clamp(1, max_concurrency),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn observe(&mut self, run: &BatchRun) {
        let error_rate = run.error_rate();
        if error_rate > self.error_rate_threshold {
            let next = self.interval.saturating_mul(2).min(self.max_interval);
            if next != self.interval {
                info!(
                    error_rate = format!("{error_rate:.2}"),
                    interval_secs = next.as_secs(),
                    "High error rate, slowing down"
                );
            }
            self.interval = next;
        } else if self.interval > self.base_interval {
            self.interval = (self.interval / 2).max(self.base_interval);
        }

        if run.under_delivered() && self.concurrency < self.max_concurrency {
            self.concurrency += 1;
            info!(concurrency = self.concurrency, "Under target, raising concurrency");
        }
    }
}
