use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::pool::PoolSnapshot;

/// Failure counts for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ErrorTally {
    /// Fetch attempts that reached the upstream (or timed out).
    pub attempts: u64,
    pub retryable: u64,
    pub fatal: u64,
    /// Times no pair was free when a unit needed one.
    pub unavailable: u64,
    /// Units given up on after exhausting their attempts or the cycle budget.
    pub dropped: u64,
}

impl ErrorTally {
    pub fn add(&mut self, other: ErrorTally) {
        self.attempts += other.attempts;
        self.retryable += other.retryable;
        self.fatal += other.fatal;
        self.unavailable += other.unavailable;
        self.dropped += other.dropped;
    }
}

/// One collection cycle.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRun {
    pub id: Uuid,
    pub target: usize,
    pub concurrency: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Unique records gathered this cycle, after filtering.
    pub collected: u64,
    /// Records dropped as already seen, in this cycle or in storage.
    pub duplicates: u64,
    pub stored: u64,
    pub mirror_failures: u64,
    pub units: u64,
    pub errors: ErrorTally,
}

impl BatchRun {
    pub fn start(target: usize, concurrency: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            concurrency,
            started_at: Utc::now(),
            finished_at: None,
            collected: 0,
            duplicates: 0,
            stored: 0,
            mirror_failures: 0,
            units: 0,
            errors: ErrorTally::default(),
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Share of fetch attempts that failed.
    pub fn error_rate(&self) -> f64 {
        if self.errors.attempts == 0 {
            return if self.errors.unavailable > 0 { 1.0 } else { 0.0 };
        }
        (self.errors.retryable + self.errors.fatal) as f64 / self.errors.attempts as f64
    }

    pub fn under_delivered(&self) -> bool {
        (self.collected as usize) < self.target
    }

    pub fn elapsed_secs(&self) -> f64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Cumulative counters since startup plus a short window of recent runs.
#[derive(Debug, Clone)]
pub struct RunTotals {
    pub started_at: DateTime<Utc>,
    pub batches: u64,
    pub failed_cycles: u64,
    pub scraped: u64,
    pub stored: u64,
    pub errors: ErrorTally,
    recent: VecDeque<BatchRun>,
    window: usize,
}

impl RunTotals {
    pub fn new(window: usize) -> Self {
        Self {
            started_at: Utc::now(),
            batches: 0,
            failed_cycles: 0,
            scraped: 0,
            stored: 0,
            errors: ErrorTally::default(),
            recent: VecDeque::with_capacity(window),
            window: window.max(1),
        }
    }

    pub fn record(&mut self, run: &BatchRun) {
        self.batches += 1;
        self.scraped += run.collected;
        self.stored += run.stored;
        self.errors.add(run.errors);
        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(run.clone());
    }

    pub fn record_failure(&mut self) {
        self.failed_cycles += 1;
    }

    pub fn recent(&self) -> impl Iterator<Item = &BatchRun> {
        self.recent.iter()
    }

    pub fn stored_per_hour(&self, now: DateTime<Utc>) -> f64 {
        let hours = (now - self.started_at).num_seconds() as f64 / 3600.0;
        if hours <= 0.0 {
            return 0.0;
        }
        self.stored as f64 / hours
    }

    pub fn log_progress(&self, pool: &PoolSnapshot) {
        let per_hour = self.stored_per_hour(Utc::now());
        let recent_error_rate = if self.recent.is_empty() {
            0.0
        } else {
            self.recent.iter().map(BatchRun::error_rate).sum::<f64>() / self.recent.len() as f64
        };
        info!(
            batches = self.batches,
            failed_cycles = self.failed_cycles,
            scraped = self.scraped,
            stored = self.stored,
            per_hour = format!("{per_hour:.0}"),
            daily_projection = format!("{:.0}", per_hour * 24.0),
            recent_error_rate = format!("{recent_error_rate:.2}"),
            healthy_identities = pool.identities.healthy,
            healthy_accounts = pool.accounts.healthy,
            banned_accounts = pool.accounts.banned,
            pool_success_rate = format!("{:.2}", pool.success_rate()),
            "Collection progress"
        );
    }
}
