// Collection loop: each cycle fans out fetch units over the pool until the
// batch target is met or the cycle budget runs out, then persists the batch.

pub mod batch;
pub mod pacing;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use harvest_archive::{Archive, ArchiveError};
use harvest_common::{Config, Record, DEFAULT_TARGET_HASHTAGS};

use crate::fetch::{FetchExecutor, FetchResult, FetchSpec, RecordFilter};
use crate::pool::{PoolError, ResourcePool};

pub use batch::{BatchRun, ErrorTally, RunTotals};
pub use pacing::Pacer;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on records per cycle.
    pub batch_size: usize,
    pub interval: Duration,
    pub max_interval: Duration,
    pub tweets_per_hour: u64,
    pub initial_concurrency: usize,
    pub max_concurrency: usize,
    /// Records requested per fetch unit.
    pub per_fetch_limit: usize,
    pub max_units_per_cycle: usize,
    /// Fetch attempts per unit before it is dropped.
    pub max_attempts: u32,
    pub acquire_backoff: Duration,
    pub cycle_budget: Duration,
    pub recovery_interval: Duration,
    pub error_rate_threshold: f64,
    /// How far back each search looks.
    pub search_window: Duration,
    pub progress_every: u64,
    pub queries: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 150,
            interval: Duration::from_secs(300),
            max_interval: Duration::from_secs(3600),
            tweets_per_hour: 1800,
            initial_concurrency: 2,
            max_concurrency: 5,
            per_fetch_limit: 50,
            max_units_per_cycle: 60,
            max_attempts: 3,
            acquire_backoff: Duration::from_secs(2),
            cycle_budget: Duration::from_secs(240),
            recovery_interval: Duration::from_secs(60),
            error_rate_threshold: 0.5,
            search_window: Duration::from_secs(3600),
            progress_every: 10,
            queries: DEFAULT_TARGET_HASHTAGS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        let interval = Duration::from_secs(config.batch_interval_secs);
        Self {
            batch_size: config.batch_size,
            interval,
            max_interval: interval.saturating_mul(8),
            tweets_per_hour: config.tweets_per_hour,
            max_concurrency: config.max_concurrent,
            initial_concurrency: config.max_concurrent.div_ceil(2),
            // Leave a fifth of the interval for persistence and slack.
            cycle_budget: interval.mul_f64(0.8).max(Duration::from_secs(10)),
            queries: config.target_hashtags.clone(),
            ..Default::default()
        }
    }

    /// Records per cycle needed to hit the hourly rate, within `[1, batch_size]`.
    pub fn target_batch_size(&self) -> usize {
        let per_cycle = (self.tweets_per_hour as f64 * self.interval.as_secs_f64() / 3600.0).ceil();
        (per_cycle as usize).clamp(1, self.batch_size.max(1))
    }
}

/// What one fetch unit produced, including its share of the cycle's errors.
struct UnitOutcome {
    reserved: usize,
    records: Vec<Record>,
    errors: ErrorTally,
}

#[derive(Clone)]
struct UnitContext {
    pool: ResourcePool,
    executor: FetchExecutor,
    max_attempts: u32,
    acquire_backoff: Duration,
    deadline: Instant,
    stop: watch::Receiver<bool>,
}

impl UnitContext {
    /// Fetch `spec`, retrying up to `max_attempts`. A stop request ends the
    /// unit before its next acquire; a fetch already running is finished.
    async fn run(mut self, spec: FetchSpec, reserved: usize) -> UnitOutcome {
        let mut errors = ErrorTally::default();
        let mut attempt = 0;

        while attempt < self.max_attempts {
            if *self.stop.borrow() {
                break;
            }
            let lease = match self.pool.acquire() {
                Ok(lease) => lease,
                Err(PoolError::Unavailable) => {
                    errors.unavailable += 1;
                    if Instant::now() + self.acquire_backoff >= self.deadline {
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.acquire_backoff) => {}
                        changed = self.stop.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Pool acquire failed");
                    break;
                }
            };

            attempt += 1;
            errors.attempts += 1;
            match self.executor.execute(lease, &spec).await {
                FetchResult::Success(mut records) => {
                    records.truncate(reserved);
                    return UnitOutcome {
                        reserved,
                        records,
                        errors,
                    };
                }
                FetchResult::RetryableFailure(_) => errors.retryable += 1,
                FetchResult::FatalFailure(_) => {
                    errors.fatal += 1;
                    break;
                }
            }
        }

        errors.dropped += 1;
        UnitOutcome {
            reserved,
            records: Vec::new(),
            errors,
        }
    }
}

pub struct CollectionScheduler {
    pool: ResourcePool,
    executor: FetchExecutor,
    archive: Arc<Archive>,
    filter: RecordFilter,
    config: SchedulerConfig,
}

impl CollectionScheduler {
    pub fn new(
        pool: ResourcePool,
        executor: FetchExecutor,
        archive: Arc<Archive>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            filter: RecordFilter::new(&config.queries),
            pool,
            executor,
            archive,
            config,
        }
    }

    /// Run cycles until `stop` turns true. Returns the totals gathered.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> RunTotals {
        let mut pacer = Pacer::new(
            self.config.interval,
            self.config.max_interval,
            self.config.initial_concurrency,
            self.config.max_concurrency,
            self.config.error_rate_threshold,
        );
        let mut totals = RunTotals::new(20);
        let mut cursor = 0usize;

        info!(
            target = self.config.target_batch_size(),
            interval_secs = self.config.interval.as_secs(),
            max_concurrency = self.config.max_concurrency,
            queries = self.config.queries.len(),
            "Collection scheduler starting"
        );

        while !*stop.borrow() {
            let pause = match self
                .run_cycle(pacer.concurrency(), &mut cursor, stop.clone())
                .await
            {
                Ok(run) => {
                    info!(
                        run_id = %run.id,
                        target = run.target,
                        collected = run.collected,
                        stored = run.stored,
                        duplicates = run.duplicates,
                        retryable = run.errors.retryable,
                        fatal = run.errors.fatal,
                        dropped = run.errors.dropped,
                        elapsed_secs = format!("{:.1}", run.elapsed_secs()),
                        "Batch complete"
                    );
                    if run.units > 0 && run.collected == 0 {
                        warn!(run_id = %run.id, "Batch collected nothing");
                    }
                    pacer.observe(&run);
                    totals.record(&run);
                    if totals.batches % self.config.progress_every.max(1) == 0 {
                        totals.log_progress(&self.pool.snapshot());
                    }
                    pacer.interval()
                }
                Err(e) => {
                    error!(error = %e, "Batch failed, recovering");
                    totals.record_failure();
                    self.config.recovery_interval
                }
            };

            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        totals.log_progress(&self.pool.snapshot());
        info!(batches = totals.batches, stored = totals.stored, "Collection scheduler stopped");
        totals
    }

    /// One cycle. Storage errors abandon the cycle; fetch errors only count.
    pub async fn run_cycle(
        &self,
        concurrency: usize,
        cursor: &mut usize,
        mut stop: watch::Receiver<bool>,
    ) -> Result<BatchRun, ArchiveError> {
        let target = self.config.target_batch_size();
        let mut run = BatchRun::start(target, concurrency);
        let deadline = Instant::now() + self.config.cycle_budget;
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let ctx = UnitContext {
            pool: self.pool.clone(),
            executor: self.executor.clone(),
            max_attempts: self.config.max_attempts.max(1),
            acquire_backoff: self.config.acquire_backoff,
            deadline,
            stop: stop.clone(),
        };

        let mut units: JoinSet<UnitOutcome> = JoinSet::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut records: Vec<Record> = Vec::new();
        let mut reserved = 0usize;
        let mut stopping = *stop.borrow();

        loop {
            let remaining = target.saturating_sub(records.len() + reserved);
            let may_spawn = !stopping
                && remaining > 0
                && (run.units as usize) < self.config.max_units_per_cycle
                && Instant::now() < deadline
                && !self.config.queries.is_empty();

            if may_spawn {
                if let Ok(permit) = permits.clone().try_acquire_owned() {
                    let limit = remaining.min(self.config.per_fetch_limit.max(1));
                    let spec = self.next_search(cursor, limit);
                    reserved += limit;
                    run.units += 1;
                    let ctx = ctx.clone();
                    units.spawn(async move {
                        let outcome = ctx.run(spec, limit).await;
                        drop(permit);
                        outcome
                    });
                    continue;
                }
            }

            if units.is_empty() {
                break;
            }

            tokio::select! {
                joined = units.join_next() => {
                    let Some(joined) = joined else { continue };
                    match joined {
                        Ok(outcome) => {
                            reserved = reserved.saturating_sub(outcome.reserved);
                            run.errors.add(outcome.errors);
                            for record in outcome.records {
                                if !self.filter.keep(&record) {
                                    continue;
                                }
                                if seen.insert(record.id.clone()) {
                                    records.push(record);
                                } else {
                                    run.duplicates += 1;
                                }
                            }
                        }
                        Err(e) => error!(error = %e, "Fetch unit panicked"),
                    }
                }
                changed = stop.changed(), if !stopping => {
                    if changed.is_err() || *stop.borrow() {
                        info!(in_flight = units.len(), "Stop requested, finishing in-flight units");
                        stopping = true;
                    }
                }
            }
        }

        records.truncate(target);
        run.collected = records.len() as u64;

        let stats = self.archive.insert_batch(&records).await?;
        run.stored = stats.inserted;
        run.duplicates += stats.duplicates;
        run.mirror_failures = stats.mirror_failures;
        run.finish();
        Ok(run)
    }

    fn next_search(&self, cursor: &mut usize, limit: usize) -> FetchSpec {
        let query = self.config.queries[*cursor % self.config.queries.len()].clone();
        *cursor = cursor.wrapping_add(1);
        let until = Utc::now();
        let since = until
            - chrono::Duration::from_std(self.config.search_window).unwrap_or(chrono::Duration::hours(1));
        FetchSpec::Search {
            query,
            since,
            until,
            limit: limit as u32,
        }
    }
}
