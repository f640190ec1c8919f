use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use apify_client::{SearchTerm, TweetScraperInput};
use harvest_archive::Archive;
use harvest_common::{identifier_from, normalize_tweet_url, AggregateStats, QueryRequest, Record};
use harvest_scout::{FetchExecutor, FetchResult, FetchSpec, PoolError, ResourcePool};

use crate::error::{ApiError, Result};

pub const DEFAULT_LIMIT: u32 = 150;
pub const MAX_LIMIT: u32 = 1000;
const DEFAULT_LOOKBACK_HOURS: i64 = 24;
const TOP_LABELS: usize = 10;

/// Result of a validation request. `records` follow the order of the request.
#[derive(Debug, Clone, Default)]
pub struct ValidateOutcome {
    pub records: Vec<Record>,
    pub requested: usize,
    pub from_storage: usize,
    pub fetched: usize,
    /// Identifiers that neither storage nor the fallback could supply.
    pub missing: Vec<String>,
    pub fallback_timed_out: bool,
}

struct Fallback {
    pool: ResourcePool,
    executor: FetchExecutor,
}

/// Answers reads from the archive. Validation misses may be repaired with one
/// bounded upstream lookup when a fallback pool is configured.
pub struct QueryService {
    archive: Arc<Archive>,
    fallback: Option<Fallback>,
    freshness_window: chrono::Duration,
    fallback_timeout: Duration,
}

impl QueryService {
    pub fn new(archive: Arc<Archive>, freshness_window: chrono::Duration, fallback_timeout: Duration) -> Self {
        Self {
            archive,
            fallback: None,
            freshness_window,
            fallback_timeout,
        }
    }

    pub fn with_fallback(mut self, pool: ResourcePool, executor: FetchExecutor) -> Self {
        self.fallback = Some(Fallback { pool, executor });
        self
    }

    pub fn backend(&self) -> &'static str {
        self.archive.backend()
    }

    /// Stored records matching `query`, newest first. Missing bounds default to
    /// the last 24 hours ending now.
    pub async fn search(
        &self,
        query: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Record>> {
        if query.trim().is_empty() {
            return Err(ApiError::BadRequest("query must not be empty".into()));
        }
        let until = until.unwrap_or_else(Utc::now);
        let since = since.unwrap_or(until - chrono::Duration::hours(DEFAULT_LOOKBACK_HOURS));
        if since > until {
            return Err(ApiError::BadRequest("start date is after end date".into()));
        }

        let req = QueryRequest::new(query.trim(), since, until, limit.clamp(1, MAX_LIMIT));
        let records = self.archive.query(&req).await?;
        info!(query = req.expression.as_str(), count = records.len(), "Search served from storage");
        Ok(records)
    }

    /// Look up posts by URL or id. Stored records fresher than the freshness
    /// window are served directly; the rest get a single fallback lookup whose
    /// results are written through to storage.
    pub async fn validate(&self, inputs: &[String]) -> Result<ValidateOutcome> {
        let mut seen = HashSet::new();
        let mut wanted: Vec<(String, String)> = Vec::new();
        for raw in inputs {
            let Some(id) = identifier_from(raw) else {
                continue;
            };
            if seen.insert(id.clone()) {
                let url = normalize_tweet_url(raw).unwrap_or_else(|| format!("https://x.com/i/status/{id}"));
                wanted.push((id, url));
            }
        }

        let mut outcome = ValidateOutcome {
            requested: inputs.len(),
            ..Default::default()
        };
        if wanted.is_empty() {
            return Ok(outcome);
        }

        let ids: Vec<String> = wanted.iter().map(|(id, _)| id.clone()).collect();
        let fresh_after = Utc::now() - self.freshness_window;
        let mut found: HashMap<String, Record> = self
            .archive
            .find_by_urls(&ids, fresh_after)
            .await?
            .into_iter()
            .map(|stored| (stored.record.id.clone(), stored.record))
            .collect();
        outcome.from_storage = found.len();

        let misses: Vec<&(String, String)> = wanted.iter().filter(|(id, _)| !found.contains_key(id)).collect();
        if !misses.is_empty() {
            let urls: Vec<String> = misses.iter().map(|(_, url)| url.clone()).collect();
            let miss_ids: HashSet<&str> = misses.iter().map(|(id, _)| id.as_str()).collect();
            match self.lookup(urls).await {
                LookupOutcome::Fetched(records) => {
                    let repaired: Vec<Record> = records
                        .into_iter()
                        .filter(|r| miss_ids.contains(r.id.as_str()))
                        .collect();
                    outcome.fetched = repaired.len();
                    if !repaired.is_empty() {
                        if let Err(e) = self.archive.insert_batch(&repaired).await {
                            warn!(error = %e, count = repaired.len(), "Write-through of validated records failed");
                        }
                        // Stale rows already stored count as duplicates above and
                        // keep their old stored_at unless refreshed here.
                        let repaired_ids: Vec<String> = repaired.iter().map(|r| r.id.clone()).collect();
                        if let Err(e) = self.archive.touch(&repaired_ids).await {
                            warn!(error = %e, count = repaired_ids.len(), "Refreshing validated records failed");
                        }
                    }
                    found.extend(repaired.into_iter().map(|r| (r.id.clone(), r)));
                }
                LookupOutcome::TimedOut => outcome.fallback_timed_out = true,
                LookupOutcome::Skipped => {}
            }
        }

        for (id, _) in &wanted {
            match found.remove(id) {
                Some(record) => outcome.records.push(record),
                None => outcome.missing.push(id.clone()),
            }
        }

        info!(
            requested = outcome.requested,
            from_storage = outcome.from_storage,
            fetched = outcome.fetched,
            missing = outcome.missing.len(),
            timed_out = outcome.fallback_timed_out,
            "Validation complete"
        );
        Ok(outcome)
    }

    pub async fn stats(&self) -> Result<AggregateStats> {
        Ok(self.archive.stats(TOP_LABELS).await?)
    }

    /// Serve an Apify tweet-scraper run: `startUrls` go through validation,
    /// each search term is answered from storage. Results are deduplicated and
    /// capped at the input's item limit.
    pub async fn run_scraper(&self, input: &TweetScraperInput) -> Result<Vec<Record>> {
        let limit = input.limit().unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        if input.search_terms.is_empty() && input.start_urls.is_empty() {
            return Err(ApiError::BadRequest("searchTerms or startUrls is required".into()));
        }

        let mut records = Vec::new();
        if !input.start_urls.is_empty() {
            records.extend(self.validate(&input.start_url_strings()).await?.records);
        }
        for raw in &input.search_terms {
            let term = SearchTerm::parse(raw);
            if term.query.is_empty() {
                warn!(term = raw.as_str(), "Search term has no expression, skipping");
                continue;
            }
            records.extend(self.search(&term.query, term.since, term.until, limit).await?);
        }

        let mut seen = HashSet::new();
        records.retain(|r| seen.insert(r.id.clone()));
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn lookup(&self, urls: Vec<String>) -> LookupOutcome {
        let Some(fallback) = &self.fallback else {
            return LookupOutcome::Skipped;
        };
        let spec = FetchSpec::Lookup { urls };

        let attempt = tokio::time::timeout(self.fallback_timeout, async {
            let lease = fallback.pool.acquire_timeout(self.fallback_timeout).await?;
            Ok::<_, PoolError>(fallback.executor.execute(lease, &spec).await)
        })
        .await;

        match attempt {
            Ok(Ok(FetchResult::Success(records))) => LookupOutcome::Fetched(records),
            Ok(Ok(FetchResult::RetryableFailure(reason) | FetchResult::FatalFailure(reason))) => {
                warn!(reason = reason.as_str(), "Validation fallback fetch failed");
                LookupOutcome::Skipped
            }
            Ok(Err(e)) => {
                warn!(error = %e, "No fetch capacity for validation fallback");
                LookupOutcome::TimedOut
            }
            Err(_) => {
                warn!(timeout = ?self.fallback_timeout, "Validation fallback timed out");
                LookupOutcome::TimedOut
            }
        }
    }
}

enum LookupOutcome {
    Fetched(Vec<Record>),
    TimedOut,
    Skipped,
}
