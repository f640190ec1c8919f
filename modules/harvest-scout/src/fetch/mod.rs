pub mod filter;
pub mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use harvest_common::Record;

use crate::pool::{EgressIdentity, Lease, ReleaseOutcome, SourceAccount};

pub use filter::RecordFilter;
pub use http::HttpFetcher;

/// One unit of upstream work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchSpec {
    Search {
        query: String,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: u32,
    },
    Lookup {
        urls: Vec<String>,
    },
}

impl FetchSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchSpec::Search { .. } => "search",
            FetchSpec::Lookup { .. } => "lookup",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited by upstream")]
    RateLimited,

    #[error("Blocked by upstream: {0}")]
    Blocked(String),

    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed upstream response: {0}")]
    Malformed(String),

    #[error("Account credential revoked: {0}")]
    CredentialRevoked(String),

    #[error("Egress identity banned: {0}")]
    IdentityBanned(String),
}

impl FetchError {
    /// Fatal errors take the identity/account pair out of service.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::CredentialRevoked(_) | FetchError::IdentityBanned(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    Success(Vec<Record>),
    RetryableFailure(String),
    FatalFailure(String),
}

impl FetchResult {
    fn outcome(&self) -> ReleaseOutcome {
        match self {
            FetchResult::Success(_) => ReleaseOutcome::Success,
            FetchResult::RetryableFailure(reason) => ReleaseOutcome::Retryable(reason.clone()),
            FetchResult::FatalFailure(reason) => ReleaseOutcome::Fatal(reason.clone()),
        }
    }
}

/// The upstream capability: fetch records as `account` through `identity`.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(
        &self,
        account: &SourceAccount,
        identity: &EgressIdentity,
        spec: &FetchSpec,
    ) -> Result<Vec<Record>, FetchError>;
}

/// Runs one fetch under a lease with a fixed timeout and reports the outcome
/// back to the pool.
#[derive(Clone)]
pub struct FetchExecutor {
    fetcher: Arc<dyn SourceFetcher>,
    timeout: Duration,
}

impl FetchExecutor {
    pub fn new(fetcher: Arc<dyn SourceFetcher>, timeout: Duration) -> Self {
        Self { fetcher, timeout }
    }

    pub async fn execute(&self, lease: Lease, spec: &FetchSpec) -> FetchResult {
        let attempt = tokio::time::timeout(
            self.timeout,
            self.fetcher.fetch(lease.account(), lease.identity(), spec),
        )
        .await;

        let result = match attempt {
            Ok(Ok(mut records)) => {
                let before = records.len();
                records.retain(RecordFilter::is_complete);
                if records.len() < before {
                    debug!(dropped = before - records.len(), "Discarded incomplete records");
                }
                FetchResult::Success(records)
            }
            Ok(Err(e)) if e.is_fatal() => {
                warn!(
                    identity = lease.identity().id.as_str(),
                    account = lease.account().id.as_str(),
                    error = %e,
                    "Fatal fetch failure"
                );
                FetchResult::FatalFailure(e.to_string())
            }
            Ok(Err(e)) => {
                debug!(kind = spec.kind(), error = %e, "Retryable fetch failure");
                FetchResult::RetryableFailure(e.to_string())
            }
            Err(_) => {
                let e = FetchError::Timeout(self.timeout);
                debug!(kind = spec.kind(), error = %e, "Fetch timed out");
                FetchResult::RetryableFailure(e.to_string())
            }
        };

        lease.release(result.outcome());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Health, PoolConfig, ResourcePool};
    use crate::testing::{sample_records, MockFetcher};

    fn one_pair() -> ResourcePool {
        ResourcePool::new(
            vec![EgressIdentity {
                id: "ip-0".into(),
                proxy_url: None,
            }],
            vec![SourceAccount {
                id: "acct-0".into(),
                token: "t".into(),
            }],
            PoolConfig {
                account_cooldown: Duration::ZERO,
                base_backoff: Duration::ZERO,
                ..Default::default()
            },
        )
    }

    fn search() -> FetchSpec {
        let now = Utc::now();
        FetchSpec::Search {
            query: "#bitcoin".into(),
            since: now - chrono::Duration::hours(1),
            until: now,
            limit: 10,
        }
    }

    #[tokio::test]
    async fn success_releases_lease_healthy() {
        let pool = one_pair();
        let executor = FetchExecutor::new(
            Arc::new(MockFetcher::new().returning(sample_records("s", 3))),
            Duration::from_secs(5),
        );
        let result = executor.execute(pool.acquire().unwrap(), &search()).await;
        assert!(matches!(result, FetchResult::Success(ref r) if r.len() == 3));
        assert!(pool.acquire().is_ok());
    }

    #[tokio::test]
    async fn revoked_credential_is_fatal_and_bans_pair() {
        let pool = one_pair();
        let executor = FetchExecutor::new(
            Arc::new(MockFetcher::new().failing(FetchError::CredentialRevoked("401".into()))),
            Duration::from_secs(5),
        );
        let result = executor.execute(pool.acquire().unwrap(), &search()).await;
        assert!(matches!(result, FetchResult::FatalFailure(_)));
        assert_eq!(pool.health_of("acct-0"), Some(Health::Banned));
        assert_eq!(pool.health_of("ip-0"), Some(Health::Banned));
    }

    #[tokio::test]
    async fn rate_limit_is_retryable() {
        let pool = one_pair();
        let executor = FetchExecutor::new(
            Arc::new(MockFetcher::new().failing(FetchError::RateLimited)),
            Duration::from_secs(5),
        );
        let result = executor.execute(pool.acquire().unwrap(), &search()).await;
        assert!(matches!(result, FetchResult::RetryableFailure(_)));
        assert_eq!(pool.health_of("acct-0"), Some(Health::Healthy));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_times_out_as_retryable() {
        let pool = one_pair();
        let executor = FetchExecutor::new(
            Arc::new(MockFetcher::new().with_delay(Duration::from_secs(60))),
            Duration::from_secs(1),
        );
        let result = executor.execute(pool.acquire().unwrap(), &search()).await;
        match result {
            FetchResult::RetryableFailure(reason) => assert!(reason.contains("timed out")),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(pool.acquire().is_ok());
    }

    #[tokio::test]
    async fn incomplete_records_are_discarded() {
        let pool = one_pair();
        let mut records = sample_records("s", 2);
        records[0].text.clear();
        let executor = FetchExecutor::new(
            Arc::new(MockFetcher::new().returning(records)),
            Duration::from_secs(5),
        );
        let result = executor.execute(pool.acquire().unwrap(), &search()).await;
        assert!(matches!(result, FetchResult::Success(ref r) if r.len() == 1));
    }
}
