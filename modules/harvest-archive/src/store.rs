// Storage seam for the primary target.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use harvest_common::{AggregateStats, QueryRequest, Record};

use crate::error::Result;
use crate::query::QueryExpr;

/// A record together with when this store first accepted it.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub record: Record,
    pub stored_at: DateTime<Utc>,
}

/// Primary record storage. Implementations enforce external-id uniqueness
/// themselves so concurrent writers cannot double-insert.
#[async_trait]
pub trait RecordStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Insert records whose id is not yet stored. Returns the ids that were
    /// actually inserted. Each record (with its labels) becomes visible
    /// atomically.
    async fn insert_new(&self, records: &[Record]) -> Result<Vec<String>>;

    /// Records matching `expr` inside the request's range, newest first,
    /// at most `req.limit`.
    async fn query(&self, expr: &QueryExpr, req: &QueryRequest) -> Result<Vec<Record>>;

    async fn find_by_ids(&self, ids: &[String]) -> Result<Vec<StoredRecord>>;

    /// Set `stored_at` of the given ids to `at`. The records are unchanged.
    async fn touch(&self, ids: &[String], at: DateTime<Utc>) -> Result<u64>;

    async fn stats(&self, now: DateTime<Utc>, top_n: usize) -> Result<AggregateStats>;

    /// Delete records whose timestamp is older than `cutoff`. Returns the count.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
