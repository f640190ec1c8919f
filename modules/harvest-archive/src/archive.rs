use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use harvest_common::{
    identifier_from, normalize_label, AggregateStats, Config, InsertStats, QueryRequest, Record,
};

use crate::error::Result;
use crate::memory::MemoryRecordStore;
use crate::mirror::{MirrorTarget, SqliteMinerMirror};
use crate::postgres::PgRecordStore;
use crate::query::QueryExpr;
use crate::store::{RecordStore, StoredRecord};

/// Where the archive keeps its data.
#[derive(Debug, Clone, Default)]
pub struct ArchiveConfig {
    /// Postgres URL for the primary store. `None` keeps records in memory.
    pub database_url: Option<String>,
    /// Path of the miner's SQLite database to mirror into.
    pub miner_sqlite_path: Option<String>,
}

impl From<&Config> for ArchiveConfig {
    fn from(config: &Config) -> Self {
        Self {
            database_url: config.database_url.clone(),
            miner_sqlite_path: config.miner_sqlite_path.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub primary_deleted: u64,
    pub mirror_deleted: u64,
    pub mirror_failed: bool,
}

/// Durable record storage: a primary [`RecordStore`] plus an optional
/// best-effort [`MirrorTarget`].
pub struct Archive {
    primary: Arc<dyn RecordStore>,
    mirror: Option<Arc<dyn MirrorTarget>>,
    mirror_failures: AtomicU64,
}

impl Archive {
    pub fn new(primary: Arc<dyn RecordStore>) -> Self {
        Self {
            primary,
            mirror: None,
            mirror_failures: AtomicU64::new(0),
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn MirrorTarget>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRecordStore::new()))
    }

    /// Open the configured stores, running primary migrations first.
    pub async fn connect(config: &ArchiveConfig) -> Result<Self> {
        let archive = match &config.database_url {
            Some(url) => {
                let store = PgRecordStore::connect(url).await?;
                store.migrate().await?;
                Self::new(Arc::new(store))
            }
            None => {
                warn!("DATABASE_URL not set, records are kept in memory only");
                Self::in_memory()
            }
        };

        let archive = match &config.miner_sqlite_path {
            Some(path) => archive.with_mirror(Arc::new(SqliteMinerMirror::open(path).await?)),
            None => archive,
        };

        info!(
            primary = archive.primary.backend(),
            mirror = archive.mirror.as_ref().map(|m| m.name()).unwrap_or("none"),
            "Archive ready"
        );
        Ok(archive)
    }

    /// Store records not seen before. Repeats (within the batch or against
    /// storage) are counted as duplicates. Labels are stored normalized. A
    /// mirror failure is logged and counted but never fails the call.
    pub async fn insert_batch(&self, records: &[Record]) -> Result<InsertStats> {
        let mut seen = HashSet::with_capacity(records.len());
        let unique: Vec<Record> = records
            .iter()
            .filter(|r| seen.insert(r.id.as_str()))
            .map(with_normalized_labels)
            .collect();

        let inserted_ids = if unique.is_empty() {
            Vec::new()
        } else {
            self.primary.insert_new(&unique).await?
        };

        let mut stats = InsertStats {
            received: records.len() as u64,
            inserted: inserted_ids.len() as u64,
            duplicates: (records.len() - inserted_ids.len()) as u64,
            ..Default::default()
        };

        // The whole unique batch is mirrored so rows a failed earlier write
        // missed are filled in; the mirror ignores rows it already has.
        if let Some(mirror) = &self.mirror {
            if !unique.is_empty() {
                match mirror.mirror(&unique).await {
                    Ok(written) => stats.mirrored = written,
                    Err(e) => {
                        self.mirror_failures.fetch_add(1, Ordering::Relaxed);
                        stats.mirror_failures = 1;
                        warn!(mirror = mirror.name(), error = %e, "Mirror write failed");
                    }
                }
            }
        }

        debug!(
            received = stats.received,
            inserted = stats.inserted,
            duplicates = stats.duplicates,
            "Batch stored"
        );
        Ok(stats)
    }

    pub async fn query(&self, req: &QueryRequest) -> Result<Vec<Record>> {
        let expr = QueryExpr::parse(&req.expression);
        self.primary.query(&expr, req).await
    }

    /// Stored records for the given post URLs (or bare ids) that were stored
    /// at or after `fresh_after`. Unrecognized inputs are skipped.
    pub async fn find_by_urls(&self, urls: &[String], fresh_after: DateTime<Utc>) -> Result<Vec<StoredRecord>> {
        let ids: Vec<String> = urls.iter().filter_map(|u| identifier_from(u)).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let found = self.primary.find_by_ids(&ids).await?;
        Ok(found.into_iter().filter(|s| s.stored_at >= fresh_after).collect())
    }

    pub async fn stats(&self, top_n: usize) -> Result<AggregateStats> {
        self.primary.stats(Utc::now(), top_n).await
    }

    /// Delete records older than `now - horizon` from both targets. Only the
    /// primary's failure is an error.
    pub async fn sweep(&self, horizon: Duration) -> Result<SweepStats> {
        let cutoff = Utc::now() - horizon;
        let mut stats = SweepStats {
            primary_deleted: self.primary.delete_older_than(cutoff).await?,
            ..Default::default()
        };

        if let Some(mirror) = &self.mirror {
            match mirror.delete_older_than(cutoff).await {
                Ok(n) => stats.mirror_deleted = n,
                Err(e) => {
                    stats.mirror_failed = true;
                    warn!(mirror = mirror.name(), error = %e, "Mirror sweep failed");
                }
            }
        }

        info!(
            %cutoff,
            primary_deleted = stats.primary_deleted,
            mirror_deleted = stats.mirror_deleted,
            "Retention sweep complete"
        );
        Ok(stats)
    }

    /// Mark stored records as freshly confirmed without changing them, so
    /// freshness checks treat them as just stored. Returns how many exist.
    pub async fn touch(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.primary.touch(ids, Utc::now()).await
    }

    /// Mirror writes that have failed since startup.
    pub fn mirror_failures(&self) -> u64 {
        self.mirror_failures.load(Ordering::Relaxed)
    }

    pub fn backend(&self) -> &'static str {
        self.primary.backend()
    }
}

/// Lowercased, sigil-prefixed labels without repeats or bare sigils.
fn with_normalized_labels(record: &Record) -> Record {
    let mut labels: Vec<String> = Vec::with_capacity(record.labels.len());
    for label in record.labels.iter().map(|l| normalize_label(l)) {
        if label.len() > 1 && !labels.contains(&label) {
            labels.push(label);
        }
    }
    Record {
        labels,
        ..record.clone()
    }
}
