// In-process record store. Used when no DATABASE_URL is configured and in tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use harvest_common::{AggregateStats, LabelCount, QueryRequest, Record};

use crate::error::{ArchiveError, Result};
use crate::query::QueryExpr;
use crate::store::{RecordStore, StoredRecord};

#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, StoredRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn insert_new(&self, records: &[Record]) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut map = self.records.write().map_err(|_| ArchiveError::LockPoisoned)?;
        let mut inserted = Vec::new();
        for record in records {
            if map.contains_key(&record.id) {
                continue;
            }
            map.insert(
                record.id.clone(),
                StoredRecord {
                    record: record.clone(),
                    stored_at: now,
                },
            );
            inserted.push(record.id.clone());
        }
        Ok(inserted)
    }

    async fn query(&self, expr: &QueryExpr, req: &QueryRequest) -> Result<Vec<Record>> {
        let map = self.records.read().map_err(|_| ArchiveError::LockPoisoned)?;
        let mut hits: Vec<Record> = map
            .values()
            .map(|s| &s.record)
            .filter(|r| req.covers(r.created_at) && expr.matches(r))
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        hits.truncate(req.limit as usize);
        Ok(hits)
    }

    async fn find_by_ids(&self, ids: &[String]) -> Result<Vec<StoredRecord>> {
        let map = self.records.read().map_err(|_| ArchiveError::LockPoisoned)?;
        Ok(ids.iter().filter_map(|id| map.get(id).cloned()).collect())
    }

    async fn touch(&self, ids: &[String], at: DateTime<Utc>) -> Result<u64> {
        let mut map = self.records.write().map_err(|_| ArchiveError::LockPoisoned)?;
        let mut touched = 0;
        for id in ids {
            if let Some(stored) = map.get_mut(id) {
                stored.stored_at = at;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn stats(&self, now: DateTime<Utc>, top_n: usize) -> Result<AggregateStats> {
        let map = self.records.read().map_err(|_| ArchiveError::LockPoisoned)?;
        let hour_ago = now - Duration::hours(1);
        let day_ago = now - Duration::hours(24);

        let mut stats = AggregateStats::default();
        let mut label_counts: HashMap<&str, i64> = HashMap::new();
        for stored in map.values() {
            let r = &stored.record;
            stats.total += 1;
            if r.created_at >= hour_ago {
                stats.last_hour += 1;
            }
            if r.created_at >= day_ago {
                stats.last_24h += 1;
            }
            stats.newest = stats.newest.max(Some(r.created_at));
            stats.oldest = Some(stats.oldest.map_or(r.created_at, |o| o.min(r.created_at)));
            for label in &r.labels {
                *label_counts.entry(label.as_str()).or_default() += 1;
            }
        }

        stats.unique_labels = label_counts.len() as i64;
        let mut top: Vec<LabelCount> = label_counts
            .into_iter()
            .map(|(label, count)| LabelCount {
                label: label.to_string(),
                count,
            })
            .collect();
        top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
        top.truncate(top_n);
        stats.top_labels = top;

        Ok(stats)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut map = self.records.write().map_err(|_| ArchiveError::LockPoisoned)?;
        let before = map.len();
        map.retain(|_, s| s.record.created_at >= cutoff);
        Ok((before - map.len()) as u64)
    }
}
