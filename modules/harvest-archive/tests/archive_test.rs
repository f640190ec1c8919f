//! Archive write/read behaviour over the in-memory primary and a real SQLite
//! mirror. The Postgres test at the bottom needs TEST_DATABASE_URL and is
//! skipped otherwise.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use harvest_archive::{
    Archive, ArchiveError, MirrorTarget, PgRecordStore, RecordStore, SqliteMinerMirror,
};
use harvest_common::{DataSource, Engagement, QueryRequest, Record};

fn record(id: &str, created_at: DateTime<Utc>, text: &str, labels: &[&str]) -> Record {
    Record {
        id: id.to_string(),
        url: format!("https://x.com/trader/status/{id}"),
        author: "trader".into(),
        author_display_name: Some("Trader".into()),
        created_at,
        text: text.into(),
        labels: labels.iter().map(|s| s.to_string()).collect(),
        source: DataSource::X,
        engagement: Engagement {
            likes: 3,
            ..Default::default()
        },
        media_urls: vec![],
        is_retweet: false,
        is_reply: false,
        conversation_id: None,
    }
}

fn last_day(expression: &str, limit: u32) -> QueryRequest {
    let now = Utc::now();
    QueryRequest::new(expression, now - Duration::hours(24), now, limit)
}

struct FailingMirror;

#[async_trait]
impl MirrorTarget for FailingMirror {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn mirror(&self, _records: &[Record]) -> harvest_archive::Result<u64> {
        Err(ArchiveError::Codec("disk full".into()))
    }

    async fn delete_older_than(&self, _cutoff: DateTime<Utc>) -> harvest_archive::Result<u64> {
        Err(ArchiveError::Codec("disk full".into()))
    }
}

#[tokio::test]
async fn duplicates_inside_and_across_batches_are_counted() {
    let archive = Archive::in_memory();
    let now = Utc::now();
    let a = record("1", now, "gm #bitcoin", &["#bitcoin"]);
    let b = record("2", now, "gm #eth", &["#eth"]);

    let first = archive.insert_batch(&[a.clone(), b.clone(), a.clone()]).await.unwrap();
    assert_eq!(first.received, 3);
    assert_eq!(first.inserted, 2);
    assert_eq!(first.duplicates, 1);

    let second = archive.insert_batch(&[a, b]).await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.duplicates, 2);

    assert_eq!(archive.stats(10).await.unwrap().total, 2);
}

#[tokio::test]
async fn labels_are_normalized_and_deduplicated_on_write() {
    let archive = Archive::in_memory();
    let now = Utc::now();
    let raw = record("9", now, "BITCOIN to the moon", &["#Bitcoin", "BITCOIN", " #bitcoin ", "$BTC", "#"]);
    archive.insert_batch(&[raw]).await.unwrap();

    let hits = archive.query(&last_day("#bitcoin", 10)).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].labels, vec!["#bitcoin", "$btc"]);

    let stats = archive.stats(10).await.unwrap();
    assert_eq!(stats.top_labels[0].label, "#bitcoin");
    assert_eq!(stats.top_labels[0].count, 1);
    assert_eq!(stats.unique_labels, 2);
}

#[tokio::test]
async fn query_returns_stored_records_unchanged() {
    let archive = Archive::in_memory();
    let now = Utc::now();
    let stored = record("42", now - Duration::minutes(5), "Halving soon #Bitcoin", &["#bitcoin"]);
    archive.insert_batch(&[stored.clone()]).await.unwrap();

    let hits = archive.query(&last_day("#bitcoin", 10)).await.unwrap();
    assert_eq!(hits, vec![stored]);
}

#[tokio::test]
async fn query_orders_newest_first_and_respects_range_and_limit() {
    let archive = Archive::in_memory();
    let now = Utc::now();
    archive
        .insert_batch(&[
            record("1", now - Duration::hours(3), "old #btc", &["#btc"]),
            record("2", now - Duration::hours(1), "mid #btc", &["#btc"]),
            record("3", now - Duration::minutes(1), "new #btc", &["#btc"]),
            record("4", now - Duration::days(3), "ancient #btc", &["#btc"]),
        ])
        .await
        .unwrap();

    let hits = archive.query(&last_day("#btc", 2)).await.unwrap();
    let ids: Vec<&str> = hits.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["3", "2"]);

    let all = archive.query(&last_day("", 100)).await.unwrap();
    assert_eq!(all.len(), 3, "record outside the range must not be returned");
}

#[tokio::test]
async fn keyword_and_or_expressions() {
    let archive = Archive::in_memory();
    let now = Utc::now();
    archive
        .insert_batch(&[
            record("1", now, "Staking rewards are up", &["#eth"]),
            record("2", now, "Mining difficulty adjusts", &["#bitcoin"]),
        ])
        .await
        .unwrap();

    let hits = archive.query(&last_day("#eth staking", 10)).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "1");

    let hits = archive.query(&last_day("mining OR #eth", 10)).await.unwrap();
    assert_eq!(hits.len(), 2);
}

#[tokio::test]
async fn mirror_receives_batches_and_ignores_repeats() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = Arc::new(SqliteMinerMirror::open(dir.path().join("miner.sqlite")).await.unwrap());
    let archive = Archive::in_memory().with_mirror(mirror.clone());
    let now = Utc::now();

    let stats = archive
        .insert_batch(&[record("1", now, "#bitcoin", &["#bitcoin"]), record("2", now, "#sol", &["#sol"])])
        .await
        .unwrap();
    assert_eq!(stats.mirrored, 2);
    assert_eq!(stats.mirror_failures, 0);

    let again = archive.insert_batch(&[record("1", now, "#bitcoin", &["#bitcoin"])]).await.unwrap();
    assert_eq!(again.mirrored, 0);
    assert_eq!(mirror.count().await.unwrap(), 2);
}

#[tokio::test]
async fn mirror_failure_does_not_fail_primary_write() {
    let archive = Archive::in_memory().with_mirror(Arc::new(FailingMirror));
    let now = Utc::now();

    let stats = archive.insert_batch(&[record("9", now, "#doge", &["#doge"])]).await.unwrap();
    assert_eq!(stats.inserted, 1);
    assert_eq!(stats.mirror_failures, 1);
    assert_eq!(archive.mirror_failures(), 1);
    assert_eq!(archive.query(&last_day("#doge", 10)).await.unwrap().len(), 1);

    let swept = archive.sweep(Duration::days(30)).await.unwrap();
    assert!(swept.mirror_failed);
}

#[tokio::test]
async fn sweep_removes_expired_records_from_both_targets() {
    let dir = tempfile::tempdir().unwrap();
    let mirror = Arc::new(SqliteMinerMirror::open(dir.path().join("miner.sqlite")).await.unwrap());
    let archive = Archive::in_memory().with_mirror(mirror.clone());
    let now = Utc::now();

    archive
        .insert_batch(&[
            record("1", now - Duration::days(40), "expired", &["#btc"]),
            record("2", now - Duration::days(1), "kept", &["#btc"]),
        ])
        .await
        .unwrap();

    let swept = archive.sweep(Duration::days(30)).await.unwrap();
    assert_eq!(swept.primary_deleted, 1);
    assert_eq!(swept.mirror_deleted, 1);
    assert_eq!(archive.stats(10).await.unwrap().total, 1);
    assert_eq!(mirror.count().await.unwrap(), 1);
}

#[tokio::test]
async fn find_by_urls_applies_freshness() {
    let archive = Archive::in_memory();
    let now = Utc::now();
    archive.insert_batch(&[record("77", now, "fresh", &[])]).await.unwrap();

    let urls = vec![
        "https://twitter.com/trader/status/77?s=20".to_string(),
        "https://x.com/trader/status/78".to_string(),
    ];
    let found = archive.find_by_urls(&urls, now - Duration::hours(1)).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].record.id, "77");

    let stale = archive.find_by_urls(&urls, Utc::now() + Duration::hours(1)).await.unwrap();
    assert!(stale.is_empty());
}

#[tokio::test]
async fn touch_refreshes_freshness_of_existing_records_only() {
    let archive = Archive::in_memory();
    let now = Utc::now();
    archive.insert_batch(&[record("5", now, "old news", &[])]).await.unwrap();
    let url = vec!["https://x.com/trader/status/5".to_string()];

    let later = Utc::now() + Duration::milliseconds(50);
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    assert!(archive.find_by_urls(&url, later).await.unwrap().is_empty());

    let touched = archive.touch(&["5".to_string(), "6".to_string()]).await.unwrap();
    assert_eq!(touched, 1);
    let found = archive.find_by_urls(&url, later).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].record.text, "old news");

    assert_eq!(archive.touch(&[]).await.unwrap(), 0);
}

#[tokio::test]
async fn stats_count_windows_and_top_labels() {
    let archive = Archive::in_memory();
    let now = Utc::now();
    archive
        .insert_batch(&[
            record("1", now - Duration::minutes(10), "a", &["#bitcoin", "$btc"]),
            record("2", now - Duration::hours(5), "b", &["#bitcoin"]),
            record("3", now - Duration::days(2), "c", &["#eth"]),
        ])
        .await
        .unwrap();

    let stats = archive.stats(2).await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.last_hour, 1);
    assert_eq!(stats.last_24h, 2);
    assert_eq!(stats.top_labels.len(), 2);
    assert_eq!(stats.top_labels[0].label, "#bitcoin");
    assert_eq!(stats.top_labels[0].count, 2);
    assert_eq!(stats.unique_labels, 3);
    assert!(stats.oldest < stats.newest);
}

#[tokio::test]
async fn postgres_store_round_trip() {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };
    let store = PgRecordStore::connect(&url).await.unwrap();
    store.migrate().await.unwrap();

    let now = Utc::now();
    let id = format!("pg-{}", now.timestamp_nanos_opt().unwrap_or_default());
    let stored = record(&id, now - Duration::minutes(1), "Postgres #Bitcoin check", &["#bitcoin"]);

    let archive = Archive::new(Arc::new(store));
    let first = archive.insert_batch(&[stored.clone(), stored.clone()]).await.unwrap();
    assert_eq!(first.inserted, 1);
    assert_eq!(first.duplicates, 1);

    let hits = archive.query(&last_day("#bitcoin \"postgres\"", 500)).await.unwrap();
    assert!(hits.contains(&stored));

    let found = archive
        .find_by_urls(&[stored.url.clone()], now - Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);

    // Overlapping batches in opposite id order must both complete.
    let forward: Vec<Record> = (0..20)
        .map(|i| record(&format!("{id}-{i:02}"), now, "lock order #bitcoin", &["#bitcoin"]))
        .collect();
    let backward: Vec<Record> = forward.iter().rev().cloned().collect();
    let (a, b) = tokio::join!(archive.insert_batch(&forward), archive.insert_batch(&backward));
    assert_eq!(a.unwrap().inserted + b.unwrap().inserted, 20);

    let direct = PgRecordStore::connect(&url).await.unwrap();
    assert_eq!(direct.backend(), "postgres");
    let _ = direct.delete_older_than(now - Duration::days(3650)).await.unwrap();
}
