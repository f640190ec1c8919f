// Secondary write target: the miner's SQLite `DataEntity` table.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use harvest_common::Record;

use crate::codec;
use crate::error::Result;

/// Miner labels are capped at this many characters.
const MAX_LABEL_LEN: usize = 32;

/// A disposable copy of stored records in another format. Writes are
/// idempotent so a later batch can fill gaps left by a failed one.
#[async_trait]
pub trait MirrorTarget: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write records, ignoring ones already present. Returns rows written.
    async fn mirror(&self, records: &[Record]) -> Result<u64>;

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Post body as the miner stores it inside `DataEntity.content`.
#[derive(Debug, Serialize)]
struct MinerContent<'a> {
    username: String,
    text: &'a str,
    url: &'a str,
    timestamp: String,
    tweet_hashtags: &'a [String],
}

/// One `DataEntity` row.
#[derive(Debug, Clone, PartialEq)]
pub struct MinerEntity {
    pub uri: String,
    pub datetime: String,
    pub time_bucket_id: i64,
    pub source: i16,
    pub label: Option<String>,
    pub content: Vec<u8>,
    pub content_size_bytes: i64,
}

pub fn to_miner_entity(record: &Record) -> Result<MinerEntity> {
    let timestamp = record.created_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    let hashtags: Vec<String> = record
        .labels
        .iter()
        .filter(|l| l.starts_with('#'))
        .cloned()
        .collect();

    let content = codec::encode(&MinerContent {
        username: format!("@{}", record.author),
        text: &record.text,
        url: &record.url,
        timestamp: timestamp.clone(),
        tweet_hashtags: &hashtags,
    })?;

    let label = hashtags
        .first()
        .map(|l| l.chars().take(MAX_LABEL_LEN).collect::<String>());

    Ok(MinerEntity {
        uri: record.url.clone(),
        datetime: timestamp,
        time_bucket_id: record.time_bucket(),
        source: record.source.code(),
        label,
        content_size_bytes: content.len() as i64,
        content,
    })
}

pub struct SqliteMinerMirror {
    pool: SqlitePool,
}

impl SqliteMinerMirror {
    /// Open (creating if needed) the miner database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let mirror = Self { pool };
        mirror.ensure_schema().await?;
        info!(path = %path.as_ref().display(), "Miner mirror opened");
        Ok(mirror)
    }

    /// The miner owns this schema; create it only when absent.
    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS DataEntity (
                uri TEXT PRIMARY KEY,
                datetime TIMESTAMP(6) NOT NULL,
                timeBucketId INTEGER NOT NULL,
                source INTEGER NOT NULL,
                label CHAR(32),
                content BLOB NOT NULL,
                contentSizeBytes INTEGER NOT NULL
            ) WITHOUT ROWID
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS data_entity_bucket_index \
             ON DataEntity (timeBucketId, source, label, contentSizeBytes)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM DataEntity")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

#[async_trait]
impl MirrorTarget for SqliteMinerMirror {
    fn name(&self) -> &'static str {
        "miner-sqlite"
    }

    async fn mirror(&self, records: &[Record]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for record in records {
            let entity = to_miner_entity(record)?;
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO DataEntity
                    (uri, datetime, timeBucketId, source, label, content, contentSizeBytes)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entity.uri)
            .bind(&entity.datetime)
            .bind(entity.time_bucket_id)
            .bind(entity.source)
            .bind(&entity.label)
            .bind(&entity.content)
            .bind(entity.content_size_bytes)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM DataEntity WHERE datetime < ?")
            .bind(cutoff.to_rfc3339_opts(SecondsFormat::Secs, true))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
