// Postgres primary store.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::info;

use harvest_common::{AggregateStats, LabelCount, QueryRequest, Record};

use crate::codec;
use crate::error::Result;
use crate::query::{like_pattern, QueryExpr, Term};
use crate::store::{RecordStore, StoredRecord};

pub struct PgRecordStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct ContentRow {
    content: Vec<u8>,
    stored_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct CountsRow {
    total: i64,
    last_hour: i64,
    last_24h: i64,
    newest: Option<DateTime<Utc>>,
    oldest: Option<DateTime<Utc>>,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/postgres").run(&self.pool).await?;
        info!("Record store migrations applied");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn insert_new(&self, records: &[Record]) -> Result<Vec<String>> {
        // Id order keeps concurrent batches from taking row locks in opposite orders.
        let mut ordered: Vec<&Record> = records.iter().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));

        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::new();

        for record in ordered {
            let content = codec::encode(record)?;
            let result = sqlx::query(
                r#"
                INSERT INTO records
                    (external_id, url, author, created_at, time_bucket, source,
                     search_text, content, content_size)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (external_id) DO NOTHING
                "#,
            )
            .bind(&record.id)
            .bind(&record.url)
            .bind(&record.author)
            .bind(record.created_at)
            .bind(record.time_bucket())
            .bind(record.source.code())
            .bind(record.text.to_lowercase())
            .bind(&content)
            .bind(content.len() as i32)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                continue;
            }

            if !record.labels.is_empty() {
                sqlx::query(
                    r#"
                    INSERT INTO record_labels (external_id, label, created_at)
                    SELECT $1, label, $3 FROM UNNEST($2::text[]) AS t(label)
                    ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(&record.id)
                .bind(&record.labels)
                .bind(record.created_at)
                .execute(&mut *tx)
                .await?;
            }

            inserted.push(record.id.clone());
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn query(&self, expr: &QueryExpr, req: &QueryRequest) -> Result<Vec<Record>> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT r.content, r.stored_at FROM records r WHERE r.created_at >= ");
        qb.push_bind(req.since);
        qb.push(" AND r.created_at <= ");
        qb.push_bind(req.until);

        if !expr.is_empty() {
            qb.push(" AND (");
            for (i, all) in expr.alternatives.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                qb.push("(");
                for (j, term) in all.iter().enumerate() {
                    if j > 0 {
                        qb.push(" AND ");
                    }
                    match term {
                        Term::Label(label) => {
                            qb.push(
                                "EXISTS (SELECT 1 FROM record_labels l \
                                 WHERE l.external_id = r.external_id AND l.label = ",
                            );
                            qb.push_bind(label.clone());
                            qb.push(")");
                        }
                        Term::Keyword(keyword) => {
                            qb.push("r.search_text LIKE ");
                            qb.push_bind(like_pattern(keyword));
                            qb.push(" ESCAPE '\\'");
                        }
                    }
                }
                qb.push(")");
            }
            qb.push(")");
        }

        qb.push(" ORDER BY r.created_at DESC, r.external_id DESC LIMIT ");
        qb.push_bind(i64::from(req.limit));

        let rows: Vec<ContentRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.iter().map(|row| codec::decode(&row.content)).collect()
    }

    async fn find_by_ids(&self, ids: &[String]) -> Result<Vec<StoredRecord>> {
        let rows = sqlx::query_as::<_, ContentRow>(
            r#"
            SELECT content, stored_at FROM records
            WHERE external_id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(StoredRecord {
                    record: codec::decode(&row.content)?,
                    stored_at: row.stored_at,
                })
            })
            .collect()
    }

    async fn touch(&self, ids: &[String], at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("UPDATE records SET stored_at = $2 WHERE external_id = ANY($1)")
            .bind(ids)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self, now: DateTime<Utc>, top_n: usize) -> Result<AggregateStats> {
        let counts = sqlx::query_as::<_, CountsRow>(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE created_at >= $1) AS last_hour,
                COUNT(*) FILTER (WHERE created_at >= $2) AS last_24h,
                MAX(created_at) AS newest,
                MIN(created_at) AS oldest
            FROM records
            "#,
        )
        .bind(now - Duration::hours(1))
        .bind(now - Duration::hours(24))
        .fetch_one(&self.pool)
        .await?;

        let unique_labels: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT label) FROM record_labels")
            .fetch_one(&self.pool)
            .await?;

        let top_labels = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT label, COUNT(*) AS count FROM record_labels
            GROUP BY label
            ORDER BY count DESC, label ASC
            LIMIT $1
            "#,
        )
        .bind(top_n as i64)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|(label, count)| LabelCount { label, count })
        .collect();

        Ok(AggregateStats {
            total: counts.total,
            last_hour: counts.last_hour,
            last_24h: counts.last_24h,
            top_labels,
            unique_labels,
            newest: counts.newest,
            oldest: counts.oldest,
        })
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM records WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
