use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Canonical record ---

/// Where a record was collected from. The numeric codes follow the miner's
/// `DataEntity.source` column (Reddit = 1, X = 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Reddit,
    X,
}

impl DataSource {
    pub fn code(self) -> i16 {
        match self {
            DataSource::Reddit => 1,
            DataSource::X => 2,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(DataSource::Reddit),
            2 => Some(DataSource::X),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataSource::Reddit => write!(f, "reddit"),
            DataSource::X => write!(f, "x"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Engagement {
    pub likes: i64,
    pub retweets: i64,
    pub replies: i64,
    pub quotes: i64,
}

/// One collected post. Unique on `id`; never mutated after first insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// External (platform) id, e.g. the tweet's status id.
    pub id: String,
    pub url: String,
    /// Author username without the leading `@`.
    pub author: String,
    #[serde(default)]
    pub author_display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub text: String,
    /// Normalized classification labels (`#hashtag`, `$cashtag`), lowercase.
    #[serde(default)]
    pub labels: Vec<String>,
    pub source: DataSource,
    #[serde(default)]
    pub engagement: Engagement,
    #[serde(default)]
    pub media_urls: Vec<String>,
    #[serde(default)]
    pub is_retweet: bool,
    #[serde(default)]
    pub is_reply: bool,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

impl Record {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// The hour bucket used by the miner's storage format.
    pub fn time_bucket(&self) -> i64 {
        self.created_at.timestamp().div_euclid(3600)
    }
}

// --- Queries ---

/// A search over stored records: an expression, an inclusive time range, and a
/// result ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub expression: String,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub limit: u32,
}

impl QueryRequest {
    pub fn new(expression: impl Into<String>, since: DateTime<Utc>, until: DateTime<Utc>, limit: u32) -> Self {
        Self {
            expression: expression.into(),
            since,
            until,
            limit,
        }
    }

    /// Whether a timestamp falls inside the inclusive range.
    pub fn covers(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.since && ts <= self.until
    }
}

// --- Write and read statistics ---

/// Outcome of one `insert_batch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InsertStats {
    pub received: u64,
    pub inserted: u64,
    /// Repeated ids, whether repeated inside the batch or already stored.
    pub duplicates: u64,
    pub mirrored: u64,
    pub mirror_failures: u64,
}

impl InsertStats {
    pub fn merge(&mut self, other: InsertStats) {
        self.received += other.received;
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.mirrored += other.mirrored;
        self.mirror_failures += other.mirror_failures;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCount {
    pub label: String,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total: i64,
    pub last_hour: i64,
    pub last_24h: i64,
    pub top_labels: Vec<LabelCount>,
    /// Distinct labels across all stored records.
    pub unique_labels: i64,
    pub newest: Option<DateTime<Utc>>,
    pub oldest: Option<DateTime<Utc>>,
}
