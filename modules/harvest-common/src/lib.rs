pub mod config;
pub mod error;
pub mod text;
pub mod types;

pub use config::{AccountCredential, Config, DEFAULT_TARGET_HASHTAGS};
pub use error::ConfigError;
pub use text::{
    extract_labels, identifier_from, is_valid_tweet_url, normalize_label, normalize_tweet_url,
    sanitize_text, tweet_id_from_url,
};
pub use types::{
    AggregateStats, DataSource, Engagement, InsertStats, LabelCount, QueryRequest, Record,
};
