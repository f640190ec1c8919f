use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp layout used by the tweet-scraper's `createdAt` field,
/// e.g. `Mon Jan 01 12:00:00 +0000 2024`.
pub const CREATED_AT_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

pub fn format_created_at(ts: DateTime<Utc>) -> String {
    ts.format(CREATED_AT_FORMAT).to_string()
}

/// Accepts the scraper layout as well as RFC 3339 and naive ISO timestamps
/// (taken as UTC).
pub fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_str(raw, CREATED_AT_FORMAT) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// --- Actor input ---

/// Input for the apidojo/tweet-scraper actor. Either `searchTerms`,
/// `startUrls`, or `twitterHandles` drives the run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TweetScraperInput {
    #[serde(rename = "searchTerms", default, skip_serializing_if = "Vec::is_empty")]
    pub search_terms: Vec<String>,
    #[serde(rename = "startUrls", default, skip_serializing_if = "Vec::is_empty")]
    pub start_urls: Vec<StartUrl>,
    #[serde(rename = "twitterHandles", default, skip_serializing_if = "Vec::is_empty")]
    pub twitter_handles: Vec<String>,
    #[serde(rename = "maxItems", default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<u32>,
    #[serde(rename = "maxTweets", default, skip_serializing_if = "Option::is_none")]
    pub max_tweets: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
}

impl TweetScraperInput {
    pub fn search(term: impl Into<String>, max_items: u32) -> Self {
        Self {
            search_terms: vec![term.into()],
            max_items: Some(max_items),
            sort: Some("Latest".to_string()),
            ..Default::default()
        }
    }

    pub fn urls(urls: &[String], max_items: u32) -> Self {
        Self {
            start_urls: urls.iter().cloned().map(StartUrl::Url).collect(),
            max_items: Some(max_items),
            ..Default::default()
        }
    }

    /// The item ceiling, whichever of `maxItems`/`maxTweets` the caller used.
    pub fn limit(&self) -> Option<u32> {
        self.max_items.or(self.max_tweets)
    }

    pub fn start_url_strings(&self) -> Vec<String> {
        self.start_urls.iter().map(|u| u.as_str().to_string()).collect()
    }
}

/// A start URL entry. Callers send either bare strings or `{ "url": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StartUrl {
    Url(String),
    Object { url: String },
}

impl StartUrl {
    pub fn as_str(&self) -> &str {
        match self {
            StartUrl::Url(url) | StartUrl::Object { url } => url,
        }
    }
}

// --- Dataset items ---

/// Author info nested inside a Tweet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TweetAuthor {
    #[serde(rename = "userName")]
    pub user_name: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "isVerified", default)]
    pub is_verified: Option<bool>,
    #[serde(default)]
    pub followers: Option<i64>,
    #[serde(default)]
    pub following: Option<i64>,
}

/// A hashtag or cashtag span in the tweet text (character offsets).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TweetEntity {
    pub text: String,
    pub indices: [usize; 2],
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TweetEntities {
    #[serde(default)]
    pub hashtags: Vec<TweetEntity>,
    #[serde(default)]
    pub symbols: Vec<TweetEntity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TweetMedia {
    pub media_url_https: String,
    #[serde(rename = "type")]
    pub media_type: String,
}

/// A single tweet item from the tweet-scraper dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tweet {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub id: Option<String>,
    pub url: Option<String>,
    #[serde(rename = "twitterUrl", default)]
    pub twitter_url: Option<String>,
    pub text: Option<String>,
    #[serde(rename = "fullText", alias = "full_text", default)]
    pub full_text: Option<String>,
    #[serde(rename = "createdAt", alias = "created_at", default)]
    pub created_at: Option<String>,
    pub author: Option<TweetAuthor>,
    #[serde(rename = "likeCount", default)]
    pub like_count: Option<i64>,
    #[serde(rename = "retweetCount", default)]
    pub retweet_count: Option<i64>,
    #[serde(rename = "replyCount", default)]
    pub reply_count: Option<i64>,
    #[serde(rename = "quoteCount", default)]
    pub quote_count: Option<i64>,
    #[serde(default)]
    pub entities: Option<TweetEntities>,
    #[serde(default)]
    pub media: Vec<TweetMedia>,
    #[serde(rename = "isRetweet", default)]
    pub is_retweet: Option<bool>,
    #[serde(rename = "isReply", default)]
    pub is_reply: Option<bool>,
    #[serde(rename = "isQuote", default)]
    pub is_quote: Option<bool>,
    #[serde(rename = "conversationId", default)]
    pub conversation_id: Option<String>,
    #[serde(rename = "inReplyToUserId", default)]
    pub in_reply_to_user_id: Option<String>,
}

impl Tweet {
    /// Returns whichever text field is populated, preferring `fullText`.
    pub fn content(&self) -> Option<&str> {
        self.full_text.as_deref().or(self.text.as_deref())
    }

    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        self.created_at.as_deref().and_then(parse_created_at)
    }

    /// Hashtags (`#x`) and cashtags (`$x`) declared in `entities`.
    pub fn entity_tags(&self) -> Vec<String> {
        let Some(entities) = &self.entities else {
            return Vec::new();
        };
        entities
            .hashtags
            .iter()
            .map(|h| format!("#{}", h.text))
            .chain(entities.symbols.iter().map(|s| format!("${}", s.text)))
            .collect()
    }
}
