// Record translations for the two client contracts: the Apify tweet-scraper
// item and the native "custom API" tweet dictionary.

use apify_client::{format_created_at, Tweet, TweetAuthor, TweetEntities, TweetEntity, TweetMedia};
use chrono::SecondsFormat;
use serde::Serialize;

use harvest_common::Record;

/// Native tweet shape returned by `/api/search` and `/api/validate`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomTweet {
    pub id: String,
    pub url: String,
    pub text: String,
    pub author_username: String,
    pub author_display_name: Option<String>,
    pub created_at: String,
    pub like_count: i64,
    pub retweet_count: i64,
    pub reply_count: i64,
    pub quote_count: i64,
    pub hashtags: Vec<String>,
    pub cashtags: Vec<String>,
    pub media_urls: Vec<String>,
    pub is_retweet: bool,
    pub is_reply: bool,
    pub conversation_id: Option<String>,
    pub source: String,
}

pub fn to_custom_tweet(record: &Record) -> CustomTweet {
    CustomTweet {
        id: record.id.clone(),
        url: record.url.clone(),
        text: record.text.clone(),
        author_username: record.author.clone(),
        author_display_name: record.author_display_name.clone(),
        created_at: record.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        like_count: record.engagement.likes,
        retweet_count: record.engagement.retweets,
        reply_count: record.engagement.replies,
        quote_count: record.engagement.quotes,
        hashtags: labels_with(record, '#'),
        cashtags: labels_with(record, '$'),
        media_urls: record.media_urls.clone(),
        is_retweet: record.is_retweet,
        is_reply: record.is_reply,
        conversation_id: record.conversation_id.clone(),
        source: record.source.to_string(),
    }
}

/// Apify tweet-scraper item. Author profile fields the archive does not keep
/// (id, verification, follower counts) are omitted.
pub fn to_apify_tweet(record: &Record) -> Tweet {
    let hashtags = entities_for(record, '#');
    let symbols = entities_for(record, '$');

    Tweet {
        kind: Some("tweet".into()),
        id: Some(record.id.clone()),
        url: Some(record.url.clone()),
        twitter_url: Some(record.url.replacen("https://x.com/", "https://twitter.com/", 1)),
        text: Some(record.text.clone()),
        full_text: Some(record.text.clone()),
        created_at: Some(format_created_at(record.created_at)),
        author: Some(TweetAuthor {
            user_name: Some(record.author.clone()),
            name: Some(
                record
                    .author_display_name
                    .clone()
                    .unwrap_or_else(|| record.author.clone()),
            ),
            is_verified: Some(false),
            ..Default::default()
        }),
        like_count: Some(record.engagement.likes),
        retweet_count: Some(record.engagement.retweets),
        reply_count: Some(record.engagement.replies),
        quote_count: Some(record.engagement.quotes),
        entities: Some(TweetEntities { hashtags, symbols }),
        media: record
            .media_urls
            .iter()
            .map(|url| TweetMedia {
                media_url_https: url.clone(),
                media_type: "photo".into(),
            })
            .collect(),
        is_retweet: Some(record.is_retweet),
        is_reply: Some(record.is_reply),
        is_quote: Some(false),
        conversation_id: Some(record.conversation_id.clone().unwrap_or_else(|| record.id.clone())),
        in_reply_to_user_id: None,
    }
}

fn labels_with(record: &Record, sigil: char) -> Vec<String> {
    record
        .labels
        .iter()
        .filter(|l| l.starts_with(sigil))
        .cloned()
        .collect()
}

/// Entities with character offsets of each tag's first case-insensitive
/// occurrence in the text; `[0, 0]` when the tag is not in the text.
fn entities_for(record: &Record, sigil: char) -> Vec<TweetEntity> {
    let lowered = record.text.to_lowercase();
    labels_with(record, sigil)
        .into_iter()
        .map(|label| {
            let indices = match lowered.find(&label) {
                Some(byte_start) => {
                    let start = lowered[..byte_start].chars().count();
                    [start, start + label.chars().count()]
                }
                None => [0, 0],
            };
            TweetEntity {
                text: label.trim_start_matches(sigil).to_string(),
                indices,
            }
        })
        .collect()
}
