// Apify-compatible upstream, reached through the leased identity's proxy with
// the leased account's token.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use apify_client::{ApifyClient, ApifyError, SearchTerm, Tweet, TweetScraperInput};
use async_trait::async_trait;
use tracing::{debug, info};

use harvest_common::{
    extract_labels, normalize_label, normalize_tweet_url, sanitize_text, tweet_id_from_url,
    DataSource, Engagement, Record,
};

use super::{FetchError, FetchSpec, SourceFetcher};
use crate::pool::{EgressIdentity, SourceAccount};

pub struct HttpFetcher {
    base_url: String,
    request_timeout: Duration,
    /// One reqwest client (and connection pool) per identity.
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl HttpFetcher {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, identity: &EgressIdentity) -> Result<reqwest::Client, FetchError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(&identity.id) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder().timeout(self.request_timeout);
        if let Some(proxy_url) = &identity.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| FetchError::IdentityBanned(format!("invalid proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;

        debug!(identity = identity.id.as_str(), "Built HTTP client for identity");
        clients.insert(identity.id.clone(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(
        &self,
        account: &SourceAccount,
        identity: &EgressIdentity,
        spec: &FetchSpec,
    ) -> Result<Vec<Record>, FetchError> {
        let http = self.client_for(identity)?;
        // The pool owns retry policy, so the client makes a single attempt.
        let client =
            ApifyClient::with_http_client(http, &self.base_url, account.token.clone()).max_attempts(1);

        let input = match spec {
            FetchSpec::Search {
                query,
                since,
                until,
                limit,
            } => {
                let term = SearchTerm::new(query.clone(), Some(*since), Some(*until));
                TweetScraperInput::search(term.format(), *limit)
            }
            FetchSpec::Lookup { urls } => TweetScraperInput::urls(urls, urls.len() as u32),
        };

        let tweets = client.run_tweet_scraper(&input).await.map_err(classify)?;
        let received = tweets.len();
        let records: Vec<Record> = tweets.iter().filter_map(tweet_to_record).collect();
        info!(
            kind = spec.kind(),
            account = account.id.as_str(),
            received,
            normalized = records.len(),
            "Upstream fetch complete"
        );
        Ok(records)
    }
}

/// Map an upstream failure onto the pool's retry/ban taxonomy.
pub fn classify(err: ApifyError) -> FetchError {
    match err {
        ApifyError::Api { status: 401, message } => FetchError::CredentialRevoked(message),
        ApifyError::Api { status: 407, .. } => {
            FetchError::IdentityBanned("proxy authentication required".into())
        }
        ApifyError::Api { status: 403, message } => FetchError::Blocked(message),
        ApifyError::Api { status: 429, .. } | ApifyError::RateLimited { .. } => FetchError::RateLimited,
        ApifyError::Api { status, message } => FetchError::Network(format!("HTTP {status}: {message}")),
        ApifyError::Network(message) => FetchError::Network(message),
        ApifyError::Parse(message) => FetchError::Malformed(message),
    }
}

/// Normalize a scraper item. Items missing an id, author, timestamp or
/// text are skipped.
pub fn tweet_to_record(tweet: &Tweet) -> Option<Record> {
    let author = tweet.author.as_ref()?;
    let user_name = author.user_name.as_deref()?.trim_start_matches('@').to_string();

    let raw_url = tweet.url.as_deref().or(tweet.twitter_url.as_deref());
    let id = tweet
        .id
        .clone()
        .or_else(|| raw_url.and_then(tweet_id_from_url))?;
    let url = raw_url
        .and_then(normalize_tweet_url)
        .unwrap_or_else(|| format!("https://x.com/{user_name}/status/{id}"));

    let text = sanitize_text(tweet.content()?);
    let created_at = tweet.created_at_utc()?;

    let mut labels: Vec<String> = Vec::new();
    for label in tweet
        .entity_tags()
        .iter()
        .map(|t| normalize_label(t))
        .chain(extract_labels(&text))
    {
        if !labels.contains(&label) {
            labels.push(label);
        }
    }

    Some(Record {
        id,
        url,
        author: user_name,
        author_display_name: author.name.clone(),
        created_at,
        text,
        labels,
        source: DataSource::X,
        engagement: Engagement {
            likes: tweet.like_count.unwrap_or(0),
            retweets: tweet.retweet_count.unwrap_or(0),
            replies: tweet.reply_count.unwrap_or(0),
            quotes: tweet.quote_count.unwrap_or(0),
        },
        media_urls: tweet.media.iter().map(|m| m.media_url_https.clone()).collect(),
        is_retweet: tweet.is_retweet.unwrap_or(false),
        is_reply: tweet.is_reply.unwrap_or(false),
        conversation_id: tweet.conversation_id.clone(),
    })
}
