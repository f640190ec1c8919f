pub mod error;
pub mod search;
pub mod types;

use std::time::Duration;

pub use error::{ApifyError, Result};
pub use search::SearchTerm;
pub use types::{
    format_created_at, parse_created_at, StartUrl, Tweet, TweetAuthor, TweetEntities, TweetEntity,
    TweetMedia, TweetScraperInput,
};

const BASE_URL: &str = "https://api.apify.com/v2";

/// Actor ID for apidojo/tweet-scraper.
pub const TWEET_SCRAPER: &str = "61RPP7dywgiy0JPD0";

/// Client for the tweet-scraper actor. Works against api.apify.com or any
/// server that speaks the same contract (`with_base_url`).
pub struct ApifyClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    max_attempts: u32,
    retry_delay: Duration,
}

impl ApifyClient {
    pub fn new(token: String) -> Self {
        Self::with_base_url(BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: String) -> Self {
        Self::with_http_client(reqwest::Client::new(), base_url, token)
    }

    /// Use a preconfigured HTTP client (proxy, timeouts).
    pub fn with_http_client(client: reqwest::Client, base_url: &str, token: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
        }
    }

    /// Attempts per call when the server answers 429. 1 disables retrying.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Run the tweet scraper synchronously and return its dataset items.
    /// Rate-limited calls back off linearly (`retry_delay × attempt`).
    pub async fn run_tweet_scraper(&self, input: &TweetScraperInput) -> Result<Vec<Tweet>> {
        let url = format!(
            "{}/acts/{}/run-sync-get-dataset-items",
            self.base_url, TWEET_SCRAPER
        );

        for attempt in 1..=self.max_attempts {
            let resp = self
                .client
                .post(&url)
                .bearer_auth(&self.token)
                .json(input)
                .send()
                .await?;

            let status = resp.status();
            if status.as_u16() == 429 {
                if attempt < self.max_attempts {
                    let wait = self.retry_delay * attempt;
                    tracing::warn!(attempt, wait_secs = wait.as_secs_f64(), "Rate limited, backing off");
                    tokio::time::sleep(wait).await;
                }
                continue;
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(ApifyError::Api {
                    status: status.as_u16(),
                    message: body,
                });
            }

            let tweets: Vec<Tweet> = resp.json().await?;
            tracing::debug!(count = tweets.len(), attempt, "Fetched tweets");
            return Ok(tweets);
        }

        Err(ApifyError::RateLimited {
            attempts: self.max_attempts,
        })
    }

    /// Keyword/hashtag search (search term in the scraper's convention).
    pub async fn search_tweets(&self, term: &SearchTerm, limit: u32) -> Result<Vec<Tweet>> {
        tracing::info!(term = %term.format(), limit, "Starting X/Twitter search");
        self.run_tweet_scraper(&TweetScraperInput::search(term.format(), limit))
            .await
    }

    /// Fetch specific tweets by URL.
    pub async fn tweets_by_url(&self, urls: &[String]) -> Result<Vec<Tweet>> {
        tracing::info!(count = urls.len(), "Fetching X/Twitter posts by URL");
        self.run_tweet_scraper(&TweetScraperInput::urls(urls, urls.len() as u32))
            .await
    }
}
