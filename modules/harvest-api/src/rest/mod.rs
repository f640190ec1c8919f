use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::Json;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use apify_client::{parse_created_at, Tweet, TweetScraperInput};

use crate::auth::{ApifyAuth, BearerAuth};
use crate::compat::{to_apify_tweet, to_custom_tweet, CustomTweet};
use crate::error::{ApiError, Result};
use crate::service::DEFAULT_LIMIT;
use crate::AppState;

// --- Request bodies ---

#[derive(Debug, Deserialize)]
pub struct SearchBody {
    query: String,
    start_date: Option<String>,
    end_date: Option<String>,
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    include_retweets: bool,
}

fn default_limit() -> u32 {
    DEFAULT_LIMIT
}

#[derive(Debug, Deserialize)]
pub struct ValidateBody {
    urls: Vec<String>,
}

/// Accepts RFC 3339, naive ISO timestamps (UTC) and bare dates.
fn parse_date(field: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    if let Some(ts) = parse_created_at(raw) {
        return Ok(Some(ts));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Some(naive.and_utc()))
        .ok_or_else(|| ApiError::BadRequest(format!("invalid {field}: {raw}")))
}

// --- Handlers ---

pub async fn api_search(
    _auth: BearerAuth,
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<SearchBody>, JsonRejection>,
) -> Result<Json<Value>> {
    let Json(body) = body?;
    let since = parse_date("start_date", body.start_date.as_deref())?;
    let until = parse_date("end_date", body.end_date.as_deref())?;

    let records = state.service.search(&body.query, since, until, body.limit).await?;
    let tweets: Vec<CustomTweet> = records
        .iter()
        .filter(|r| body.include_retweets || !r.is_retweet)
        .map(to_custom_tweet)
        .collect();

    Ok(Json(json!({
        "status": "success",
        "count": tweets.len(),
        "tweets": tweets,
        "source": "database",
    })))
}

pub async fn api_validate(
    _auth: BearerAuth,
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<ValidateBody>, JsonRejection>,
) -> Result<Json<Value>> {
    let Json(body) = body?;
    if body.urls.is_empty() {
        return Err(ApiError::BadRequest("urls must not be empty".into()));
    }

    let outcome = state.service.validate(&body.urls).await?;
    let tweets: Vec<CustomTweet> = outcome.records.iter().map(to_custom_tweet).collect();

    Ok(Json(json!({
        "status": "success",
        "count": tweets.len(),
        "requested": outcome.requested,
        "tweets": tweets,
        "from_storage": outcome.from_storage,
        "fetched": outcome.fetched,
        "missing": outcome.missing,
        "fallback_timed_out": outcome.fallback_timed_out,
    })))
}

pub async fn api_stats(_auth: BearerAuth, State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    let stats = state.service.stats().await?;
    Ok(Json(json!({
        "status": "success",
        "total_tweets": stats.total,
        "last_hour": stats.last_hour,
        "last_24h": stats.last_24h,
        "unique_labels": stats.unique_labels,
        "top_labels": stats.top_labels,
        "date_range": {
            "latest": stats.newest,
            "earliest": stats.oldest,
        },
    })))
}

/// Apify `run-sync-get-dataset-items`: the actor id is accepted as given and
/// the run is answered synchronously from this service.
pub async fn apify_run_sync(
    _auth: ApifyAuth,
    State(state): State<Arc<AppState>>,
    Path(actor): Path<String>,
    body: std::result::Result<Json<TweetScraperInput>, JsonRejection>,
) -> Result<Json<Vec<Tweet>>> {
    let Json(input) = body?;
    info!(
        actor = actor.as_str(),
        search_terms = input.search_terms.len(),
        start_urls = input.start_urls.len(),
        "Apify-compatible run"
    );

    let records = state.service.run_scraper(&input).await?;
    Ok(Json(records.iter().map(to_apify_tweet).collect()))
}
