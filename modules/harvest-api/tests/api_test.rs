//! HTTP surface over the in-memory archive and a scripted fallback fetcher.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use tower::ServiceExt;

use apify_client::{ApifyClient, ApifyError, SearchTerm};
use harvest_api::{build_router, AppState, QueryService};
use harvest_archive::Archive;
use harvest_scout::testing::{record, sample_records, MockFetcher};
use harvest_scout::fetch::http::tweet_to_record;
use harvest_scout::{EgressIdentity, FetchExecutor, PoolConfig, ResourcePool, SourceAccount};

const TOKEN: &str = "test-token";

fn fallback_pool() -> ResourcePool {
    ResourcePool::new(
        vec![EgressIdentity {
            id: "ip-0".into(),
            proxy_url: None,
        }],
        vec![SourceAccount {
            id: "acct-0".into(),
            token: "tok".into(),
        }],
        PoolConfig {
            account_cooldown: Duration::ZERO,
            ..Default::default()
        },
    )
}

fn app(archive: Arc<Archive>, fetcher: Arc<MockFetcher>) -> Router {
    let service = QueryService::new(archive, chrono::Duration::hours(24), Duration::from_secs(5))
        .with_fallback(fallback_pool(), FetchExecutor::new(fetcher, Duration::from_secs(5)));
    build_router(Arc::new(AppState {
        service,
        api_token: TOKEN.into(),
    }))
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn health_is_public() {
    let app = app(Arc::new(Archive::in_memory()), Arc::new(MockFetcher::new()));
    let (status, body) = send(&app, Request::get("/").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["storage"], "memory");
}

#[tokio::test]
async fn missing_or_wrong_token_is_rejected_before_any_work() {
    let fetcher = Arc::new(MockFetcher::new());
    let app = app(Arc::new(Archive::in_memory()), fetcher.clone());

    let anonymous = Request::post("/api/validate")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "urls": ["123"] }).to_string()))
        .unwrap();
    let (status, body) = send(&app, anonymous).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["status"], "error");

    let wrong = Request::get("/api/stats")
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn malformed_json_gets_an_error_envelope() {
    let app = app(Arc::new(Archive::in_memory()), Arc::new(MockFetcher::new()));
    let req = Request::post("/api/search")
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"query\": "))
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn search_is_served_from_storage() {
    let archive = Arc::new(Archive::in_memory());
    let mut records = sample_records("s", 3);
    records[2].is_retweet = true;
    archive.insert_batch(&records).await.unwrap();
    let fetcher = Arc::new(MockFetcher::new());
    let app = app(archive, fetcher.clone());

    let (status, body) = send(&app, post("/api/search", json!({ "query": "#bitcoin", "limit": 10 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["source"], "database");
    assert_eq!(body["count"], 2, "retweets excluded by default");
    assert_eq!(body["tweets"][0]["author_username"], "trader");
    assert_eq!(fetcher.calls(), 0);

    let (_, body) = send(
        &app,
        post("/api/search", json!({ "query": "#bitcoin", "include_retweets": true })),
    )
    .await;
    assert_eq!(body["count"], 3);
}

#[tokio::test]
async fn validate_repairs_a_miss_once_then_serves_from_storage() {
    let archive = Arc::new(Archive::in_memory());
    archive.insert_batch(&[record("100", "stored #bitcoin")]).await.unwrap();
    let fetcher = Arc::new(MockFetcher::new().returning(vec![record("200", "fetched #bitcoin")]));
    let app = app(archive.clone(), fetcher.clone());

    let urls = json!({ "urls": [
        "https://x.com/trader/status/100",
        "https://twitter.com/trader/status/200?s=20",
    ]});

    let (status, body) = send(&app, post("/api/validate", urls.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["requested"], 2);
    assert_eq!(body["tweets"][0]["id"], "100");
    assert_eq!(body["tweets"][1]["id"], "200");
    assert_eq!(body["fetched"], 1);
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(archive.stats(1).await.unwrap().total, 2, "fetched record written through");

    let (_, body) = send(&app, post("/api/validate", urls)).await;
    assert_eq!(body["count"], 2);
    assert_eq!(body["from_storage"], 2);
    assert_eq!(fetcher.calls(), 1, "second request needs no fallback");
}

#[tokio::test]
async fn stats_report_totals_and_labels() {
    let archive = Arc::new(Archive::in_memory());
    archive.insert_batch(&sample_records("st", 4)).await.unwrap();
    let app = app(archive, Arc::new(MockFetcher::new()));

    let req = Request::get("/api/stats")
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_tweets"], 4);
    assert_eq!(body["last_24h"], 4);
    assert_eq!(body["unique_labels"], 1);
    assert_eq!(body["top_labels"][0]["label"], "#bitcoin");
    assert_eq!(body["top_labels"][0]["count"], 4);
    assert!(body["date_range"]["latest"].is_string());
}

#[tokio::test]
async fn apify_route_accepts_query_token() {
    let archive = Arc::new(Archive::in_memory());
    archive.insert_batch(&sample_records("ap", 3)).await.unwrap();
    let app = app(archive, Arc::new(MockFetcher::new()));

    let req = Request::post(format!(
        "/v2/acts/apidojo~tweet-scraper/run-sync-get-dataset-items?token={TOKEN}"
    ))
    .header(header::CONTENT_TYPE, "application/json")
    .body(Body::from(json!({ "searchTerms": ["#bitcoin"], "maxItems": 2 }).to_string()))
    .unwrap();
    let (status, body) = send(&app, req).await;

    assert_eq!(status, StatusCode::OK);
    let items = body.as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["type"], "tweet");
    assert!(items[0]["createdAt"].as_str().unwrap().ends_with(&Utc::now().format("%Y").to_string()));
}

/// The Rust client talks to this service exactly as it would to Apify.
#[tokio::test]
async fn apify_client_round_trips_through_the_service() {
    let archive = Arc::new(Archive::in_memory());
    let stored = sample_records("rt", 2);
    archive.insert_batch(&stored).await.unwrap();
    let app = app(archive, Arc::new(MockFetcher::new()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });

    let base = format!("http://{addr}/v2");
    let client = ApifyClient::with_base_url(&base, TOKEN.into());
    let tweets = client
        .search_tweets(&SearchTerm::new("#bitcoin", None, None), 10)
        .await
        .unwrap();
    assert_eq!(tweets.len(), 2);

    let mut ids: Vec<String> = tweets
        .iter()
        .filter_map(tweet_to_record)
        .map(|r| r.id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["rt0", "rt1"]);

    let intruder = ApifyClient::with_base_url(&base, "wrong".into()).max_attempts(1);
    let err = intruder
        .search_tweets(&SearchTerm::new("#bitcoin", None, None), 10)
        .await
        .unwrap_err();
    assert!(matches!(err, ApifyError::Api { status: 401, .. }));
}
