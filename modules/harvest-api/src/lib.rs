pub mod auth;
pub mod compat;
pub mod error;
pub mod rest;
pub mod service;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderValue};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tower_http::set_header::SetResponseHeaderLayer;

pub use error::{ApiError, Result};
pub use service::{QueryService, ValidateOutcome};

pub struct AppState {
    pub service: QueryService,
    pub api_token: String,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "harvest-api",
        "version": env!("CARGO_PKG_VERSION"),
        "storage": state.service.backend(),
    }))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/", get(health))
        // Native API
        .route("/api/search", post(rest::api_search))
        .route("/api/validate", post(rest::api_validate))
        .route("/api/stats", get(rest::api_stats))
        // Apify-compatible
        .route(
            "/v2/acts/{actor}/run-sync-get-dataset-items",
            post(rest::apify_run_sync),
        )
        .with_state(state)
        .layer(tower_http::compression::CompressionLayer::new())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        // method + path only; tokens may ride in the query string
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(
                |request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                },
            ),
        )
}
