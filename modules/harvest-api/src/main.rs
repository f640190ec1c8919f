use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use harvest_api::{build_router, AppState, QueryService};
use harvest_archive::{Archive, ArchiveConfig};
use harvest_common::Config;
use harvest_scout::{FetchExecutor, HttpFetcher, ResourcePool};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("harvest=info".parse()?))
        .init();

    let config = Config::api_from_env()?;
    config.log_redacted();

    let archive = Arc::new(Archive::connect(&ArchiveConfig::from(&config)).await?);
    let mut service = QueryService::new(
        archive,
        chrono::Duration::seconds(config.freshness_window_secs),
        Duration::from_secs(config.fallback_timeout_secs),
    );

    if config.fallback_proxies.is_empty() || config.fallback_accounts.is_empty() {
        warn!("No fallback proxies or accounts configured, validation will not fall back upstream");
    } else {
        let fetch_timeout = Duration::from_secs(config.fetch_timeout_secs);
        let fetcher = HttpFetcher::new(config.upstream_url.clone(), fetch_timeout);
        service = service.with_fallback(
            ResourcePool::fallback_from_config(&config),
            FetchExecutor::new(Arc::new(fetcher), fetch_timeout),
        );
    }

    let state = Arc::new(AppState {
        service,
        api_token: config.api_token.clone(),
    });
    let app = build_router(state);

    let addr = format!("{}:{}", config.api_host, config.api_port);
    info!("Harvest API starting on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}
