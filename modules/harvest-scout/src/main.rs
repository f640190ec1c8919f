use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use harvest_archive::{Archive, ArchiveConfig};
use harvest_common::Config;
use harvest_scout::{
    CollectionScheduler, FetchExecutor, HttpFetcher, ResourcePool, RetentionSweeper, SchedulerConfig,
};

const RETENTION_SWEEP_EVERY: Duration = Duration::from_secs(6 * 3600);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("harvest=info".parse()?))
        .json()
        .init();

    info!("Harvest scout starting...");

    let config = Config::scout_from_env()?;
    config.log_redacted();

    let archive = Arc::new(Archive::connect(&ArchiveConfig::from(&config)).await?);
    let pool = ResourcePool::from_config(&config);
    let fetcher = HttpFetcher::new(
        config.upstream_url.clone(),
        Duration::from_secs(config.fetch_timeout_secs),
    );
    let executor = FetchExecutor::new(
        Arc::new(fetcher),
        Duration::from_secs(config.fetch_timeout_secs),
    );

    let (stop_tx, stop_rx) = watch::channel(false);

    let sweeper = RetentionSweeper::new(archive.clone(), config.retention_days, RETENTION_SWEEP_EVERY)
        .spawn(stop_rx.clone());

    let scheduler = CollectionScheduler::new(
        pool,
        executor,
        archive,
        SchedulerConfig::from_config(&config),
    );
    let collector = tokio::spawn(async move { scheduler.run(stop_rx).await });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, finishing in-flight work");
    stop_tx.send(true)?;

    let totals = collector.await?;
    sweeper.await?;
    info!(batches = totals.batches, stored = totals.stored, "Harvest scout stopped");
    Ok(())
}
