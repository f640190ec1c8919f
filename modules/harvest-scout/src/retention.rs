use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use harvest_archive::Archive;

/// Periodically deletes records older than the retention horizon.
pub struct RetentionSweeper {
    archive: Arc<Archive>,
    horizon: chrono::Duration,
    every: Duration,
}

impl RetentionSweeper {
    pub fn new(archive: Arc<Archive>, retention_days: i64, every: Duration) -> Self {
        Self {
            archive,
            horizon: chrono::Duration::days(retention_days.max(1)),
            every,
        }
    }

    /// Sweep immediately, then every `every` until `stop` turns true.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        info!(
            horizon_days = self.horizon.num_days(),
            every_secs = self.every.as_secs(),
            "Retention sweeper started"
        );
        loop {
            if let Err(e) = self.archive.sweep(self.horizon).await {
                error!(error = %e, "Retention sweep failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.every) => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Retention sweeper stopped");
    }

    pub fn spawn(self, stop: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::record;
    use chrono::Utc;

    #[tokio::test]
    async fn sweeps_on_start_and_stops_on_signal() {
        let archive = Arc::new(Archive::in_memory());
        let mut old = record("1", "#btc old");
        old.created_at = Utc::now() - chrono::Duration::days(45);
        archive
            .insert_batch(&[old, record("2", "#btc new")])
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = RetentionSweeper::new(archive.clone(), 30, Duration::from_secs(3600)).spawn(rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(archive.stats(5).await.unwrap().total, 1);
    }
}
