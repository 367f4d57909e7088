//! Marks nodes offline once their heartbeat goes stale.
//!
//! Repurposed from the cleanup worker's periodic-sweep shape: a ticking
//! interval with graceful shutdown via a `watch::Receiver<bool>`, logging a
//! count only when it does something.

use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct OfflineSweepConfig {
    pub interval: Duration,
    pub heartbeat_timeout: Duration,
}

pub struct OfflineSweepWorker {
    pool: PgPool,
    config: OfflineSweepConfig,
}

impl OfflineSweepWorker {
    pub fn new(pool: PgPool, config: OfflineSweepConfig) -> Self {
        Self { pool, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            heartbeat_timeout_secs = self.config.heartbeat_timeout.as_secs(),
            "Starting offline sweep worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Offline sweep worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn sweep(&self) {
        match self.mark_stale_nodes_offline().await {
            Ok(count) if count > 0 => {
                warn!(count, "Marked nodes offline after missed heartbeats");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Offline sweep failed"),
        }
    }

    async fn mark_stale_nodes_offline(&self) -> Result<u64, sqlx::Error> {
        let timeout_secs = self.config.heartbeat_timeout.as_secs() as i64;
        let result = sqlx::query(
            r#"
            UPDATE nodes
            SET status = 'offline', updated_at = now()
            WHERE status = 'online'
              AND (last_heartbeat_at IS NULL OR last_heartbeat_at < now() - make_interval(secs => $1))
            "#,
        )
        .bind(timeout_secs)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_carries_given_durations() {
        let config = OfflineSweepConfig {
            interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
        };
        assert_eq!(config.interval.as_secs(), 30);
        assert_eq!(config.heartbeat_timeout.as_secs(), 90);
    }
}
