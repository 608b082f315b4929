//! Background maintenance: periodic stale-task reclamation and
//! terminal-task retention purges.
//!
//! Runs as its own `tokio` task alongside the workers and the API
//! facade. Each cadence is independent so a slow purge doesn't delay
//! stale-reset, and vice versa.

use std::time::Duration;

use sqlx::PgPool;
use tracing::{error, info};

use crate::principal::Principal;
use crate::queue::QueueService;

/// Cadences and thresholds for the maintenance loop.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub stale_timeout_minutes: i64,
    pub purge_retention_days: i64,
    pub reset_interval: Duration,
    pub purge_interval: Duration,
    /// Delay before the first tick of either loop, so maintenance doesn't
    /// race the workers' own startup.
    pub startup_grace: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            stale_timeout_minutes: 60,
            purge_retention_days: 7,
            reset_interval: Duration::from_secs(5 * 60),
            purge_interval: Duration::from_secs(6 * 60 * 60),
            startup_grace: Duration::from_secs(10),
        }
    }
}

/// Run the maintenance loop until `cancel` fires.
pub async fn run_maintenance(
    pool: PgPool,
    config: MaintenanceConfig,
    cancel: tokio_util::sync::CancellationToken,
) {
    let service = QueueService::new(pool, crate::queue::QueueDefaults::default(), []);
    let operator = Principal::local_superuser();

    tokio::select! {
        _ = tokio::time::sleep(config.startup_grace) => {}
        _ = cancel.cancelled() => return,
    }

    let mut reset_tick = tokio::time::interval(config.reset_interval);
    let mut purge_tick = tokio::time::interval(config.purge_interval);

    loop {
        tokio::select! {
            _ = reset_tick.tick() => {
                match service.reset_stale(&operator, config.stale_timeout_minutes).await {
                    Ok(n) if n > 0 => info!(count = n, "maintenance: reclaimed stale tasks"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "maintenance: reset_stale failed"),
                }
            }
            _ = purge_tick.tick() => {
                match service.purge_old(&operator, config.purge_retention_days).await {
                    Ok(n) if n > 0 => info!(count = n, "maintenance: purged retained tasks"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "maintenance: purge_old failed"),
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}
