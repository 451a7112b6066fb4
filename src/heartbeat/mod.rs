//! Heartbeat: the periodic maintenance loop.
//!
//! Ticks in the background while the runtime is up. Each tick samples the
//! resource gauge, sweeps expired approval nonces, and fires the
//! cron-gated maintenance tasks: the retention sweep, and — only while
//! the queue is idle — an encrypted snapshot followed by rotation.

pub mod backup;
pub mod retention;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::axis::approval::ApprovalCoordinator;
use crate::axis::gauge::{sample_disk_percent, sample_rss_percent, ResourceGauge};
use crate::axis::queue::JobQueue;
use crate::config::MeridianConfig;
use crate::store::Store;

/// Default tick interval.
const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Shared dependencies for the heartbeat runner.
pub struct HeartbeatDeps {
    /// Durable store (retention, snapshots).
    pub store: Store,
    /// Queue, for the idle check before snapshots.
    pub queue: Arc<JobQueue>,
    /// Coordinator, for expired-nonce cleanup.
    pub coordinator: Arc<ApprovalCoordinator>,
    /// Gauge fed with fresh samples each tick.
    pub gauge: Arc<ResourceGauge>,
    /// Full runtime configuration.
    pub config: MeridianConfig,
}

/// Spawn the heartbeat loop. Returns its task handle; cancel `shutdown`
/// to stop it.
pub fn spawn(deps: HeartbeatDeps, shutdown: CancellationToken) -> JoinHandle<()> {
    spawn_with_interval(deps, shutdown, TICK_INTERVAL)
}

/// Heartbeat with an explicit tick interval (tests).
pub fn spawn_with_interval(
    deps: HeartbeatDeps,
    shutdown: CancellationToken,
    tick: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_retention = Utc::now();
        let mut last_backup = Utc::now();
        info!("heartbeat started");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(tick) => {}
            }

            let now = Utc::now();
            sample_gauges(&deps);

            if let Err(e) = deps.coordinator.cleanup_expired().await {
                warn!(error = %e, "nonce cleanup failed");
            }

            if backup::cron_due(&deps.config.retention.sweep_cron, last_retention, now) {
                last_retention = now;
                retention::sweep(&deps.store, &deps.config.retention).await;
            }

            if backup::cron_due(&deps.config.backup.snapshot_cron, last_backup, now) {
                if let Err(e) = run_backup(&deps, &mut last_backup, now).await {
                    warn!(error = %e, "scheduled backup failed");
                }
            }
        }
        info!("heartbeat stopped");
    })
}

fn sample_gauges(deps: &HeartbeatDeps) {
    deps.gauge.set_rss_percent(sample_rss_percent());
    deps.gauge
        .set_disk_percent(sample_disk_percent(&deps.config.paths.data_dir));
}

/// Snapshot only while nothing is in flight; a busy tick leaves the
/// schedule armed for the next one.
async fn run_backup(
    deps: &HeartbeatDeps,
    last_backup: &mut DateTime<Utc>,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let active = deps.queue.active_count().await?;
    if active > 0 {
        return Ok(());
    }
    if deps.config.backup.password.is_none() {
        warn!("backup due but no password configured, skipping");
        *last_backup = now;
        return Ok(());
    }

    *last_backup = now;
    let key = backup::backup_key(&deps.config.paths.data_dir, &deps.config.backup)?;
    backup::create_snapshot(&deps.store, &deps.config.paths.backups_dir, &key).await?;
    backup::rotate(&deps.config.paths.backups_dir, &deps.config.backup)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::audit::NoOpAuditWriter;
    use crate::axis::registry::ComponentRegistry;
    use crate::axis::router::MessageRouter;
    use crate::axis::rules::StandingRules;
    use crate::config::{ApprovalConfig, QueueConfig, RouterConfig};

    async fn deps() -> HeartbeatDeps {
        let store = Store::open_in_memory().await.expect("store");
        let router = Arc::new(MessageRouter::new(
            Arc::new(ComponentRegistry::new()),
            Arc::new(NoOpAuditWriter),
            RouterConfig::default(),
        ));
        let gauge = Arc::new(ResourceGauge::new(Default::default()));
        let queue = Arc::new(JobQueue::new(
            store.meridian().clone(),
            router.clone(),
            Arc::new(NoOpAuditWriter),
            gauge.clone(),
            QueueConfig::default(),
        ));
        let rules = Arc::new(StandingRules::new(store.sentinel().clone()));
        let coordinator = Arc::new(ApprovalCoordinator::new(
            store.meridian().clone(),
            queue.clone(),
            router,
            rules,
            ApprovalConfig::default(),
        ));
        HeartbeatDeps {
            store,
            queue,
            coordinator,
            gauge,
            config: MeridianConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let handle = spawn_with_interval(deps().await, shutdown.clone(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("heartbeat exits promptly")
            .expect("no panic");
    }
}
