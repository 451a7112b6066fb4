//! Lifecycle manager — ordered startup, diagnostics, reverse shutdown.
//!
//! Startup wires the components leaves-first: store, audit trail, router,
//! policy, queue, pipeline, then crash recovery, then the worker pool and
//! the background loops (heartbeat, watchdog). Shutdown walks the same
//! order in reverse. Liveness is derived from the worker pool's
//! heartbeat; readiness flips once startup completes and off again when
//! shutdown begins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::axis::approval::ApprovalCoordinator;
use crate::axis::audit::AuditTrail;
use crate::axis::breaker::CircuitBreaker;
use crate::axis::dag::DagExecutor;
use crate::axis::gauge::{sample_disk_percent, sample_rss_percent, ResourceGauge};
use crate::axis::idempotency::ExecutionLog;
use crate::axis::pipeline::{Pipeline, StepRunner};
use crate::axis::queue::{JobQueue, QueueError, RecoveryReport};
use crate::axis::registry::ComponentRegistry;
use crate::axis::router::MessageRouter;
use crate::axis::rules::StandingRules;
use crate::axis::sentinel::{Sentinel, SentinelComponent};
use crate::axis::worker::WorkerPool;
use crate::config::MeridianConfig;
use crate::heartbeat::{self, HeartbeatDeps};
use crate::store::Store;

/// Watchdog poll interval.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);
/// Worker heartbeat age considered wedged.
const STALE_HEARTBEAT_MS: u64 = 60_000;

/// Liveness and readiness snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Health {
    /// Startup finished and shutdown has not begun.
    pub ready: bool,
    /// The worker pool heartbeat is fresh.
    pub live: bool,
    /// Milliseconds since the last worker heartbeat.
    pub workers_heartbeat_age_ms: u64,
    /// Gears whose circuits are currently open.
    pub open_circuits: Vec<String>,
}

/// The assembled runtime.
pub struct Lifecycle {
    config: MeridianConfig,
    store: Store,
    registry: Arc<ComponentRegistry>,
    router: Arc<MessageRouter>,
    queue: Arc<JobQueue>,
    coordinator: Arc<ApprovalCoordinator>,
    breaker: Arc<CircuitBreaker>,
    pool: Arc<WorkerPool>,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
    recovery: RecoveryReport,
    ready: AtomicBool,
}

impl Lifecycle {
    /// Run the ordered startup sequence and return the live runtime.
    ///
    /// `runner` is the boundary to the external gear runtime; tests and
    /// the bare CLI inject stubs.
    pub async fn start(
        config: MeridianConfig,
        runner: Arc<dyn StepRunner>,
    ) -> anyhow::Result<Self> {
        info!(data_dir = %config.paths.data_dir.display(), "runtime starting");

        // 1. Durable store and migrations.
        let store = Store::open(&config.paths.data_dir).await?;

        // 2. Audit trail.
        let audit = Arc::new(AuditTrail::new(store.meridian().clone()));

        // 3. Transport: registry and router, audited.
        let registry = Arc::new(ComponentRegistry::new());
        let router = Arc::new(MessageRouter::new(
            registry.clone(),
            audit.clone(),
            config.router.clone(),
        ));

        // 4. Resource gauge, seeded with a first sample.
        let gauge = Arc::new(ResourceGauge::new(config.backpressure.clone()));
        gauge.set_rss_percent(sample_rss_percent());
        gauge.set_disk_percent(sample_disk_percent(&config.paths.data_dir));

        // 5. Queue.
        let queue = Arc::new(JobQueue::new(
            store.meridian().clone(),
            router.clone(),
            audit.clone(),
            gauge.clone(),
            config.queue.clone(),
        ));

        // 6. Policy: validator component, standing rules, approvals.
        let sentinel = Arc::new(Sentinel::with_workspace(
            config.sentinel.clone(),
            config.paths.workspace_root.clone(),
        ));
        registry
            .register("sentinel", Arc::new(SentinelComponent::new(sentinel)))
            .await;
        let rules = Arc::new(StandingRules::new(store.sentinel().clone()));
        let coordinator = Arc::new(ApprovalCoordinator::new(
            store.meridian().clone(),
            queue.clone(),
            router.clone(),
            rules,
            config.approval.clone(),
        ));

        // 7. Execution machinery.
        let shutdown = CancellationToken::new();
        let execution_log = Arc::new(ExecutionLog::new(store.meridian().clone()));
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let pipeline = Arc::new(Pipeline::new(
            queue.clone(),
            router.clone(),
            DagExecutor::new(config.dag.clone()),
            execution_log,
            breaker.clone(),
            coordinator.clone(),
            runner,
            config.timeouts.clone(),
            shutdown.clone(),
        ));
        registry
            .register("executor", pipeline.executor_component())
            .await;

        // 8. Crash recovery before anything can claim.
        let recovery = queue.recover().await?;
        if recovery.is_clean() {
            info!("recovery: clean start");
        } else {
            info!(
                requeued = recovery.requeued.len(),
                failed = recovery.failed.len(),
                "recovery report"
            );
        }

        // 9. Workers.
        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            pipeline.clone(),
            gauge.clone(),
            config.workers.clone(),
        ));
        pool.start();

        // 10. Background loops.
        let heartbeat = heartbeat::spawn(
            HeartbeatDeps {
                store: store.clone(),
                queue: queue.clone(),
                coordinator: coordinator.clone(),
                gauge: gauge.clone(),
                config: config.clone(),
            },
            shutdown.clone(),
        );

        let lifecycle = Self {
            config,
            store,
            registry,
            router,
            queue,
            coordinator,
            breaker,
            pool,
            shutdown: shutdown.clone(),
            background: Mutex::new(vec![heartbeat]),
            recovery,
            ready: AtomicBool::new(true),
        };
        lifecycle.spawn_watchdog();

        info!("runtime ready");
        Ok(lifecycle)
    }

    fn spawn_watchdog(&self) {
        // A wedged pool is loud in the logs long before anyone notices
        // jobs piling up.
        let shutdown = self.shutdown.clone();
        let pool = Arc::clone(&self.pool);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(WATCHDOG_INTERVAL) => {}
                }
                let age_ms = pool.heartbeat_age_ms();
                if age_ms > STALE_HEARTBEAT_MS {
                    warn!(age_ms, "worker pool heartbeat is stale");
                }
            }
        });
        match self.background.lock() {
            Ok(mut guard) => guard.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    /// Current liveness and readiness.
    pub fn health(&self) -> Health {
        let age = self.pool.heartbeat_age_ms();
        Health {
            ready: self.ready.load(Ordering::Relaxed),
            live: age < STALE_HEARTBEAT_MS,
            workers_heartbeat_age_ms: age,
            open_circuits: self.breaker.open_gears(),
        }
    }

    /// Cancel a job: the queue transition plus the in-flight token.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.queue.cancel(job_id).await?;
        self.pool.cancel_job(job_id);
        Ok(())
    }

    /// Reverse-ordered shutdown: background loops, workers, store.
    pub async fn shutdown(&self) {
        info!("runtime shutting down");
        self.ready.store(false, Ordering::Relaxed);
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = match self.background.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            let _ = handle.await;
        }

        self.pool.stop().await;
        self.store.close().await;
        info!("runtime stopped");
    }

    /// The job queue.
    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// The message router.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// The component registry, for external collaborators to register.
    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    /// The approval coordinator, for the confirmation surface.
    pub fn coordinator(&self) -> &Arc<ApprovalCoordinator> {
        &self.coordinator
    }

    /// The durable store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// What startup recovery did.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Effective configuration.
    pub fn config(&self) -> &MeridianConfig {
        &self.config
    }
}
