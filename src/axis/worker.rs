//! Worker pool — claim-based concurrent queue drain.
//!
//! A fixed pool of workers loops: claim the oldest pending job, hand it to
//! the injected processor with a per-job cancellation token, repeat. The
//! pool knows nothing of planning or validation. Idle workers sleep one
//! poll interval; while the RSS gauge is above its pause threshold no new
//! claims are made. `stop()` signals every token, waits out the graceful
//! window, then aborts whatever is left. A monotonic heartbeat lets the
//! lifecycle watchdog notice a wedged pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::axis::gauge::ResourceGauge;
use crate::axis::queue::JobQueue;
use crate::config::WorkerConfig;
use crate::types::Job;

/// Processes one claimed job to settlement. Injected by the lifecycle.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Process `job`, observing `cancel` at safe points.
    async fn process(&self, job: Job, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// The claim-dispatch worker pool.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    processor: Arc<dyn JobProcessor>,
    gauge: Arc<ResourceGauge>,
    config: WorkerConfig,
    poll_interval: Duration,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    active: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    started_at: Instant,
    heartbeat_ms: Arc<AtomicU64>,
}

impl WorkerPool {
    /// Build a pool; workers start on [`WorkerPool::start`].
    pub fn new(
        queue: Arc<JobQueue>,
        processor: Arc<dyn JobProcessor>,
        gauge: Arc<ResourceGauge>,
        config: WorkerConfig,
    ) -> Self {
        let poll_interval = Duration::from_millis(queue.config().poll_interval_ms);
        Self {
            queue,
            processor,
            gauge,
            config,
            poll_interval,
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
            started_at: Instant::now(),
            heartbeat_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn the worker loops.
    pub fn start(&self) {
        let count = self.config.effective_pool_size();
        info!(workers = count, "starting worker pool");

        let mut workers = lock(&self.workers);
        for index in 0..count {
            let queue = Arc::clone(&self.queue);
            let processor = Arc::clone(&self.processor);
            let gauge = Arc::clone(&self.gauge);
            let shutdown = self.shutdown.clone();
            let active = Arc::clone(&self.active);
            let heartbeat = Arc::clone(&self.heartbeat_ms);
            let started_at = self.started_at;
            let poll = self.poll_interval;

            workers.push(tokio::spawn(async move {
                let worker_id = format!("worker-{index}");
                worker_loop(
                    &worker_id, queue, processor, gauge, shutdown, active, heartbeat, started_at,
                    poll,
                )
                .await;
            }));
        }
    }

    /// Signal every token, await completion up to the graceful window,
    /// then force-cancel the stragglers.
    pub async fn stop(&self) {
        info!("stopping worker pool");
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        let grace = Duration::from_millis(self.config.graceful_shutdown_timeout_ms);
        let drain = async {
            for handle in &handles {
                // Workers observe the token at their next safe point.
                while !handle.is_finished() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        };

        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("graceful window elapsed, aborting workers");
            for handle in &handles {
                handle.abort();
            }
        }
    }

    /// Cancel one in-flight job's token. Returns whether it was in flight.
    pub fn cancel_job(&self, job_id: Uuid) -> bool {
        let active = lock(&self.active);
        match active.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Milliseconds since the last worker heartbeat.
    pub fn heartbeat_age_ms(&self) -> u64 {
        let now = u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        now.saturating_sub(self.heartbeat_ms.load(Ordering::Relaxed))
    }

    /// Ids of jobs currently being processed.
    pub fn active_jobs(&self) -> Vec<Uuid> {
        lock(&self.active).keys().copied().collect()
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: &str,
    queue: Arc<JobQueue>,
    processor: Arc<dyn JobProcessor>,
    gauge: Arc<ResourceGauge>,
    shutdown: CancellationToken,
    active: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    heartbeat: Arc<AtomicU64>,
    started_at: Instant,
    poll: Duration,
) {
    loop {
        let now = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        heartbeat.fetch_max(now, Ordering::Relaxed);

        if shutdown.is_cancelled() {
            break;
        }

        if gauge.rss_paused() {
            idle(&shutdown, poll).await;
            continue;
        }

        match queue.claim(worker_id).await {
            Ok(Some(job)) => {
                let job_id = job.id;
                let token = shutdown.child_token();
                lock(&active).insert(job_id, token.clone());

                if let Err(e) = processor.process(job, token).await {
                    error!(worker = worker_id, job_id = %job_id, error = %e, "job processing failed");
                }
                lock(&active).remove(&job_id);
            }
            Ok(None) => idle(&shutdown, poll).await,
            Err(e) => {
                warn!(worker = worker_id, error = %e, "claim failed");
                idle(&shutdown, poll).await;
            }
        }
    }
    info!(worker = worker_id, "worker stopped");
}

/// Sleep one poll interval, waking early on shutdown.
async fn idle(shutdown: &CancellationToken, poll: Duration) {
    tokio::select! {
        () = shutdown.cancelled() => {}
        () = tokio::time::sleep(poll) => {}
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::audit::NoOpAuditWriter;
    use crate::axis::queue::NewJob;
    use crate::axis::registry::ComponentRegistry;
    use crate::axis::router::MessageRouter;
    use crate::config::{BackpressureConfig, DeviceTier, QueueConfig, RouterConfig};
    use crate::store::Store;
    use crate::types::JobStatus;

    struct RecordingProcessor {
        processed: Mutex<Vec<Uuid>>,
        hold_until_cancelled: bool,
        observed_cancel: Mutex<Vec<Uuid>>,
    }

    impl RecordingProcessor {
        fn new(hold_until_cancelled: bool) -> Arc<Self> {
            Arc::new(Self {
                processed: Mutex::new(Vec::new()),
                hold_until_cancelled,
                observed_cancel: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl JobProcessor for RecordingProcessor {
        async fn process(&self, job: Job, cancel: CancellationToken) -> anyhow::Result<()> {
            lock(&self.processed).push(job.id);
            if self.hold_until_cancelled {
                cancel.cancelled().await;
                lock(&self.observed_cancel).push(job.id);
            }
            Ok(())
        }
    }

    async fn fixture(
        processor: Arc<dyn JobProcessor>,
        pool_size: usize,
    ) -> (Store, Arc<JobQueue>, Arc<ResourceGauge>, WorkerPool) {
        let store = Store::open_in_memory().await.expect("store");
        let router = Arc::new(MessageRouter::new(
            Arc::new(ComponentRegistry::new()),
            Arc::new(NoOpAuditWriter),
            RouterConfig::default(),
        ));
        let gauge = Arc::new(ResourceGauge::new(BackpressureConfig::default()));
        let queue = Arc::new(JobQueue::new(
            store.meridian().clone(),
            router,
            Arc::new(NoOpAuditWriter),
            gauge.clone(),
            QueueConfig {
                poll_interval_ms: 10,
                ..QueueConfig::default()
            },
        ));
        let pool = WorkerPool::new(
            queue.clone(),
            processor,
            gauge.clone(),
            WorkerConfig {
                tier: DeviceTier::Lite,
                pool_size: Some(pool_size),
                graceful_shutdown_timeout_ms: 200,
            },
        );
        (store, queue, gauge, pool)
    }

    async fn wait_until<F: Fn() -> bool>(predicate: F) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn test_pool_drains_queue() {
        let processor = RecordingProcessor::new(false);
        let (_store, queue, _gauge, pool) = fixture(processor.clone(), 2).await;

        let mut expected = Vec::new();
        for _ in 0..5 {
            expected.push(queue.create_job(NewJob::default()).await.expect("create").id);
        }

        pool.start();
        wait_until(|| lock(&processor.processed).len() == 5).await;
        pool.stop().await;

        let mut processed = lock(&processor.processed).clone();
        processed.sort();
        expected.sort();
        assert_eq!(processed, expected);
        assert_eq!(queue.pending_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_jobs() {
        let processor = RecordingProcessor::new(true);
        let (_store, queue, _gauge, pool) = fixture(processor.clone(), 1).await;
        let job = queue.create_job(NewJob::default()).await.expect("create");

        pool.start();
        wait_until(|| !lock(&processor.processed).is_empty()).await;
        assert_eq!(pool.active_jobs(), vec![job.id]);

        pool.stop().await;
        // The processor observed its token before the pool gave up.
        assert_eq!(lock(&processor.observed_cancel).clone(), vec![job.id]);
        assert!(pool.active_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_one_job() {
        let processor = RecordingProcessor::new(true);
        let (_store, queue, _gauge, pool) = fixture(processor.clone(), 1).await;
        let job = queue.create_job(NewJob::default()).await.expect("create");

        pool.start();
        wait_until(|| !pool.active_jobs().is_empty()).await;
        assert!(pool.cancel_job(job.id));
        wait_until(|| pool.active_jobs().is_empty()).await;
        assert!(!pool.cancel_job(job.id), "job no longer in flight");
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_rss_pause_stops_claiming() {
        let processor = RecordingProcessor::new(false);
        let (_store, queue, gauge, pool) = fixture(processor.clone(), 1).await;
        gauge.set_rss_percent(Some(99));
        let _job = queue.create_job(NewJob::default()).await.expect("create");

        pool.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            lock(&processor.processed).is_empty(),
            "paused pool must not claim"
        );
        assert_eq!(queue.pending_count().await.expect("count"), 1);

        gauge.set_rss_percent(Some(10));
        wait_until(|| !lock(&processor.processed).is_empty()).await;
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_heartbeat_advances() {
        let processor = RecordingProcessor::new(false);
        let (_store, _queue, _gauge, pool) = fixture(processor, 1).await;
        pool.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pool.heartbeat_age_ms() < 5_000);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_claimed_jobs_reach_planning() {
        let processor = RecordingProcessor::new(false);
        let (_store, queue, _gauge, pool) = fixture(processor.clone(), 1).await;
        let job = queue.create_job(NewJob::default()).await.expect("create");

        pool.start();
        wait_until(|| !lock(&processor.processed).is_empty()).await;
        pool.stop().await;

        let claimed = queue.get(job.id).await.expect("get");
        assert_eq!(claimed.status, JobStatus::Planning);
        assert!(claimed.started_at.is_some());
    }
}
