//! Durable job queue and state machine.
//!
//! Jobs progress through a restricted state graph; every transition is a
//! compare-and-set inside a single transaction, so a job's history is
//! totally ordered no matter how many workers are running. Terminal rows
//! are immutable. Startup recovery requeues rows that were mid-flight when
//! the process died.

use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::axis::audit::AuditWriter;
use crate::axis::gauge::ResourceGauge;
use crate::axis::router::MessageRouter;
use crate::config::QueueConfig;
use crate::ids::new_id;
use crate::types::{
    ErrorKind, Event, ExecutionPlan, Job, JobError, JobSource, JobStatus, ValidationResult,
};

/// Is `(from, to)` a declared transition?
///
/// This table is exhaustive; everything else is refused with
/// `ILLEGAL_TRANSITION`.
pub fn is_permitted(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Pending, Planning)
            | (Pending, Cancelled)
            | (Planning, Validating)
            | (Planning, Failed)
            | (Planning, Cancelled)
            | (Validating, AwaitingApproval)
            | (Validating, Executing)
            | (Validating, Rejected)
            | (Validating, Planning)
            | (Validating, Failed)
            | (Validating, Cancelled)
            | (AwaitingApproval, Executing)
            | (AwaitingApproval, Rejected)
            | (AwaitingApproval, Cancelled)
            | (Executing, Reflecting)
            | (Executing, Failed)
            | (Executing, Cancelled)
            | (Reflecting, Completed)
            | (Reflecting, Failed)
    )
}

/// Queue operation failures.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No job with this id.
    #[error("job not found: {0}")]
    NotFound(Uuid),
    /// The compare-and-set failed or the pair is not in the table.
    #[error("illegal transition for job {job}: {from} -> {to}")]
    IllegalTransition {
        /// Job id.
        job: Uuid,
        /// Status actually observed.
        from: String,
        /// Requested target status.
        to: JobStatus,
    },
    /// Disk usage is above the pause threshold; creation refused.
    #[error("disk usage above pause threshold, job creation deferred")]
    DiskFull,
    /// Database error.
    #[error("queue database error: {0}")]
    Database(String),
    /// A persisted row failed to decode.
    #[error("corrupt job row: {0}")]
    Corrupt(String),
}

impl QueueError {
    /// Machine-readable kind for surfaces.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            Self::DiskFull => ErrorKind::DiskFull,
            _ => ErrorKind::HandlerError,
        }
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        QueueError::Database(e.to_string())
    }
}

/// Options for creating a job.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    /// Conversation the request arrived in.
    pub conversation_id: Option<Uuid>,
    /// Request origin.
    pub source: Option<JobSource>,
    /// Free-form request metadata.
    pub metadata: serde_json::Value,
}

/// Fields a transition may update alongside the status.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    /// Plan to store.
    pub plan: Option<ExecutionPlan>,
    /// Validation result to store.
    pub validation: Option<ValidationResult>,
    /// Result payload to store.
    pub result: Option<serde_json::Value>,
    /// Error to store.
    pub error: Option<JobError>,
    /// Spend to add to the running total.
    pub cost_usd_delta: f64,
    /// New revision count.
    pub revision_count: Option<u32>,
    /// New replan count.
    pub replan_count: Option<u32>,
}

/// Report from startup crash recovery.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Jobs reverted to `pending` with an attempt charged.
    pub requeued: Vec<Uuid>,
    /// Jobs failed outright after exhausting attempts.
    pub failed: Vec<Uuid>,
}

impl RecoveryReport {
    /// True when nothing needed recovery.
    pub fn is_clean(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// The durable job queue.
pub struct JobQueue {
    pool: SqlitePool,
    router: Arc<MessageRouter>,
    audit: Arc<dyn AuditWriter>,
    gauge: Arc<ResourceGauge>,
    config: QueueConfig,
}

impl JobQueue {
    /// Build a queue over the core database.
    pub fn new(
        pool: SqlitePool,
        router: Arc<MessageRouter>,
        audit: Arc<dyn AuditWriter>,
        gauge: Arc<ResourceGauge>,
        config: QueueConfig,
    ) -> Self {
        Self {
            pool,
            router,
            audit,
            gauge,
            config,
        }
    }

    /// Queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Create a job in `pending` and persist it.
    pub async fn create_job(&self, opts: NewJob) -> Result<Job, QueueError> {
        if self.gauge.disk_full() {
            warn!("refusing job creation: disk above pause threshold");
            return Err(QueueError::DiskFull);
        }

        let id = new_id();
        let now = Utc::now();
        let source = opts.source.unwrap_or(JobSource::User);

        sqlx::query(
            "INSERT INTO jobs (id, conversation_id, source, status, attempts, revision_count,
                               replan_count, cost_usd, created_at, updated_at, metadata)
             VALUES (?1, ?2, ?3, ?4, 0, 0, 0, 0, ?5, ?5, ?6)",
        )
        .bind(id.to_string())
        .bind(opts.conversation_id.map(|c| c.to_string()))
        .bind(source.as_str())
        .bind(JobStatus::Pending.as_str())
        .bind(now.to_rfc3339())
        .bind(opts.metadata.to_string())
        .execute(&self.pool)
        .await?;

        info!(job_id = %id, source = source.as_str(), "job created");
        self.audit_transition(id, "created", JobStatus::Pending).await;
        self.router.broadcast(Event::StatusUpdate {
            job_id: id,
            status: JobStatus::Pending,
        });

        self.get(id).await
    }

    /// Fetch a job by id.
    pub async fn get(&self, id: Uuid) -> Result<Job, QueueError> {
        let row: Option<JobRow> = sqlx::query_as(SELECT_JOB)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_into_job)
            .transpose()?
            .ok_or(QueueError::NotFound(id))
    }

    /// Atomically move a job from `expected_from` to `to`, applying `patch`
    /// in the same transaction.
    ///
    /// Fails with `IllegalTransition` if the pair is not in the table or
    /// another writer moved the job first.
    pub async fn transition(
        &self,
        id: Uuid,
        expected_from: JobStatus,
        to: JobStatus,
        patch: JobPatch,
    ) -> Result<Job, QueueError> {
        if !is_permitted(expected_from, to) {
            return Err(QueueError::IllegalTransition {
                job: id,
                from: expected_from.as_str().to_owned(),
                to,
            });
        }

        let now = Utc::now().to_rfc3339();
        let completed_at = to.is_terminal().then(|| now.clone());
        let started_at = (to == JobStatus::Planning).then(|| now.clone());

        let plan_json = encode_opt(&patch.plan)?;
        let validation_json = encode_opt(&patch.validation)?;
        let result_json = patch.result.as_ref().map(|v| v.to_string());
        let error_json = encode_opt(&patch.error)?;

        let mut tx = self.pool.begin().await?;

        let current: Option<(String,)> = sqlx::query_as("SELECT status FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some((current,)) = current else {
            return Err(QueueError::NotFound(id));
        };
        if current != expected_from.as_str() {
            return Err(QueueError::IllegalTransition {
                job: id,
                from: current,
                to,
            });
        }

        let updated = sqlx::query(
            "UPDATE jobs SET
                status = ?2,
                updated_at = ?3,
                plan = COALESCE(?4, plan),
                validation = COALESCE(?5, validation),
                result = COALESCE(?6, result),
                error = COALESCE(?7, error),
                cost_usd = cost_usd + ?8,
                revision_count = COALESCE(?9, revision_count),
                replan_count = COALESCE(?10, replan_count),
                started_at = COALESCE(started_at, ?11),
                completed_at = COALESCE(?12, completed_at)
             WHERE id = ?1 AND status = ?13",
        )
        .bind(id.to_string())
        .bind(to.as_str())
        .bind(&now)
        .bind(plan_json)
        .bind(validation_json)
        .bind(result_json)
        .bind(error_json)
        .bind(patch.cost_usd_delta)
        .bind(patch.revision_count.map(i64::from))
        .bind(patch.replan_count.map(i64::from))
        .bind(started_at)
        .bind(completed_at)
        .bind(expected_from.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated != 1 {
            return Err(QueueError::IllegalTransition {
                job: id,
                from: current,
                to,
            });
        }
        tx.commit().await?;

        info!(job_id = %id, from = expected_from.as_str(), to = to.as_str(), "job transition");
        self.audit_transition(id, expected_from.as_str(), to).await;
        self.router.broadcast(Event::StatusUpdate {
            job_id: id,
            status: to,
        });

        self.get(id).await
    }

    /// Claim the oldest `pending` job for a worker, moving it to
    /// `planning` in one transaction. Returns `None` when the queue is
    /// drained.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        loop {
            let candidate: Option<(String,)> = sqlx::query_as(
                "SELECT id FROM jobs WHERE status = 'pending'
                 ORDER BY created_at ASC, id ASC LIMIT 1",
            )
            .fetch_optional(&self.pool)
            .await?;

            let Some((id,)) = candidate else {
                return Ok(None);
            };
            let id: Uuid = id
                .parse()
                .map_err(|e| QueueError::Corrupt(format!("bad job id: {e}")))?;

            match self
                .transition(id, JobStatus::Pending, JobStatus::Planning, JobPatch::default())
                .await
            {
                Ok(job) => {
                    info!(job_id = %id, worker = worker_id, "job claimed");
                    return Ok(Some(job));
                }
                // Another worker won the row; try the next candidate.
                Err(QueueError::IllegalTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Cancel a job from any state that admits cancellation.
    pub async fn cancel(&self, id: Uuid) -> Result<Job, QueueError> {
        let current = self.get(id).await?.status;
        if !is_permitted(current, JobStatus::Cancelled) {
            return Err(QueueError::IllegalTransition {
                job: id,
                from: current.as_str().to_owned(),
                to: JobStatus::Cancelled,
            });
        }
        self.transition(id, current, JobStatus::Cancelled, JobPatch::default())
            .await
    }

    /// Startup crash recovery.
    ///
    /// Any row observed mid-flight (not terminal, not `pending`, not
    /// `awaiting_approval`) whose `updated_at` is older than the grace
    /// period is reverted to `pending` with an attempt charged; rows that
    /// exhausted their attempts are failed with `EXCEEDED_ATTEMPTS`.
    /// This is the one path that bypasses the transition table: the crash
    /// already broke the ordinary lifecycle.
    pub async fn recover(&self) -> Result<RecoveryReport, QueueError> {
        let cutoff = Utc::now()
            .checked_sub_signed(Duration::seconds(self.config.recovery_grace_secs))
            .unwrap_or_else(Utc::now)
            .to_rfc3339();

        let stale: Vec<(String, i64)> = sqlx::query_as(
            "SELECT id, attempts FROM jobs
             WHERE status IN ('planning', 'validating', 'executing', 'reflecting')
               AND updated_at < ?1",
        )
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut report = RecoveryReport::default();
        let now = Utc::now().to_rfc3339();

        for (id, attempts) in stale {
            let job_id: Uuid = id
                .parse()
                .map_err(|e| QueueError::Corrupt(format!("bad job id: {e}")))?;
            let next_attempts = attempts.saturating_add(1);

            if next_attempts > i64::from(self.config.max_attempts) {
                let error = JobError::new(
                    ErrorKind::ExceededAttempts,
                    format!("gave up after {next_attempts} recovery attempts"),
                );
                sqlx::query(
                    "UPDATE jobs SET status = 'failed', attempts = ?2, error = ?3,
                            updated_at = ?4, completed_at = ?4
                     WHERE id = ?1",
                )
                .bind(&id)
                .bind(next_attempts)
                .bind(serde_json::to_string(&error).map_err(corrupt)?)
                .bind(&now)
                .execute(&self.pool)
                .await?;
                warn!(job_id = %job_id, attempts = next_attempts, "recovery: job failed");
                self.router.broadcast(Event::StatusUpdate {
                    job_id,
                    status: JobStatus::Failed,
                });
                report.failed.push(job_id);
            } else {
                sqlx::query(
                    "UPDATE jobs SET status = 'pending', attempts = ?2, updated_at = ?3
                     WHERE id = ?1",
                )
                .bind(&id)
                .bind(next_attempts)
                .bind(&now)
                .execute(&self.pool)
                .await?;
                info!(job_id = %job_id, attempts = next_attempts, "recovery: job requeued");
                self.router.broadcast(Event::StatusUpdate {
                    job_id,
                    status: JobStatus::Pending,
                });
                report.requeued.push(job_id);
            }
        }

        Ok(report)
    }

    /// Number of jobs waiting for a claim.
    pub async fn pending_count(&self) -> Result<i64, QueueError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Number of jobs not yet in a terminal state.
    pub async fn active_count(&self) -> Result<i64, QueueError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM jobs
             WHERE status NOT IN ('completed', 'failed', 'cancelled', 'rejected')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn audit_transition(&self, id: Uuid, from: &str, to: JobStatus) {
        // Best-effort: a failed audit write must not wedge the queue.
        if let Err(e) = self
            .audit
            .append(
                "queue",
                "job.transition",
                &id.to_string(),
                serde_json::json!({"from": from, "to": to.as_str()}),
            )
            .await
        {
            warn!(job_id = %id, error = %e, "failed to audit job transition");
        }
    }
}

const SELECT_JOB: &str = "SELECT id, conversation_id, source, status, plan, validation, result,
        error, attempts, revision_count, replan_count, cost_usd, created_at, updated_at,
        started_at, completed_at, metadata
 FROM jobs WHERE id = ?1";

/// Raw row shape for the `jobs` table.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    conversation_id: Option<String>,
    source: String,
    status: String,
    plan: Option<String>,
    validation: Option<String>,
    result: Option<String>,
    error: Option<String>,
    attempts: i64,
    revision_count: i64,
    replan_count: i64,
    cost_usd: f64,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    metadata: String,
}

fn corrupt(e: impl std::fmt::Display) -> QueueError {
    QueueError::Corrupt(e.to_string())
}

fn encode_opt<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>, QueueError> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).map_err(corrupt))
        .transpose()
}

fn decode_opt<T: serde::de::DeserializeOwned>(
    value: Option<String>,
) -> Result<Option<T>, QueueError> {
    value
        .map(|v| serde_json::from_str(&v).map_err(corrupt))
        .transpose()
}

fn parse_time(value: &str) -> Result<chrono::DateTime<Utc>, QueueError> {
    Ok(chrono::DateTime::parse_from_rfc3339(value)
        .map_err(corrupt)?
        .with_timezone(&Utc))
}

fn row_into_job(row: JobRow) -> Result<Job, QueueError> {
    Ok(Job {
        id: row.id.parse().map_err(corrupt)?,
        conversation_id: row
            .conversation_id
            .map(|c| c.parse().map_err(corrupt))
            .transpose()?,
        source: row.source.parse().map_err(corrupt)?,
        status: row.status.parse().map_err(corrupt)?,
        plan: decode_opt(row.plan)?,
        validation: decode_opt(row.validation)?,
        result: decode_opt(row.result)?,
        error: decode_opt(row.error)?,
        attempts: u32::try_from(row.attempts).map_err(corrupt)?,
        revision_count: u32::try_from(row.revision_count).map_err(corrupt)?,
        replan_count: u32::try_from(row.replan_count).map_err(corrupt)?,
        cost_usd: row.cost_usd,
        created_at: parse_time(&row.created_at)?,
        updated_at: parse_time(&row.updated_at)?,
        started_at: row.started_at.as_deref().map(parse_time).transpose()?,
        completed_at: row.completed_at.as_deref().map(parse_time).transpose()?,
        metadata: serde_json::from_str(&row.metadata).map_err(corrupt)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::audit::NoOpAuditWriter;
    use crate::axis::registry::ComponentRegistry;
    use crate::config::{BackpressureConfig, RouterConfig};
    use crate::store::Store;

    const ALL_STATUSES: [JobStatus; 10] = [
        JobStatus::Pending,
        JobStatus::Planning,
        JobStatus::Validating,
        JobStatus::AwaitingApproval,
        JobStatus::Executing,
        JobStatus::Reflecting,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Rejected,
    ];

    async fn make_queue() -> (Store, Arc<ResourceGauge>, JobQueue) {
        let store = Store::open_in_memory().await.expect("store");
        let registry = Arc::new(ComponentRegistry::new());
        let router = Arc::new(MessageRouter::new(
            registry,
            Arc::new(NoOpAuditWriter),
            RouterConfig::default(),
        ));
        let gauge = Arc::new(ResourceGauge::new(BackpressureConfig::default()));
        let queue = JobQueue::new(
            store.meridian().clone(),
            router,
            Arc::new(NoOpAuditWriter),
            gauge.clone(),
            QueueConfig::default(),
        );
        (store, gauge, queue)
    }

    fn test_plan() -> ExecutionPlan {
        ExecutionPlan {
            id: new_id(),
            steps: vec![],
            reasoning: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (_s, _g, queue) = make_queue().await;
        let job = queue.create_job(NewJob::default()).await.expect("create");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);

        let fetched = queue.get(job.id).await.expect("get");
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.source, JobSource::User);
    }

    #[tokio::test]
    async fn test_permitted_transition_applies_patch() {
        let (_s, _g, queue) = make_queue().await;
        let job = queue.create_job(NewJob::default()).await.expect("create");
        queue
            .transition(job.id, JobStatus::Pending, JobStatus::Planning, JobPatch::default())
            .await
            .expect("pending -> planning");

        let plan = test_plan();
        let updated = queue
            .transition(
                job.id,
                JobStatus::Planning,
                JobStatus::Validating,
                JobPatch {
                    plan: Some(plan.clone()),
                    cost_usd_delta: 0.05,
                    ..JobPatch::default()
                },
            )
            .await
            .expect("planning -> validating");

        assert_eq!(updated.status, JobStatus::Validating);
        assert_eq!(updated.plan.expect("plan stored").id, plan.id);
        assert!((updated.cost_usd - 0.05).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_every_undeclared_pair_is_rejected() {
        let (_s, _g, queue) = make_queue().await;

        for from in ALL_STATUSES {
            for to in ALL_STATUSES {
                if is_permitted(from, to) {
                    continue;
                }
                // Force a row into `from` to exercise the runtime check.
                let job = queue.create_job(NewJob::default()).await.expect("create");
                sqlx::query("UPDATE jobs SET status = ?2 WHERE id = ?1")
                    .bind(job.id.to_string())
                    .bind(from.as_str())
                    .execute(&queue.pool)
                    .await
                    .expect("force status");

                let result = queue.transition(job.id, from, to, JobPatch::default()).await;
                assert!(
                    matches!(result, Err(QueueError::IllegalTransition { .. })),
                    "{from} -> {to} must be rejected"
                );
                // The row is left unchanged.
                let row: (String,) = sqlx::query_as("SELECT status FROM jobs WHERE id = ?1")
                    .bind(job.id.to_string())
                    .fetch_one(&queue.pool)
                    .await
                    .expect("read back");
                assert_eq!(row.0, from.as_str(), "{from} -> {to} must not mutate");
            }
        }
    }

    #[tokio::test]
    async fn test_stale_expected_from_rejected() {
        let (_s, _g, queue) = make_queue().await;
        let job = queue.create_job(NewJob::default()).await.expect("create");
        queue
            .transition(job.id, JobStatus::Pending, JobStatus::Planning, JobPatch::default())
            .await
            .expect("claim");

        // A second writer still believes the job is pending.
        let result = queue
            .transition(job.id, JobStatus::Pending, JobStatus::Planning, JobPatch::default())
            .await;
        assert!(matches!(
            result,
            Err(QueueError::IllegalTransition { ref from, .. }) if from == "planning"
        ));
    }

    #[tokio::test]
    async fn test_claim_takes_oldest_and_moves_to_planning() {
        let (_s, _g, queue) = make_queue().await;
        let first = queue.create_job(NewJob::default()).await.expect("create");
        // Make ordering deterministic even at equal timestamps.
        sqlx::query("UPDATE jobs SET created_at = '2026-01-01T00:00:00+00:00' WHERE id = ?1")
            .bind(first.id.to_string())
            .execute(&queue.pool)
            .await
            .expect("age first");
        let _second = queue.create_job(NewJob::default()).await.expect("create");

        let claimed = queue.claim("worker-0").await.expect("claim").expect("some");
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Planning);
        assert!(claimed.started_at.is_some());
    }

    #[tokio::test]
    async fn test_claim_empty_queue() {
        let (_s, _g, queue) = make_queue().await;
        assert!(queue.claim("worker-0").await.expect("claim").is_none());
    }

    #[tokio::test]
    async fn test_cancel_non_terminal() {
        let (_s, _g, queue) = make_queue().await;
        let job = queue.create_job(NewJob::default()).await.expect("create");
        let cancelled = queue.cancel(job.id).await.expect("cancel");
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_terminal_rejected() {
        let (_s, _g, queue) = make_queue().await;
        let job = queue.create_job(NewJob::default()).await.expect("create");
        queue.cancel(job.id).await.expect("cancel");
        let again = queue.cancel(job.id).await;
        assert!(matches!(again, Err(QueueError::IllegalTransition { .. })));
    }

    #[tokio::test]
    async fn test_disk_full_defers_creation() {
        let (_s, gauge, queue) = make_queue().await;
        gauge.set_disk_percent(Some(99));
        let result = queue.create_job(NewJob::default()).await;
        assert!(matches!(result, Err(QueueError::DiskFull)));
        gauge.set_disk_percent(Some(10));
        assert!(queue.create_job(NewJob::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_recovery_requeues_stale_rows() {
        let (_s, _g, queue) = make_queue().await;
        let job = queue.create_job(NewJob::default()).await.expect("create");
        queue.claim("worker-0").await.expect("claim");

        // Age the row past the grace period.
        sqlx::query("UPDATE jobs SET updated_at = '2026-01-01T00:00:00+00:00' WHERE id = ?1")
            .bind(job.id.to_string())
            .execute(&queue.pool)
            .await
            .expect("age");

        let report = queue.recover().await.expect("recover");
        assert_eq!(report.requeued, vec![job.id]);
        assert!(report.failed.is_empty());

        let recovered = queue.get(job.id).await.expect("get");
        assert_eq!(recovered.status, JobStatus::Pending);
        assert_eq!(recovered.attempts, 1);
    }

    #[tokio::test]
    async fn test_recovery_fails_exhausted_rows() {
        let (_s, _g, queue) = make_queue().await;
        let job = queue.create_job(NewJob::default()).await.expect("create");
        queue.claim("worker-0").await.expect("claim");
        sqlx::query(
            "UPDATE jobs SET updated_at = '2026-01-01T00:00:00+00:00', attempts = 3 WHERE id = ?1",
        )
        .bind(job.id.to_string())
        .execute(&queue.pool)
        .await
        .expect("age + exhaust");

        let report = queue.recover().await.expect("recover");
        assert_eq!(report.failed, vec![job.id]);

        let failed = queue.get(job.id).await.expect("get");
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(
            failed.error.expect("error recorded").kind,
            ErrorKind::ExceededAttempts
        );
    }

    #[tokio::test]
    async fn test_recovery_leaves_fresh_and_parked_rows() {
        let (_s, _g, queue) = make_queue().await;
        // Fresh claimed job: inside the grace period.
        let fresh = queue.create_job(NewJob::default()).await.expect("create");
        queue.claim("worker-0").await.expect("claim");
        // Parked job awaiting approval, however old, is never recovered.
        let parked = queue.create_job(NewJob::default()).await.expect("create");
        sqlx::query(
            "UPDATE jobs SET status = 'awaiting_approval',
                    updated_at = '2026-01-01T00:00:00+00:00' WHERE id = ?1",
        )
        .bind(parked.id.to_string())
        .execute(&queue.pool)
        .await
        .expect("park");

        let report = queue.recover().await.expect("recover");
        assert!(report.is_clean());
        assert_eq!(
            queue.get(fresh.id).await.expect("get").status,
            JobStatus::Planning
        );
        assert_eq!(
            queue.get(parked.id).await.expect("get").status,
            JobStatus::AwaitingApproval
        );
    }

    #[tokio::test]
    async fn test_counts() {
        let (_s, _g, queue) = make_queue().await;
        assert_eq!(queue.pending_count().await.expect("count"), 0);
        let job = queue.create_job(NewJob::default()).await.expect("create");
        let _ = queue.create_job(NewJob::default()).await.expect("create");
        assert_eq!(queue.pending_count().await.expect("count"), 2);
        assert_eq!(queue.active_count().await.expect("count"), 2);
        queue.cancel(job.id).await.expect("cancel");
        assert_eq!(queue.pending_count().await.expect("count"), 1);
        assert_eq!(queue.active_count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn test_status_update_broadcast() {
        let (_s, _g, queue) = make_queue().await;
        let mut events = queue.router.subscribe();
        let job = queue.create_job(NewJob::default()).await.expect("create");
        let event = events.recv().await.expect("event");
        assert!(matches!(
            event,
            Event::StatusUpdate { job_id, status: JobStatus::Pending } if job_id == job.id
        ));
    }
}
