//! Approval coordinator — nonce-gated user confirmation.
//!
//! When validation demands the user, the job parks at `awaiting_approval`
//! and a 32-byte random nonce is persisted against it; the broadcast
//! `approval_required` event carries the plan, the risky steps, and the
//! nonce. Approving requires echoing that nonce: it is bound to exactly
//! one job, accepted at most once, and expires after its TTL. Rejecting is
//! an out-of-band user choice and needs no nonce.
//!
//! Standing rules can short-circuit the prompt entirely: a plan whose
//! every step is covered by an approve rule (and none by a deny) moves
//! `validating → executing` without parking. The frequency suggester
//! counts approvals per action category in memory and emits a one-shot
//! suggestion when a category keeps coming back.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::axis::queue::{JobPatch, JobQueue, QueueError};
use crate::axis::router::{Envelope, MessageRouter};
use crate::axis::rules::{RuleError, StandingRules};
use crate::config::ApprovalConfig;
use crate::types::{ErrorKind, Event, ExecutionPlan, Job, JobStatus, ValidationResult, Verdict};

/// Approval failures.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// The nonce does not match the one issued for this job.
    #[error("invalid nonce for job {0}")]
    InvalidNonce(Uuid),
    /// The nonce was already consumed.
    #[error("nonce already consumed for job {0}")]
    NonceConsumed(Uuid),
    /// The nonce's TTL elapsed.
    #[error("nonce expired for job {0}")]
    NonceExpired(Uuid),
    /// Queue refused the gating transition.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// Standing rule evaluation failed.
    #[error(transparent)]
    Rules(#[from] RuleError),
    /// Database error.
    #[error("approval database error: {0}")]
    Database(String),
}

impl ApprovalError {
    /// Machine-readable kind for surfaces.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidNonce(_) => ErrorKind::InvalidNonce,
            Self::NonceConsumed(_) => ErrorKind::NonceConsumed,
            Self::NonceExpired(_) => ErrorKind::NonceExpired,
            Self::Queue(e) => e.kind(),
            _ => ErrorKind::HandlerError,
        }
    }
}

impl From<sqlx::Error> for ApprovalError {
    fn from(e: sqlx::Error) -> Self {
        ApprovalError::Database(e.to_string())
    }
}

/// Outcome of gating a validated plan.
#[derive(Debug)]
pub enum GateOutcome {
    /// Standing rules pre-approved every step; the job is `executing`.
    Bypassed(Job),
    /// The job parked at `awaiting_approval` pending the user.
    Parked {
        /// Nonce the confirmation must echo.
        nonce: String,
    },
}

/// The approval coordinator.
pub struct ApprovalCoordinator {
    pool: SqlitePool,
    queue: Arc<JobQueue>,
    router: Arc<MessageRouter>,
    rules: Arc<StandingRules>,
    config: ApprovalConfig,
    // Suggestion counters are in-memory only; a restart re-learns.
    counters: Mutex<HashMap<String, u32>>,
}

impl ApprovalCoordinator {
    /// Build a coordinator over the core database.
    pub fn new(
        pool: SqlitePool,
        queue: Arc<JobQueue>,
        router: Arc<MessageRouter>,
        rules: Arc<StandingRules>,
        config: ApprovalConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            router,
            rules,
            config,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Gate a plan whose validation demands the user.
    ///
    /// Either bypasses via standing rules (`validating → executing`) or
    /// parks the job (`validating → awaiting_approval`), persisting a
    /// nonce and broadcasting `approval_required`.
    pub async fn gate(
        &self,
        job: &Job,
        plan: &ExecutionPlan,
        validation: &ValidationResult,
    ) -> Result<GateOutcome, ApprovalError> {
        if self.rules.plan_bypasses_approval(plan).await? {
            info!(job_id = %job.id, "standing rules bypassed approval");
            let job = self
                .queue
                .transition(
                    job.id,
                    JobStatus::Validating,
                    JobStatus::Executing,
                    JobPatch {
                        validation: Some(validation.clone()),
                        ..JobPatch::default()
                    },
                )
                .await?;
            return Ok(GateOutcome::Bypassed(job));
        }

        self.queue
            .transition(
                job.id,
                JobStatus::Validating,
                JobStatus::AwaitingApproval,
                JobPatch {
                    validation: Some(validation.clone()),
                    ..JobPatch::default()
                },
            )
            .await?;

        let nonce = self.issue_nonce(job.id).await?;

        let risks = validation
            .step_results
            .iter()
            .filter(|r| r.verdict != Verdict::Approved)
            .cloned()
            .collect();
        self.router.broadcast(Event::ApprovalRequired {
            job_id: job.id,
            plan: plan.clone(),
            risks,
            nonce: nonce.clone(),
        });

        info!(job_id = %job.id, "job parked awaiting approval");
        Ok(GateOutcome::Parked { nonce })
    }

    /// Approve a parked job with the nonce from `approval_required`.
    ///
    /// Verifies, consumes, and advances `awaiting_approval → executing`,
    /// then routes an `execute.request` to the executor component so no
    /// worker is held across the user's think time.
    pub async fn approve(&self, job_id: Uuid, nonce: &str) -> Result<Job, ApprovalError> {
        self.consume_nonce(job_id, nonce).await?;

        let job = self
            .queue
            .transition(
                job_id,
                JobStatus::AwaitingApproval,
                JobStatus::Executing,
                JobPatch::default(),
            )
            .await?;

        self.note_approval(&job);

        let request = Envelope::request(
            "approval",
            "executor",
            "execute.request",
            serde_json::json!({"job_id": job_id}),
        )
        .with_job(job_id);
        let response = self.router.dispatch(request).await;
        if let Some(code) = response.error_code() {
            warn!(job_id = %job_id, code, "executor did not accept the approved job");
        }

        Ok(job)
    }

    /// Reject a parked job. No nonce required: rejection is an
    /// out-of-band user choice, only escalation needs the token.
    pub async fn reject(&self, job_id: Uuid, reason: Option<&str>) -> Result<Job, ApprovalError> {
        let reason = reason.unwrap_or("rejected by user");
        let job = self
            .queue
            .transition(
                job_id,
                JobStatus::AwaitingApproval,
                JobStatus::Rejected,
                JobPatch {
                    result: Some(serde_json::json!({"rejected": true, "reason": reason})),
                    ..JobPatch::default()
                },
            )
            .await?;
        info!(job_id = %job_id, reason, "job rejected");
        Ok(job)
    }

    /// Delete expired, unconsumed nonces. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> Result<u64, ApprovalError> {
        let removed = sqlx::query(
            "DELETE FROM approval_nonces WHERE consumed_at IS NULL AND expires_at < ?1",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if removed > 0 {
            info!(removed, "expired approval nonces removed");
        }
        Ok(removed)
    }

    async fn issue_nonce(&self, job_id: Uuid) -> Result<String, ApprovalError> {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let value = hex::encode(bytes);

        let now = Utc::now();
        let expires = now
            .checked_add_signed(Duration::hours(self.config.nonce_ttl_hours))
            .unwrap_or(now);

        sqlx::query(
            "INSERT INTO approval_nonces (value, job_id, issued_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&value)
        .bind(job_id.to_string())
        .bind(now.to_rfc3339())
        .bind(expires.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(value)
    }

    async fn consume_nonce(&self, job_id: Uuid, nonce: &str) -> Result<(), ApprovalError> {
        let row: Option<(String, Option<String>, String)> = sqlx::query_as(
            "SELECT job_id, consumed_at, expires_at FROM approval_nonces WHERE value = ?1",
        )
        .bind(nonce)
        .fetch_optional(&self.pool)
        .await?;

        let Some((bound_job, consumed_at, expires_at)) = row else {
            return Err(ApprovalError::InvalidNonce(job_id));
        };
        if bound_job != job_id.to_string() {
            return Err(ApprovalError::InvalidNonce(job_id));
        }
        if consumed_at.is_some() {
            return Err(ApprovalError::NonceConsumed(job_id));
        }
        let expires = DateTime::parse_from_rfc3339(&expires_at)
            .map_err(|e| ApprovalError::Database(format!("bad expiry: {e}")))?
            .with_timezone(&Utc);
        if expires < Utc::now() {
            return Err(ApprovalError::NonceExpired(job_id));
        }

        // Compare-and-set on the unconsumed row closes the replay window.
        let consumed = sqlx::query(
            "UPDATE approval_nonces SET consumed_at = ?2
             WHERE value = ?1 AND consumed_at IS NULL",
        )
        .bind(nonce)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if consumed != 1 {
            return Err(ApprovalError::NonceConsumed(job_id));
        }
        Ok(())
    }

    /// Count an approval per action category (the prefix before `:`) and
    /// emit a one-shot standing-rule suggestion at the threshold.
    fn note_approval(&self, job: &Job) {
        let Some(plan) = &job.plan else {
            return;
        };
        let categories: BTreeSet<String> =
            plan.steps.iter().map(|s| s.gear.clone()).collect();

        let mut counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for category in categories {
            let count = counters.entry(category.clone()).or_insert(0);
            *count = count.saturating_add(1);
            if *count >= self.config.suggestion_threshold {
                let fired = *count;
                *count = 0;
                info!(category = %category, count = fired, "suggesting a standing rule");
                self.router.broadcast(Event::RuleSuggestion {
                    category,
                    count: fired,
                });
            }
        }
    }
}
