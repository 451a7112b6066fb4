//! Idempotency log — SHA-based deduplication of step executions.
//!
//! Each (job, step) pair maps to a deterministic execution id. Before a
//! step runs, [`ExecutionLog::check`] consults the row for that id:
//! `completed` rows short-circuit with the cached result; `started` and
//! `failed` rows are resumable and get their clock reset. A process killed
//! between `check` and `record_completion` leaves a `started` row behind,
//! which the next attempt picks up under the same id — `completed` is the
//! only terminal state for an execution id, so user-visible side effects
//! settle at most once per step.

use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::ids::execution_id;

/// Execution log failures.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// Database error.
    #[error("execution log database error: {0}")]
    Database(String),
    /// A persisted result failed to decode.
    #[error("corrupt execution row {execution_id}: {message}")]
    Corrupt {
        /// Row key.
        execution_id: String,
        /// Decode failure detail.
        message: String,
    },
}

impl From<sqlx::Error> for IdempotencyError {
    fn from(e: sqlx::Error) -> Self {
        IdempotencyError::Database(e.to_string())
    }
}

/// Decision returned by [`ExecutionLog::check`].
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyOutcome {
    /// The step must run; a `started` row now marks it in flight.
    Execute {
        /// Deterministic row key for the follow-up record call.
        execution_id: String,
    },
    /// The step already completed; use the stored result.
    Cached {
        /// Deterministic row key.
        execution_id: String,
        /// Result recorded at completion (empty object if none).
        result: serde_json::Value,
    },
}

impl IdempotencyOutcome {
    /// The execution id regardless of variant.
    pub fn execution_id(&self) -> &str {
        match self {
            Self::Execute { execution_id } | Self::Cached { execution_id, .. } => execution_id,
        }
    }
}

/// The per-(job, step) execution log.
pub struct ExecutionLog {
    pool: SqlitePool,
}

impl ExecutionLog {
    /// Build a log over the core database.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Decide whether a step must run or can be served from cache.
    ///
    /// Decision table, keyed on the current row for the execution id:
    ///
    /// | row       | outcome   | side effect                              |
    /// |-----------|-----------|------------------------------------------|
    /// | none      | `Execute` | insert `started` with now                |
    /// | `started` | `Execute` | reset `started_at`, clear `completed_at` |
    /// | `failed`  | `Execute` | same reset                               |
    /// | `completed` | `Cached` | none                                    |
    pub async fn check(
        &self,
        job_id: Uuid,
        step_id: &str,
    ) -> Result<IdempotencyOutcome, IdempotencyError> {
        let exec_id = execution_id(job_id, step_id);
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;

        let row: Option<(String, Option<String>)> = sqlx::query_as(
            "SELECT status, result FROM executions WHERE execution_id = ?1",
        )
        .bind(&exec_id)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match row {
            None => {
                sqlx::query(
                    "INSERT INTO executions (execution_id, job_id, step_id, status, started_at)
                     VALUES (?1, ?2, ?3, 'started', ?4)",
                )
                .bind(&exec_id)
                .bind(job_id.to_string())
                .bind(step_id)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                IdempotencyOutcome::Execute {
                    execution_id: exec_id,
                }
            }
            Some((status, result)) if status == "completed" => {
                let result = match result {
                    Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                        IdempotencyError::Corrupt {
                            execution_id: exec_id.clone(),
                            message: e.to_string(),
                        }
                    })?,
                    None => serde_json::json!({}),
                };
                debug!(execution_id = %exec_id, "serving cached step result");
                IdempotencyOutcome::Cached {
                    execution_id: exec_id,
                    result,
                }
            }
            // `started` (stale by any age) or `failed`: resumable.
            Some(_) => {
                sqlx::query(
                    "UPDATE executions SET status = 'started', started_at = ?2,
                            completed_at = NULL
                     WHERE execution_id = ?1",
                )
                .bind(&exec_id)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                IdempotencyOutcome::Execute {
                    execution_id: exec_id,
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Record a successful completion with its result.
    pub async fn record_completion(
        &self,
        execution_id: &str,
        result: &serde_json::Value,
    ) -> Result<(), IdempotencyError> {
        sqlx::query(
            "UPDATE executions SET status = 'completed', completed_at = ?2, result = ?3
             WHERE execution_id = ?1",
        )
        .bind(execution_id)
        .bind(Utc::now().to_rfc3339())
        .bind(result.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failure, clearing any stale result.
    pub async fn record_failure(&self, execution_id: &str) -> Result<(), IdempotencyError> {
        sqlx::query(
            "UPDATE executions SET status = 'failed', completed_at = ?2, result = NULL
             WHERE execution_id = ?1",
        )
        .bind(execution_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
