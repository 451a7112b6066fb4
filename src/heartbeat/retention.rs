//! Time-based data retention.
//!
//! Periodically archives conversations and episodic memory past their
//! retention windows and deletes completed execution-log rows past
//! theirs. The sweep is idempotent — already-archived rows are untouched
//! by rerunning — and each category is isolated: a failure in one is
//! logged and does not stop the others.

use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::config::RetentionConfig;
use crate::store::Store;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionOutcome {
    /// Conversations newly marked archived.
    pub conversations_archived: u64,
    /// Episodes newly marked archived.
    pub episodes_archived: u64,
    /// Completed execution-log rows deleted.
    pub executions_deleted: u64,
}

/// Run one retention sweep.
pub async fn sweep(store: &Store, config: &RetentionConfig) -> RetentionOutcome {
    let now = Utc::now();
    let mut outcome = RetentionOutcome::default();

    let cutoff = |days: i64| {
        now.checked_sub_signed(Duration::days(days))
            .unwrap_or(now)
            .to_rfc3339()
    };

    match sqlx::query(
        "UPDATE conversations SET archived_at = ?1
         WHERE archived_at IS NULL AND updated_at < ?2",
    )
    .bind(now.to_rfc3339())
    .bind(cutoff(config.conversation_days))
    .execute(store.meridian())
    .await
    {
        Ok(result) => outcome.conversations_archived = result.rows_affected(),
        Err(e) => warn!(error = %e, "conversation retention failed"),
    }

    match sqlx::query(
        "UPDATE episodes SET archived_at = ?1
         WHERE archived_at IS NULL AND created_at < ?2",
    )
    .bind(now.to_rfc3339())
    .bind(cutoff(config.episodic_days))
    .execute(store.journal())
    .await
    {
        Ok(result) => outcome.episodes_archived = result.rows_affected(),
        Err(e) => warn!(error = %e, "episodic retention failed"),
    }

    match sqlx::query(
        "DELETE FROM executions WHERE status = 'completed' AND completed_at < ?1",
    )
    .bind(cutoff(config.execution_log_days))
    .execute(store.meridian())
    .await
    {
        Ok(result) => outcome.executions_deleted = result.rows_affected(),
        Err(e) => warn!(error = %e, "execution log retention failed"),
    }

    info!(
        conversations = outcome.conversations_archived,
        episodes = outcome.episodes_archived,
        executions = outcome.executions_deleted,
        "retention sweep complete"
    );
    outcome
}
