//! Hash-chained audit trail.
//!
//! Every privileged action is appended as a row whose hash covers the
//! previous row's hash plus the canonical JSON of the entry itself, so any
//! later mutation of history breaks the chain. The writer holds an
//! exclusive lock while appending; readers snapshot by sequence number.
//!
//! Secrets never reach this module: the router records payload *hashes*,
//! not payload bodies.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::ids::{canonical_json, sha256_hex};

/// Hash of the empty chain head.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Audit failures.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Database error.
    #[error("audit database error: {0}")]
    Database(String),
    /// A recomputed hash did not match the stored one.
    #[error("audit chain broken at seq {seq}")]
    ChainBroken {
        /// First sequence number whose hash diverges.
        seq: i64,
    },
}

impl From<sqlx::Error> for AuditError {
    fn from(e: sqlx::Error) -> Self {
        AuditError::Database(e.to_string())
    }
}

/// A fully formed, persisted audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic sequence number.
    pub seq: i64,
    /// When the entry was appended.
    pub timestamp: DateTime<Utc>,
    /// Who performed the action ("router", "queue", "user", ...).
    pub actor: String,
    /// What was done ("message.dispatch", "job.transition", ...).
    pub action: String,
    /// What it was done to (component id, job id, ...).
    pub target: String,
    /// Structured detail. Payload hashes, never payload bodies.
    pub payload: serde_json::Value,
    /// Hash of the previous entry.
    pub prev_hash: String,
    /// Hash over `prev_hash ∥ canonical(entry-without-hash)`.
    pub hash: String,
}

/// Sink for audit entries.
#[async_trait]
pub trait AuditWriter: Send + Sync {
    /// Append one entry.
    async fn append(
        &self,
        actor: &str,
        action: &str,
        target: &str,
        payload: serde_json::Value,
    ) -> Result<(), AuditError>;
}

/// Discards every entry. For tests and ephemeral runs.
pub struct NoOpAuditWriter;

#[async_trait]
impl AuditWriter for NoOpAuditWriter {
    async fn append(
        &self,
        _actor: &str,
        _action: &str,
        _target: &str,
        _payload: serde_json::Value,
    ) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Audit trail persisted in the core database.
pub struct AuditTrail {
    pool: SqlitePool,
    // Appends must be serialized so each entry chains off the true head.
    write_lock: Mutex<()>,
}

impl AuditTrail {
    /// Create a trail over the core database pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    /// Read all entries with `seq > after_seq`, in order.
    pub async fn entries_since(&self, after_seq: i64) -> Result<Vec<AuditEntry>, AuditError> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            "SELECT seq, timestamp, actor, action, target, payload, prev_hash, hash
             FROM audit_log WHERE seq > ?1 ORDER BY seq ASC",
        )
        .bind(after_seq)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_into_entry).collect()
    }

    /// Walk the whole chain, recomputing every hash.
    ///
    /// Returns the number of verified entries, or the first sequence
    /// number at which the chain diverges.
    pub async fn verify(&self) -> Result<i64, AuditError> {
        let entries = self.entries_since(0).await?;
        let mut prev_hash = GENESIS_HASH.to_owned();
        let mut verified = 0i64;

        for entry in entries {
            let expected = entry_hash(&entry, &prev_hash);
            if entry.prev_hash != prev_hash || entry.hash != expected {
                return Err(AuditError::ChainBroken { seq: entry.seq });
            }
            prev_hash = entry.hash;
            verified = verified.saturating_add(1);
        }
        Ok(verified)
    }
}

#[async_trait]
impl AuditWriter for AuditTrail {
    async fn append(
        &self,
        actor: &str,
        action: &str,
        target: &str,
        payload: serde_json::Value,
    ) -> Result<(), AuditError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let head: Option<(i64, String)> =
            sqlx::query_as("SELECT seq, hash FROM audit_log ORDER BY seq DESC LIMIT 1")
                .fetch_optional(&mut *tx)
                .await?;
        let (prev_seq, prev_hash) = head.unwrap_or((0, GENESIS_HASH.to_owned()));

        let entry = AuditEntry {
            seq: prev_seq.saturating_add(1),
            timestamp: Utc::now(),
            actor: actor.to_owned(),
            action: action.to_owned(),
            target: target.to_owned(),
            payload,
            prev_hash: prev_hash.clone(),
            hash: String::new(),
        };
        let hash = entry_hash(&entry, &prev_hash);

        sqlx::query(
            "INSERT INTO audit_log (seq, timestamp, actor, action, target, payload, prev_hash, hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(entry.seq)
        .bind(entry.timestamp.to_rfc3339())
        .bind(&entry.actor)
        .bind(&entry.action)
        .bind(&entry.target)
        .bind(canonical_json(&entry.payload))
        .bind(&entry.prev_hash)
        .bind(&hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

/// `SHA-256(prev_hash ∥ canonical_json(entry-without-hash))`.
fn entry_hash(entry: &AuditEntry, prev_hash: &str) -> String {
    let without_hash = serde_json::json!({
        "seq": entry.seq,
        "timestamp": entry.timestamp.to_rfc3339(),
        "actor": entry.actor,
        "action": entry.action,
        "target": entry.target,
        "payload": entry.payload,
        "prev_hash": prev_hash,
    });
    let mut bytes = Vec::new();
    bytes.extend_from_slice(prev_hash.as_bytes());
    bytes.extend_from_slice(canonical_json(&without_hash).as_bytes());
    sha256_hex(&bytes)
}

type AuditRow = (i64, String, String, String, String, String, String, String);

fn row_into_entry(row: AuditRow) -> Result<AuditEntry, AuditError> {
    let (seq, timestamp, actor, action, target, payload, prev_hash, hash) = row;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| AuditError::Database(format!("bad timestamp on seq {seq}: {e}")))?
        .with_timezone(&Utc);
    let payload = serde_json::from_str(&payload)
        .map_err(|e| AuditError::Database(format!("bad payload on seq {seq}: {e}")))?;
    Ok(AuditEntry {
        seq,
        timestamp,
        actor,
        action,
        target,
        payload,
        prev_hash,
        hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    async fn make_trail() -> (Store, AuditTrail) {
        let store = Store::open_in_memory().await.expect("store");
        let trail = AuditTrail::new(store.meridian().clone());
        (store, trail)
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let (_store, trail) = make_trail().await;
        trail
            .append("router", "message.dispatch", "scout", serde_json::json!({"h": "abc"}))
            .await
            .expect("append");

        let entries = trail.entries_since(0).await.expect("read");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seq, 1);
        assert_eq!(entries[0].actor, "router");
        assert_eq!(entries[0].prev_hash, GENESIS_HASH);
    }

    #[tokio::test]
    async fn test_chain_links() {
        let (_store, trail) = make_trail().await;
        for i in 0..3 {
            trail
                .append("queue", "job.transition", "job-1", serde_json::json!({"i": i}))
                .await
                .expect("append");
        }
        let entries = trail.entries_since(0).await.expect("read");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].prev_hash, entries[0].hash);
        assert_eq!(entries[2].prev_hash, entries[1].hash);
    }

    #[tokio::test]
    async fn test_verify_clean_chain() {
        let (_store, trail) = make_trail().await;
        for i in 0..5 {
            trail
                .append("queue", "job.transition", "job-1", serde_json::json!({"i": i}))
                .await
                .expect("append");
        }
        assert_eq!(trail.verify().await.expect("verify"), 5);
    }

    #[tokio::test]
    async fn test_verify_detects_tampering() {
        let (store, trail) = make_trail().await;
        for i in 0..3 {
            trail
                .append("queue", "job.transition", "job-1", serde_json::json!({"i": i}))
                .await
                .expect("append");
        }
        // Rewrite history behind the trail's back.
        sqlx::query("UPDATE audit_log SET actor = 'intruder' WHERE seq = 2")
            .execute(store.meridian())
            .await
            .expect("tamper");

        let result = trail.verify().await;
        assert!(matches!(result, Err(AuditError::ChainBroken { seq: 2 })));
    }

    #[tokio::test]
    async fn test_entries_since_snapshot() {
        let (_store, trail) = make_trail().await;
        for i in 0..4 {
            trail
                .append("queue", "job.transition", "job-1", serde_json::json!({"i": i}))
                .await
                .expect("append");
        }
        let tail = trail.entries_since(2).await.expect("read");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 3);
    }

    #[tokio::test]
    async fn test_noop_writer() {
        let writer = NoOpAuditWriter;
        writer
            .append("x", "y", "z", serde_json::json!({}))
            .await
            .expect("noop append");
    }
}
