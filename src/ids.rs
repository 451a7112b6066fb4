//! Identifiers and canonical encoding.
//!
//! Everything that needs a stable byte representation lives here: v4 ids
//! for jobs and envelopes, canonical JSON (sorted keys, no whitespace) for
//! the audit hash chain, and the deterministic per-(job, step) execution id
//! used by the idempotency log.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Allocate a fresh v4 identifier.
pub fn new_id() -> Uuid {
    Uuid::new_v4()
}

/// SHA-256 over raw bytes, hex-encoded.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Deterministic execution id for one step of one job.
///
/// `sha256(job_id ∥ "::" ∥ step_id)`, hex-encoded. The same (job, step)
/// pair always maps to the same id, so a re-run after a crash lands on the
/// row the previous attempt left behind.
pub fn execution_id(job_id: Uuid, step_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_id.to_string().as_bytes());
    hasher.update(b"::");
    hasher.update(step_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialize a JSON value canonically: object keys sorted, no whitespace.
///
/// Arrays keep their order; only object key order is normalized. This is
/// the form hashed into the audit chain, so two semantically equal entries
/// always produce the same digest.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// SHA-256 of the canonical JSON form, hex-encoded.
pub fn canonical_hash(value: &serde_json::Value) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Keys are plain strings; reuse serde_json's escaping.
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
