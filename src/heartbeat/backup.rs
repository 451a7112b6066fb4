//! Encrypted database snapshots with generational rotation.
//!
//! Each snapshot takes a consistent copy of every database via
//! `VACUUM INTO` (pure SQL, no subprocess), seals it with AES-256-GCM,
//! and writes `backup-<timestamp>/<name>.backup.enc`. Rotation keeps the
//! newest N daily snapshots, one per distinct ISO week after that, and
//! one per distinct month after those. Restore decrypts next to the live
//! files, keeps a safety copy of what it overwrites, and replaces each
//! file atomically via rename.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::config::BackupConfig;
use crate::crypto::{self, KdfKind, SealKey};
use crate::store::{Store, DB_NAMES};

/// Directory-name timestamp format for snapshots.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H%M%SZ";

/// Result of one snapshot.
#[derive(Debug)]
pub struct SnapshotOutcome {
    /// Directory the snapshot was written to.
    pub snapshot_dir: PathBuf,
    /// Databases captured.
    pub databases: Vec<String>,
    /// Total encrypted bytes written.
    pub total_bytes: u64,
}

/// Result of one rotation pass.
#[derive(Debug, Default)]
pub struct RotationOutcome {
    /// Snapshot directories kept.
    pub kept: Vec<PathBuf>,
    /// Snapshot directories deleted.
    pub removed: Vec<PathBuf>,
}

/// Load (or create on first use) the Argon2id salt for backups.
///
/// The SHA-256 device tier is saltless; this is only consulted for
/// [`KdfKind::Argon2id`].
pub fn backup_key(data_dir: &Path, config: &BackupConfig) -> anyhow::Result<SealKey> {
    let password = config
        .password
        .as_deref()
        .context("no backup password configured (MERIDIAN_BACKUP_PASSWORD)")?;

    let salt = match config.kdf {
        KdfKind::Sha256 => Vec::new(),
        KdfKind::Argon2id => {
            let salt_path = data_dir.join("backup.salt");
            match std::fs::read(&salt_path) {
                Ok(salt) => salt,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    let salt = crypto::generate_salt().to_vec();
                    std::fs::create_dir_all(data_dir)?;
                    std::fs::write(&salt_path, &salt)
                        .with_context(|| format!("writing {}", salt_path.display()))?;
                    salt
                }
                Err(e) => return Err(e).context("reading backup salt"),
            }
        }
    };

    crypto::derive_key(password, &salt, config.kdf).context("deriving backup key")
}

/// Snapshot every database into a fresh timestamped directory.
pub async fn create_snapshot(
    store: &Store,
    backups_dir: &Path,
    key: &SealKey,
) -> anyhow::Result<SnapshotOutcome> {
    let timestamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
    let snapshot_dir = backups_dir.join(format!("backup-{timestamp}"));
    tokio::fs::create_dir_all(&snapshot_dir)
        .await
        .context("failed to create snapshot directory")?;

    info!(dir = %snapshot_dir.display(), "creating encrypted snapshot");

    let mut databases = Vec::new();
    let mut total_bytes = 0u64;

    for (name, pool) in store.pools() {
        let plain_path = snapshot_dir.join(format!("{name}.db.tmp"));
        vacuum_into(pool, &plain_path).await?;

        let plaintext = tokio::fs::read(&plain_path)
            .await
            .with_context(|| format!("reading vacuumed copy of {name}"))?;
        tokio::fs::remove_file(&plain_path).await.ok();

        let sealed =
            crypto::seal(key, &plaintext).with_context(|| format!("encrypting {name}"))?;
        let out_path = snapshot_dir.join(format!("{name}.backup.enc"));
        tokio::fs::write(&out_path, &sealed)
            .await
            .with_context(|| format!("writing {}", out_path.display()))?;

        total_bytes = total_bytes.saturating_add(sealed.len() as u64);
        debug!(db = name, bytes = sealed.len(), "database sealed");
        databases.push(name.to_owned());
    }

    info!(
        dir = %snapshot_dir.display(),
        databases = databases.len(),
        bytes = total_bytes,
        "snapshot complete"
    );
    Ok(SnapshotOutcome {
        snapshot_dir,
        databases,
        total_bytes,
    })
}

/// Apply generational rotation under `backups_dir`.
///
/// Keeps the newest `daily_count` snapshots; from the remainder, the
/// newest per distinct ISO week up to `weekly_count`; from what is left,
/// the newest per distinct month up to `monthly_count`. Everything else
/// is deleted.
pub fn rotate(backups_dir: &Path, config: &BackupConfig) -> anyhow::Result<RotationOutcome> {
    let mut snapshots: Vec<(NaiveDateTime, PathBuf)> = Vec::new();
    let entries = match std::fs::read_dir(backups_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(RotationOutcome::default())
        }
        Err(e) => return Err(e).context("listing backups directory"),
    };
    for entry in entries {
        let entry = entry.context("reading backups directory entry")?;
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(timestamp) = parse_snapshot_name(&name) {
            snapshots.push((timestamp, entry.path()));
        }
    }
    snapshots.sort_by(|a, b| b.0.cmp(&a.0)); // Newest first.

    let mut outcome = RotationOutcome::default();
    let mut weeks_kept: Vec<(i32, u32)> = Vec::new();
    let mut months_kept: Vec<(i32, u32)> = Vec::new();

    for (index, (timestamp, path)) in snapshots.iter().enumerate() {
        if index < config.daily_count {
            outcome.kept.push(path.clone());
            continue;
        }

        let iso = timestamp.date().iso_week();
        let week_key = (iso.year(), iso.week());
        if weeks_kept.len() < config.weekly_count && !weeks_kept.contains(&week_key) {
            weeks_kept.push(week_key);
            outcome.kept.push(path.clone());
            continue;
        }

        let month_key = (timestamp.date().year(), timestamp.date().month());
        if months_kept.len() < config.monthly_count && !months_kept.contains(&month_key) {
            months_kept.push(month_key);
            outcome.kept.push(path.clone());
            continue;
        }

        outcome.removed.push(path.clone());
    }

    for path in &outcome.removed {
        if let Err(e) = std::fs::remove_dir_all(path) {
            warn!(dir = %path.display(), error = %e, "failed to remove rotated snapshot");
        }
    }

    info!(
        kept = outcome.kept.len(),
        removed = outcome.removed.len(),
        "rotation complete"
    );
    Ok(outcome)
}

/// Restore every database found in `snapshot_dir` into `data_dir`.
///
/// The current file, if any, is first copied aside as
/// `<name>.db.pre-restore`; the decrypted bytes then land via a temp
/// file and an atomic rename, so each file either fully restores or is
/// left untouched.
pub async fn restore(
    snapshot_dir: &Path,
    data_dir: &Path,
    key: &SealKey,
) -> anyhow::Result<Vec<String>> {
    tokio::fs::create_dir_all(data_dir)
        .await
        .context("creating data directory")?;
    let mut restored = Vec::new();

    for name in DB_NAMES {
        let sealed_path = snapshot_dir.join(format!("{name}.backup.enc"));
        let sealed = match tokio::fs::read(&sealed_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(db = name, "not present in snapshot, skipping");
                continue;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", sealed_path.display()))
            }
        };

        let plaintext = crypto::open(key, &sealed)
            .with_context(|| format!("decrypting {name} (wrong password?)"))?;

        let target = data_dir.join(format!("{name}.db"));
        if target.exists() {
            let safety = data_dir.join(format!("{name}.db.pre-restore"));
            tokio::fs::copy(&target, &safety)
                .await
                .with_context(|| format!("writing safety copy {}", safety.display()))?;
        }

        let temp = data_dir.join(format!("{name}.db.restoring"));
        tokio::fs::write(&temp, &plaintext)
            .await
            .with_context(|| format!("writing {}", temp.display()))?;
        tokio::fs::rename(&temp, &target)
            .await
            .with_context(|| format!("renaming into {}", target.display()))?;

        info!(db = name, "database restored");
        restored.push(name.to_owned());
    }

    Ok(restored)
}

/// Parse `backup-<timestamp>` directory names. Accepts the full format
/// and a bare `YYYY-MM-DD` date.
pub fn parse_snapshot_name(name: &str) -> Option<NaiveDateTime> {
    let raw = name.strip_prefix("backup-")?;
    if let Ok(full) = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT) {
        return Some(full);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(|date| NaiveDateTime::new(date, NaiveTime::MIN))
}

/// Consistent SQLite snapshot via VACUUM INTO — pure SQL, no subprocess.
async fn vacuum_into(pool: &SqlitePool, destination: &Path) -> anyhow::Result<()> {
    let dest_str = destination
        .to_str()
        .context("snapshot path is not valid UTF-8")?;

    // VACUUM INTO cannot be parameterized, so the path is validated
    // before interpolation. It is always internally generated
    // (backups_dir + timestamp), never user-controlled.
    anyhow::ensure!(
        dest_str
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '/' | '\\' | ':' | '.' | '-' | '_' | ' ')),
        "snapshot path contains disallowed characters"
    );

    let query = format!("VACUUM INTO '{dest_str}'");
    sqlx::raw_sql(&query)
        .execute(pool)
        .await
        .context("VACUUM INTO failed")?;
    Ok(())
}

/// Next fire time strictly after `last` for a cron expression, if the
/// expression parses.
pub fn cron_due(expression: &str, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    use std::str::FromStr;
    match cron::Schedule::from_str(expression) {
        Ok(schedule) => schedule.after(&last).take(1).any(|next| next <= now),
        Err(e) => {
            warn!(cron = expression, error = %e, "invalid cron expression");
            false
        }
    }
}
