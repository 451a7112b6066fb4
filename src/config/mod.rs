//! Configuration loading and management.
//!
//! Loads runtime configuration from `./meridian.toml` (or
//! `$MERIDIAN_CONFIG_PATH`). Environment variables override file values;
//! file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::crypto::KdfKind;

// ── Top-level config ────────────────────────────────────────────

/// Top-level runtime configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MeridianConfig {
    /// Filesystem paths for persistent state.
    pub paths: PathsConfig,
    /// Job queue settings.
    pub queue: QueueConfig,
    /// Worker pool settings.
    pub workers: WorkerConfig,
    /// Message router settings.
    pub router: RouterConfig,
    /// Phase and step budgets.
    pub timeouts: TimeoutConfig,
    /// Plan execution settings.
    pub dag: DagConfig,
    /// Approval coordinator settings.
    pub approval: ApprovalConfig,
    /// Plan validator policy.
    pub sentinel: SentinelConfig,
    /// Per-gear circuit breaker settings.
    pub breaker: BreakerConfig,
    /// Data retention settings.
    pub retention: RetentionConfig,
    /// Encrypted backup settings.
    pub backup: BackupConfig,
    /// Resource backpressure thresholds.
    pub backpressure: BackpressureConfig,
}

impl MeridianConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$MERIDIAN_CONFIG_PATH` or `./meridian.toml`.
    /// A missing file is not an error; defaults apply.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from the TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path();
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: MeridianConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(MeridianConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve the config file path.
    fn config_path() -> PathBuf {
        std::env::var("MERIDIAN_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("meridian.toml"))
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability.
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("MERIDIAN_DATA_DIR") {
            // Rebasing the data dir moves its satellite directories too.
            let base = PathBuf::from(v);
            self.paths.logs_dir = base.join("logs");
            self.paths.backups_dir = base.join("backups");
            self.paths.workspace_root = base.join("workspace");
            self.paths.data_dir = base;
        }
        if let Some(v) = env("MERIDIAN_WORKSPACE_ROOT") {
            self.paths.workspace_root = PathBuf::from(v);
        }
        if let Some(v) = env("MERIDIAN_POOL_SIZE") {
            match v.parse() {
                Ok(n) => self.workers.pool_size = Some(n),
                Err(_) => tracing::warn!(
                    var = "MERIDIAN_POOL_SIZE",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("MERIDIAN_BACKUP_PASSWORD") {
            self.backup.password = Some(v);
        }
        if let Some(v) = env("MERIDIAN_JOB_TIMEOUT_MS") {
            match v.parse() {
                Ok(n) => self.timeouts.job_ms = n,
                Err(_) => tracing::warn!(
                    var = "MERIDIAN_JOB_TIMEOUT_MS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Parse a TOML string into config (for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: MeridianConfig =
            toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }
}

// ── Paths ───────────────────────────────────────────────────────

/// Filesystem layout for persistent state.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding the databases and the backup salt.
    pub data_dir: PathBuf,
    /// Directory for rotated JSON log files.
    pub logs_dir: PathBuf,
    /// Directory snapshots are written under.
    pub backups_dir: PathBuf,
    /// Root the validator confines filesystem actions to.
    pub workspace_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = directories::ProjectDirs::from("", "", "meridian")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".meridian"));
        Self {
            logs_dir: base.join("logs"),
            backups_dir: base.join("backups"),
            workspace_root: base.join("workspace"),
            data_dir: base,
        }
    }
}

// ── Queue ───────────────────────────────────────────────────────

/// Job queue settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How often idle workers poll for claims, in milliseconds.
    pub poll_interval_ms: u64,
    /// Recovery attempts before a job is failed outright.
    pub max_attempts: u32,
    /// Validator-driven plan revisions before giving up.
    pub max_revision_count: u32,
    /// Execution-driven replans before giving up.
    pub max_replan_count: u32,
    /// Age after which an in-flight row is considered orphaned at startup.
    pub recovery_grace_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_attempts: 3,
            max_revision_count: 2,
            max_replan_count: 2,
            recovery_grace_secs: 60,
        }
    }
}

// ── Workers ─────────────────────────────────────────────────────

/// Device tier; picks the default worker pool size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTier {
    /// Low-power boxes: 2 workers, SHA-256 backup key derivation.
    Lite,
    /// Default: 4 workers.
    Standard,
    /// Workstations: 8 workers.
    Performance,
}

impl DeviceTier {
    /// Default worker pool size for the tier.
    pub fn pool_size(self) -> usize {
        match self {
            Self::Lite => 2,
            Self::Standard => 4,
            Self::Performance => 8,
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Device tier; picks the default pool size.
    pub tier: DeviceTier,
    /// Explicit pool size override.
    pub pool_size: Option<usize>,
    /// How long `stop()` waits for in-flight jobs before force-cancelling.
    pub graceful_shutdown_timeout_ms: u64,
}

impl WorkerConfig {
    /// Effective pool size: explicit override or the tier default.
    pub fn effective_pool_size(&self) -> usize {
        self.pool_size.unwrap_or_else(|| self.tier.pool_size()).max(1)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tier: DeviceTier::Standard,
            pool_size: None,
            graceful_shutdown_timeout_ms: 10_000,
        }
    }
}

// ── Router ──────────────────────────────────────────────────────

/// Message router settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Hard cap on a serialized envelope payload.
    pub max_message_bytes: usize,
    /// Size at which a warning is logged.
    pub warn_message_bytes: usize,
    /// Per-dispatch handler budget, in milliseconds.
    pub dispatch_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 1_048_576,
            warn_message_bytes: 262_144,
            dispatch_timeout_ms: 30_000,
        }
    }
}

// ── Timeouts ────────────────────────────────────────────────────

/// Phase and step budgets, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Whole-job budget.
    pub job_ms: u64,
    /// Planning phase budget.
    pub planning_ms: u64,
    /// Validation phase budget.
    pub validation_ms: u64,
    /// Per-step budget.
    pub step_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            job_ms: 600_000,
            planning_ms: 120_000,
            validation_ms: 30_000,
            step_ms: 120_000,
        }
    }
}

// ── DAG ─────────────────────────────────────────────────────────

/// Plan execution settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DagConfig {
    /// Hard cap on concurrently running steps within a layer.
    pub max_concurrency: usize,
}

impl Default for DagConfig {
    fn default() -> Self {
        Self { max_concurrency: 4 }
    }
}

// ── Approval ────────────────────────────────────────────────────

/// Approval coordinator settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Nonce time-to-live, in hours.
    pub nonce_ttl_hours: i64,
    /// Same-category approvals before a standing rule is suggested.
    pub suggestion_threshold: u32,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            nonce_ttl_hours: 24,
            suggestion_threshold: 3,
        }
    }
}

// ── Sentinel ────────────────────────────────────────────────────

/// Plan validator policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    /// URL protocols a network step may use.
    pub allowed_protocols: Vec<String>,
    /// Hosts a network step may contact; `*.example.com` allows subdomains.
    pub allowed_domains: Vec<String>,
    /// Cap on `parameters.amount` for payment-class steps.
    pub max_transaction_amount_usd: f64,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            allowed_protocols: vec!["https".to_owned(), "http".to_owned()],
            allowed_domains: Vec::new(),
            max_transaction_amount_usd: 100.0,
        }
    }
}

// ── Breaker ─────────────────────────────────────────────────────

/// Per-gear circuit breaker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures within the window before the circuit opens.
    pub failure_threshold: u32,
    /// Sliding failure window, in seconds.
    pub window_secs: i64,
    /// How long an open circuit stays open, in seconds.
    pub open_secs: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 60,
            open_secs: 30,
        }
    }
}

// ── Retention ───────────────────────────────────────────────────

/// Data retention settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Conversations older than this are archived.
    pub conversation_days: i64,
    /// Episodic memory older than this is archived.
    pub episodic_days: i64,
    /// Completed execution-log rows older than this are deleted.
    pub execution_log_days: i64,
    /// Cron expression gating the sweep.
    pub sweep_cron: String,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            conversation_days: 90,
            episodic_days: 30,
            execution_log_days: 14,
            sweep_cron: "0 30 3 * * *".to_owned(),
        }
    }
}

// ── Backup ──────────────────────────────────────────────────────

/// Encrypted backup settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Newest daily snapshots kept by rotation.
    pub daily_count: usize,
    /// Distinct-week snapshots kept after the dailies.
    pub weekly_count: usize,
    /// Distinct-month snapshots kept after the weeklies.
    pub monthly_count: usize,
    /// Cron expression gating snapshot creation.
    pub snapshot_cron: String,
    /// Key derivation algorithm.
    pub kdf: KdfKind,
    /// Backup password; normally injected via `MERIDIAN_BACKUP_PASSWORD`.
    pub password: Option<String>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            daily_count: 7,
            weekly_count: 4,
            monthly_count: 3,
            snapshot_cron: "0 0 4 * * *".to_owned(),
            kdf: KdfKind::Argon2id,
            password: None,
        }
    }
}

// ── Backpressure ────────────────────────────────────────────────

/// Resource backpressure thresholds, in percent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// RSS percentage above which workers stop claiming.
    pub rss_pause_percent: u8,
    /// Disk usage percentage above which job creation fails.
    pub disk_pause_percent: u8,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            rss_pause_percent: 90,
            disk_pause_percent: 95,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeridianConfig::default();
        assert_eq!(config.queue.poll_interval_ms, 500);
        assert_eq!(config.workers.effective_pool_size(), 4);
        assert_eq!(config.router.max_message_bytes, 1_048_576);
        assert_eq!(config.backup.daily_count, 7);
        assert_eq!(config.backup.weekly_count, 4);
        assert_eq!(config.backup.monthly_count, 3);
        assert_eq!(config.approval.nonce_ttl_hours, 24);
        assert_eq!(config.backup.kdf, KdfKind::Argon2id);
    }

    #[test]
    fn test_tier_pool_sizes() {
        assert_eq!(DeviceTier::Lite.pool_size(), 2);
        assert_eq!(DeviceTier::Standard.pool_size(), 4);
        assert_eq!(DeviceTier::Performance.pool_size(), 8);
    }

    #[test]
    fn test_explicit_pool_size_wins() {
        let config = MeridianConfig::from_toml(
            r#"
            [workers]
            tier = "performance"
            pool_size = 3
            "#,
        )
        .expect("parse");
        assert_eq!(config.workers.effective_pool_size(), 3);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = MeridianConfig::from_toml(
            r#"
            [sentinel]
            allowed_domains = ["api.example.com", "*.internal.test"]
            max_transaction_amount_usd = 25.0
            "#,
        )
        .expect("parse");
        assert_eq!(config.sentinel.allowed_domains.len(), 2);
        assert_eq!(config.sentinel.max_transaction_amount_usd, 25.0);
        // Untouched sections keep their defaults.
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.timeouts.step_ms, 120_000);
    }

    #[test]
    fn test_env_override() {
        let mut config = MeridianConfig::default();
        config.apply_overrides(|key| match key {
            "MERIDIAN_POOL_SIZE" => Some("6".to_owned()),
            "MERIDIAN_JOB_TIMEOUT_MS" => Some("1000".to_owned()),
            _ => None,
        });
        assert_eq!(config.workers.effective_pool_size(), 6);
        assert_eq!(config.timeouts.job_ms, 1000);
    }

    #[test]
    fn test_data_dir_override_rebases_satellites() {
        let mut config = MeridianConfig::default();
        config.apply_overrides(|key| {
            (key == "MERIDIAN_DATA_DIR").then(|| "/srv/meridian".to_owned())
        });
        assert_eq!(config.paths.data_dir, PathBuf::from("/srv/meridian"));
        assert_eq!(config.paths.backups_dir, PathBuf::from("/srv/meridian/backups"));
        assert_eq!(config.paths.workspace_root, PathBuf::from("/srv/meridian/workspace"));
    }

    #[test]
    fn test_invalid_env_override_ignored() {
        let mut config = MeridianConfig::default();
        config.apply_overrides(|key| {
            (key == "MERIDIAN_POOL_SIZE").then(|| "not-a-number".to_owned())
        });
        assert_eq!(config.workers.effective_pool_size(), 4);
    }

    #[test]
    fn test_sha256_kdf_parses() {
        let config = MeridianConfig::from_toml(
            r#"
            [backup]
            kdf = "sha256"
            "#,
        )
        .expect("parse");
        assert_eq!(config.backup.kdf, KdfKind::Sha256);
    }

    #[test]
    fn test_zero_pool_size_clamped() {
        let config = MeridianConfig::from_toml(
            r#"
            [workers]
            pool_size = 0
            "#,
        )
        .expect("parse");
        assert_eq!(config.workers.effective_pool_size(), 1);
    }
}
