//! Meridian runtime binary.
//!
//! `start` runs the orchestration substrate until interrupted; the other
//! subcommands are one-shot maintenance operations against the same data
//! directory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use meridian::axis::audit::AuditTrail;
use meridian::axis::dag::StepError;
use meridian::axis::lifecycle::Lifecycle;
use meridian::axis::pipeline::StepRunner;
use meridian::config::MeridianConfig;
use meridian::heartbeat::{backup, retention};
use meridian::store::Store;
use meridian::logging;
use meridian::types::PlanStep;

#[derive(Parser)]
#[command(name = "meridian", about = "Local-first agentic runtime", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the runtime until interrupted.
    Start,
    /// Take an encrypted snapshot now, then rotate old ones.
    Backup,
    /// Restore databases from a snapshot directory.
    Restore {
        /// Path to a `backup-<timestamp>` directory.
        snapshot: PathBuf,
    },
    /// Run one retention sweep now.
    Retention,
    /// Walk the audit hash chain and report the first break, if any.
    VerifyAudit,
}

/// Placeholder gear runtime for the bare binary: the sandboxed plugin
/// host is a separate process that attaches at startup; without it every
/// step is refused.
struct DetachedGears;

#[async_trait]
impl StepRunner for DetachedGears {
    async fn run_step(
        &self,
        _job_id: Uuid,
        step: &PlanStep,
        _cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StepError> {
        Err(StepError::SandboxDenied(format!(
            "no gear runtime attached for '{}'",
            step.gear
        )))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = MeridianConfig::load()?;

    match cli.command {
        Command::Start => {
            let _guard = logging::init_runtime(&config.paths.logs_dir)?;
            let lifecycle = Lifecycle::start(config, Arc::new(DetachedGears)).await?;

            tokio::signal::ctrl_c()
                .await
                .context("waiting for interrupt")?;
            info!("interrupt received");
            lifecycle.shutdown().await;
        }
        Command::Backup => {
            logging::init_cli();
            let key = backup::backup_key(&config.paths.data_dir, &config.backup)?;
            let store = Store::open(&config.paths.data_dir).await?;
            let outcome = backup::create_snapshot(&store, &config.paths.backups_dir, &key).await?;
            store.close().await;
            let rotation = backup::rotate(&config.paths.backups_dir, &config.backup)?;
            println!(
                "snapshot {} ({} databases, {} bytes); rotation kept {}, removed {}",
                outcome.snapshot_dir.display(),
                outcome.databases.len(),
                outcome.total_bytes,
                rotation.kept.len(),
                rotation.removed.len(),
            );
        }
        Command::Restore { snapshot } => {
            logging::init_cli();
            let key = backup::backup_key(&config.paths.data_dir, &config.backup)?;
            let restored = backup::restore(&snapshot, &config.paths.data_dir, &key).await?;
            println!("restored: {}", restored.join(", "));
        }
        Command::Retention => {
            logging::init_cli();
            let store = Store::open(&config.paths.data_dir).await?;
            let outcome = retention::sweep(&store, &config.retention).await;
            store.close().await;
            println!(
                "archived {} conversations, {} episodes; deleted {} execution rows",
                outcome.conversations_archived,
                outcome.episodes_archived,
                outcome.executions_deleted,
            );
        }
        Command::VerifyAudit => {
            logging::init_cli();
            let store = Store::open(&config.paths.data_dir).await?;
            let trail = AuditTrail::new(store.meridian().clone());
            let verified = trail.verify().await?;
            store.close().await;
            println!("audit chain intact: {verified} entries verified");
        }
    }

    Ok(())
}
