//! Durable storage: three SQLite databases under one data directory.
//!
//! `meridian` holds jobs, executions, approvals, schedules, and the audit
//! chain; `journal` holds the memory collaborator's rows; `sentinel` holds
//! standing decisions. Migrations are applied inline via `include_str!` on
//! first open. All pools run in WAL mode with foreign keys on.
//!
//! The store is the only cross-worker mutable resource; every mutation by
//! the components above it is a transaction on one of these pools.

use std::path::{Path, PathBuf};

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Database file names under the data directory.
pub const DB_NAMES: [&str; 3] = ["meridian", "journal", "sentinel"];

/// Handle to the three runtime databases.
#[derive(Clone)]
pub struct Store {
    meridian: SqlitePool,
    journal: SqlitePool,
    sentinel: SqlitePool,
    data_dir: PathBuf,
}

impl Store {
    /// Open (or create) the databases under `data_dir` and apply migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, a database
    /// cannot be opened, or a migration fails.
    pub async fn open(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let meridian = open_pool(&data_dir.join("meridian.db")).await?;
        let journal = open_pool(&data_dir.join("journal.db")).await?;
        let sentinel = open_pool(&data_dir.join("sentinel.db")).await?;

        let store = Self {
            meridian,
            journal,
            sentinel,
            data_dir: data_dir.to_path_buf(),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Open all three databases in memory (tests).
    ///
    /// # Errors
    ///
    /// Returns an error if a pool cannot be created or a migration fails.
    pub async fn open_in_memory() -> anyhow::Result<Self> {
        let store = Self {
            meridian: open_memory_pool().await?,
            journal: open_memory_pool().await?,
            sentinel: open_memory_pool().await?,
            data_dir: PathBuf::new(),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(include_str!("../../migrations/001_meridian_schema.sql"))
            .execute(&self.meridian)
            .await
            .context("failed to apply meridian schema migration")?;
        sqlx::raw_sql(include_str!("../../migrations/002_journal_schema.sql"))
            .execute(&self.journal)
            .await
            .context("failed to apply journal schema migration")?;
        sqlx::raw_sql(include_str!("../../migrations/003_sentinel_schema.sql"))
            .execute(&self.sentinel)
            .await
            .context("failed to apply sentinel schema migration")?;
        Ok(())
    }

    /// The core orchestration database.
    pub fn meridian(&self) -> &SqlitePool {
        &self.meridian
    }

    /// The memory database.
    pub fn journal(&self) -> &SqlitePool {
        &self.journal
    }

    /// The policy database.
    pub fn sentinel(&self) -> &SqlitePool {
        &self.sentinel
    }

    /// Directory the database files live in. Empty for in-memory stores.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// `(name, pool)` pairs for maintenance tasks that walk every database.
    pub fn pools(&self) -> [(&'static str, &SqlitePool); 3] {
        [
            ("meridian", &self.meridian),
            ("journal", &self.journal),
            ("sentinel", &self.sentinel),
        ]
    }

    /// Close all pools, flushing WAL.
    pub async fn close(&self) {
        self.meridian.close().await;
        self.journal.close().await;
        self.sentinel.close().await;
    }
}

async fn open_pool(path: &Path) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .pragma("trusted_schema", "OFF")
        .pragma("foreign_keys", "ON");

    SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database at {}", path.display()))
}

async fn open_memory_pool() -> anyhow::Result<SqlitePool> {
    // A single connection keeps every statement on the same in-memory db.
    let options = SqliteConnectOptions::new()
        .filename(":memory:")
        .pragma("foreign_keys", "ON");

    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .context("failed to open in-memory database")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_migrates() {
        let store = Store::open_in_memory().await.expect("open");
        // Migrated tables are queryable.
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
            .fetch_one(store.meridian())
            .await
            .expect("query jobs");
        assert_eq!(count.0, 0);
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM episodes")
            .fetch_one(store.journal())
            .await
            .expect("query episodes");
        assert_eq!(count.0, 0);
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM decisions")
            .fetch_one(store.sentinel())
            .await
            .expect("query decisions");
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn test_open_on_disk_creates_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = Store::open(tmp.path()).await.expect("open");
        for name in DB_NAMES {
            assert!(
                tmp.path().join(format!("{name}.db")).exists(),
                "{name}.db should exist"
            );
        }
        store.close().await;
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = Store::open(tmp.path()).await.expect("first open");
        store.close().await;
        // Second open re-applies the same migrations without error.
        let store = Store::open(tmp.path()).await.expect("second open");
        store.close().await;
    }
}
