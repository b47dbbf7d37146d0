//! Roster database handle
//!
//! Owns the SQLite file that holds `roster_documents`, the on-disk layout
//! version recorded in `PRAGMA user_version`, and hands out the
//! [`SqliteRosterStore`] bound to it.
//!
//! Layout steps are applied in order, each in its own transaction, and the
//! recorded version is bumped inside the same transaction. A file written by
//! a newer build is refused rather than downgraded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::{CacheError, SqliteRosterStore};

/// Layout steps; step `n` moves the file from version `n` to `n + 1`
const LAYOUT_STEPS: &[(&str, &str)] = &[(
    "roster_documents",
    include_str!("migrations/20261019_initial.sql"),
)];

/// Layout version this build reads and writes
pub const LAYOUT_VERSION: i64 = LAYOUT_STEPS.len() as i64;

/// Where the roster documents of every account on this machine live
#[derive(Debug, Clone)]
pub struct RosterDatabase {
    pool: SqlitePool,
    location: Option<PathBuf>,
}

impl RosterDatabase {
    /// Opens (creating if needed) the database file at `path`
    ///
    /// # Errors
    ///
    /// `ConnectionFailed` when the directory or file cannot be opened,
    /// `MigrationFailed` when a layout step fails or the file is newer
    /// than [`LAYOUT_VERSION`].
    pub async fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "Cannot create roster directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // One engine per account writes at a time; a handful of readers is plenty
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "Cannot open roster database {}: {e}",
                    path.display()
                ))
            })?;

        let database = Self {
            pool,
            location: Some(path.to_path_buf()),
        };
        let applied = database.upgrade().await?;
        tracing::info!(
            path = %path.display(),
            layout = LAYOUT_VERSION,
            applied,
            "Roster database opened"
        );
        Ok(database)
    }

    /// Opens a private database that vanishes on close
    ///
    /// Limited to one connection: every in-memory connection is its own database.
    pub async fn in_memory() -> Result<Self, CacheError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!("Cannot open in-memory roster database: {e}"))
            })?;

        let database = Self {
            pool,
            location: None,
        };
        database.upgrade().await?;
        Ok(database)
    }

    /// Store bound to this database
    pub fn store(&self) -> SqliteRosterStore {
        SqliteRosterStore::new(self.pool.clone())
    }

    /// Raw pool, for maintenance queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// File path, or `None` for an in-memory database
    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    /// Version recorded in the file header
    pub async fn layout_version(&self) -> Result<i64, CacheError> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    /// Closes every connection; stores handed out earlier stop working
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Brings the file up to [`LAYOUT_VERSION`], returning the steps applied
    async fn upgrade(&self) -> Result<usize, CacheError> {
        let current = self.layout_version().await?;
        if current > LAYOUT_VERSION {
            return Err(CacheError::MigrationFailed(format!(
                "roster database has layout {current}, this build supports up to {LAYOUT_VERSION}"
            )));
        }

        let pending = LAYOUT_STEPS.iter().enumerate().skip(current.max(0) as usize);
        let mut applied = 0;
        for (index, (name, sql)) in pending {
            let target = index as i64 + 1;
            let step_failed =
                |e: sqlx::Error| CacheError::MigrationFailed(format!("layout step {name}: {e}"));

            let mut tx = self.pool.begin().await.map_err(step_failed)?;
            sqlx::raw_sql(sql).execute(&mut *tx).await.map_err(step_failed)?;
            // PRAGMA takes no bound parameters
            sqlx::raw_sql(&format!("PRAGMA user_version = {target}"))
                .execute(&mut *tx)
                .await
                .map_err(step_failed)?;
            tx.commit().await.map_err(step_failed)?;

            tracing::debug!(step = name, version = target, "Applied layout step");
            applied += 1;
        }
        Ok(applied)
    }
}
