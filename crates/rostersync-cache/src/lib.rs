//! rostersync Cache - Roster document persistence
//!
//! SQLite-based storage for the two per-account records:
//! - The roster cache document (contacts, groups, circles, timestamps)
//! - The delta journal (cache keys, held profile snapshot)
//!
//! ## Architecture
//!
//! This crate implements the `IRosterStore` port from `rostersync-core`
//! using SQLite as the storage backend. It is a driven (secondary) adapter
//! in the hexagonal architecture.
//!
//! ## Key Components
//!
//! - [`RosterDatabase`] - Database file, layout versioning, store factory
//! - [`SqliteRosterStore`] - `IRosterStore` implementation
//! - [`CacheError`] - Error types for cache operations
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use rostersync_cache::RosterDatabase;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let database = RosterDatabase::open(Path::new("/home/user/.local/share/rostersync/roster.db")).await?;
//! let store = database.store();
//! // Use store as IRosterStore...
//! # Ok(())
//! # }
//! ```

pub mod database;
pub mod store;

pub use database::{RosterDatabase, LAYOUT_VERSION};
pub use store::{account_key, SqliteRosterStore};

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Serialization or deserialization of domain types failed
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}
