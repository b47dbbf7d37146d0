//! SQLite implementation of IRosterStore
//!
//! Each account owns two rows in `roster_documents`, one per record kind.
//! Rows are keyed by a SHA-256 digest of the lowercased account so that
//! account names never appear in the database.
//!
//! ## Type Mapping
//!
//! | Domain Type   | SQL Type | Strategy                                  |
//! |---------------|----------|-------------------------------------------|
//! | Account       | TEXT     | lowercase hex SHA-256 via [`account_key`] |
//! | RosterCache   | TEXT     | serde_json serialization                  |
//! | DeltaJournal  | TEXT     | serde_json serialization                  |
//! | DateTime<Utc> | TEXT     | ISO 8601 via `to_rfc3339()`               |

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use rostersync_core::domain::{newtypes::Account, DeltaJournal, RosterCache};
use rostersync_core::ports::{IRosterStore, LoadOutcome, StoredRoster};

use crate::CacheError;

const KIND_CACHE: &str = "cache";
const KIND_JOURNAL: &str = "journal";

/// Returns the storage key of an account
pub fn account_key(account: &Account) -> String {
    let mut hasher = Sha256::new();
    hasher.update(account.as_str().to_lowercase().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// SQLite-based implementation of the roster store port
pub struct SqliteRosterStore {
    pool: SqlitePool,
}

impl SqliteRosterStore {
    /// Creates a new store with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns the timestamp of the last save, if the account has records
    pub async fn last_saved(&self, account: &Account) -> Result<Option<String>, CacheError> {
        let updated_at: Option<String> = sqlx::query_scalar(
            "SELECT MAX(updated_at) FROM roster_documents WHERE account_key = ?",
        )
        .bind(account_key(account))
        .fetch_one(&self.pool)
        .await?;
        Ok(updated_at)
    }
}

/// A decoded row before version checks
struct DocumentRow {
    kind: String,
    schema_version: u32,
    body: String,
}

fn decode_cache(row: &DocumentRow) -> Result<RosterCache, String> {
    if row.schema_version != RosterCache::SCHEMA_VERSION {
        return Err(format!(
            "cache schema version {} (expected {})",
            row.schema_version,
            RosterCache::SCHEMA_VERSION
        ));
    }
    serde_json::from_str(&row.body).map_err(|e| format!("cache body unreadable: {e}"))
}

fn decode_journal(row: &DocumentRow) -> Result<DeltaJournal, String> {
    if row.schema_version != DeltaJournal::SCHEMA_VERSION {
        return Err(format!(
            "journal schema version {} (expected {})",
            row.schema_version,
            DeltaJournal::SCHEMA_VERSION
        ));
    }
    serde_json::from_str(&row.body).map_err(|e| format!("journal body unreadable: {e}"))
}

/// Turns the rows of one account into a load outcome
fn outcome_from_rows(rows: &[DocumentRow]) -> LoadOutcome {
    if rows.is_empty() {
        return LoadOutcome::Absent;
    }

    let find = |kind: &str| rows.iter().find(|row| row.kind == kind);
    let (Some(cache_row), Some(journal_row)) = (find(KIND_CACHE), find(KIND_JOURNAL)) else {
        return LoadOutcome::Unreadable {
            reason: "one of the two records is missing".to_string(),
        };
    };

    match (decode_cache(cache_row), decode_journal(journal_row)) {
        (Ok(cache), Ok(journal)) => LoadOutcome::Loaded(StoredRoster { cache, journal }),
        (Err(reason), _) | (_, Err(reason)) => LoadOutcome::Unreadable { reason },
    }
}

#[async_trait::async_trait]
impl IRosterStore for SqliteRosterStore {
    async fn load(&self, account: &Account) -> anyhow::Result<LoadOutcome> {
        let key = account_key(account);
        let rows = sqlx::query(
            "SELECT kind, schema_version, body FROM roster_documents WHERE account_key = ?",
        )
        .bind(&key)
        .fetch_all(&self.pool)
        .await?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let schema_version: i64 = row.try_get("schema_version")?;
            documents.push(DocumentRow {
                kind: row.try_get("kind")?,
                schema_version: u32::try_from(schema_version).unwrap_or(u32::MAX),
                body: row.try_get("body")?,
            });
        }

        let outcome = outcome_from_rows(&documents);
        match &outcome {
            LoadOutcome::Absent => tracing::debug!(account = %account, "No stored roster"),
            LoadOutcome::Loaded(stored) => tracing::debug!(
                account = %account,
                contacts = stored.cache.contacts().len(),
                "Loaded stored roster"
            ),
            LoadOutcome::Unreadable { reason } => {
                tracing::warn!(account = %account, %reason, "Stored roster is unreadable")
            }
        }
        Ok(outcome)
    }

    async fn save(
        &self,
        account: &Account,
        cache: &RosterCache,
        journal: &DeltaJournal,
    ) -> anyhow::Result<()> {
        let key = account_key(account);
        let cache_body = serde_json::to_string(cache).map_err(CacheError::from)?;
        let journal_body = serde_json::to_string(journal).map_err(CacheError::from)?;
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;
        for (kind, version, body) in [
            (KIND_CACHE, RosterCache::SCHEMA_VERSION, &cache_body),
            (KIND_JOURNAL, DeltaJournal::SCHEMA_VERSION, &journal_body),
        ] {
            sqlx::query(
                "INSERT OR REPLACE INTO roster_documents \
                 (account_key, kind, schema_version, body, updated_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&key)
            .bind(kind)
            .bind(i64::from(version))
            .bind(body)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::trace!(account = %account, bytes = cache_body.len(), "Saved roster");
        Ok(())
    }

    async fn discard(&self, account: &Account) -> anyhow::Result<()> {
        let result = sqlx::query("DELETE FROM roster_documents WHERE account_key = ?")
            .bind(account_key(account))
            .execute(&self.pool)
            .await?;

        tracing::info!(
            account = %account,
            rows = result.rows_affected(),
            "Discarded stored roster"
        );
        Ok(())
    }
}
