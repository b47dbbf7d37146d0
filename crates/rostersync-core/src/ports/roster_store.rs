//! Roster store port (driven/secondary port)
//!
//! Durable storage for the two per-account records: the [`RosterCache`]
//! document and its [`DeltaJournal`].
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific
//!   and are terminal for the engine.
//! - An unreadable record or a schema version mismatch is not an error: it
//!   is reported as [`LoadOutcome::Unreadable`] so the engine can discard it
//!   and start over.

use crate::domain::{journal::DeltaJournal, newtypes::Account, roster::RosterCache};

/// Both persisted records of an account
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredRoster {
    /// Cache document
    pub cache: RosterCache,
    /// Journal record
    pub journal: DeltaJournal,
}

/// Result of loading an account's records
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// Nothing stored for the account
    Absent,
    /// Both records were read and their versions match
    Loaded(StoredRoster),
    /// A record could not be decoded or carries another schema version
    Unreadable {
        /// Why the record was rejected
        reason: String,
    },
}

/// Port trait for persisting the roster of an account
#[async_trait::async_trait]
pub trait IRosterStore: Send + Sync {
    /// Loads both records of an account
    async fn load(&self, account: &Account) -> anyhow::Result<LoadOutcome>;

    /// Writes both records of an account atomically
    async fn save(
        &self,
        account: &Account,
        cache: &RosterCache,
        journal: &DeltaJournal,
    ) -> anyhow::Result<()>;

    /// Deletes both records of an account
    async fn discard(&self, account: &Account) -> anyhow::Result<()>;
}
