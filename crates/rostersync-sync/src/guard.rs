//! Guarded session state
//!
//! [`RosterGuard`] owns everything that is shared between bootstrap,
//! mutations and acknowledgments: the cache document, the journal, the
//! synchronization state, the recursion counter and the pending wire batch
//! map. A single `tokio::sync::Mutex` guards all of it.
//!
//! Closures passed to the guard are synchronous, so no remote call can be
//! issued while the lock is held. The only await under the lock is the
//! store write in [`RosterGuard::commit`], which keeps the cache and its
//! persisted copy in step.
//!
//! Every mutating entry point takes the session token captured when the
//! caller's flow started. The token is checked after the lock is acquired;
//! once the session is signed off, the call fails with
//! [`SyncError::Cancelled`] without touching the state.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use rostersync_core::domain::{
    Account, ContactHash, DeltaJournal, RosterCache, SyncState, TransactionId,
};
use rostersync_core::ports::{IRosterStore, WireCommand};

use crate::SyncError;

/// An outbound wire batch waiting for its acknowledgment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBatch {
    /// `ADL` or `RML`
    pub command: WireCommand,
    /// Serialized `<ml>` document
    pub payload: String,
    /// Contacts announced by the batch
    pub contacts: Vec<ContactHash>,
    /// Whether the batch belongs to the initial bootstrap announcement
    pub initial: bool,
}

/// Session bookkeeping that is not persisted
#[derive(Debug, Clone, Default)]
pub struct SessionControl {
    /// Synchronization state
    pub sync_state: SyncState,
    /// Automatic restarts performed by the running bootstrap
    pub recursive_attempt: u32,
    /// Batches sent but not yet acknowledged
    pub pending: BTreeMap<TransactionId, PendingBatch>,
    /// Whether `SignedIn` was already raised in this session
    pub signed_in: bool,
}

impl SessionControl {
    /// Returns true while an initial batch awaits its acknowledgment
    pub fn has_pending_initial(&self) -> bool {
        self.pending.values().any(|batch| batch.initial)
    }
}

/// Working copies handed to a [`RosterGuard::commit`] closure
#[derive(Debug)]
pub struct Working {
    /// Cache document
    pub cache: RosterCache,
    /// Journal record
    pub journal: DeltaJournal,
    /// Session bookkeeping
    pub control: SessionControl,
}

struct SessionState {
    cache: Arc<RosterCache>,
    journal: DeltaJournal,
    control: SessionControl,
    token: CancellationToken,
}

/// Mutex-guarded owner of the session state
pub struct RosterGuard {
    account: Account,
    store: Arc<dyn IRosterStore>,
    state: Mutex<SessionState>,
}

impl RosterGuard {
    /// Creates a guard with an empty document
    pub fn new(account: Account, store: Arc<dyn IRosterStore>) -> Self {
        Self {
            account,
            store,
            state: Mutex::new(SessionState {
                cache: Arc::new(RosterCache::new()),
                journal: DeltaJournal::new(),
                control: SessionControl::default(),
                token: CancellationToken::new(),
            }),
        }
    }

    /// Returns the owning account
    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Returns the roster store
    pub fn store(&self) -> &Arc<dyn IRosterStore> {
        &self.store
    }

    /// Returns the token of the current session
    pub async fn session(&self) -> CancellationToken {
        self.state.lock().await.token.clone()
    }

    /// Returns the current document; later commits do not affect it
    pub async fn snapshot(&self) -> Arc<RosterCache> {
        Arc::clone(&self.state.lock().await.cache)
    }

    /// Reads the current document
    pub async fn with_cache<R>(&self, f: impl FnOnce(&RosterCache) -> R) -> R {
        let state = self.state.lock().await;
        f(&state.cache)
    }

    /// Reads the session bookkeeping
    pub async fn read<R>(&self, f: impl FnOnce(&SessionControl, &RosterCache) -> R) -> R {
        let state = self.state.lock().await;
        f(&state.control, &state.cache)
    }

    /// Mutates session-only data: the bookkeeping and the announcement counters
    ///
    /// Nothing is persisted. Changes to persisted cache fields must go
    /// through [`commit`](Self::commit).
    pub async fn control<R>(
        &self,
        session: &CancellationToken,
        f: impl FnOnce(&mut SessionControl, &mut RosterCache) -> R,
    ) -> Result<R, SyncError> {
        let mut state = self.state.lock().await;
        if session.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let state = &mut *state;
        Ok(f(&mut state.control, Arc::make_mut(&mut state.cache)))
    }

    /// Applies a change to copies of the state, persists cache and journal,
    /// then swaps the copies in
    ///
    /// If the closure or the store write fails, the state is left untouched.
    pub async fn commit<R>(
        &self,
        session: &CancellationToken,
        f: impl FnOnce(&mut Working) -> Result<R, SyncError>,
    ) -> Result<R, SyncError> {
        let mut state = self.state.lock().await;
        if session.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let mut working = Working {
            cache: RosterCache::clone(&state.cache),
            journal: state.journal.clone(),
            control: state.control.clone(),
        };
        let result = f(&mut working)?;

        self.store
            .save(&self.account, &working.cache, &working.journal)
            .await
            .map_err(SyncError::Storage)?;

        state.cache = Arc::new(working.cache);
        state.journal = working.journal;
        state.control = working.control;
        Ok(result)
    }

    /// Installs a document that already matches durable storage
    ///
    /// Announcement counters start from zero.
    pub async fn replace_cache(
        &self,
        session: &CancellationToken,
        mut cache: RosterCache,
        journal: DeltaJournal,
    ) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        if session.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        cache.reset_announcements();
        state.cache = Arc::new(cache);
        state.journal = journal;
        Ok(())
    }

    /// Ends the session: cancels its token and resets the bookkeeping
    ///
    /// Returns the token of the new session.
    pub async fn sign_off(&self) -> CancellationToken {
        let mut state = self.state.lock().await;
        state.token.cancel();
        state.token = CancellationToken::new();
        state.control = SessionControl::default();
        Arc::make_mut(&mut state.cache).reset_announcements();
        state.token.clone()
    }
}
