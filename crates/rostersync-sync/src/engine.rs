//! Roster synchronization engine
//!
//! The [`RosterEngine`] reconciles the local roster with the remote
//! membership service and announces it to the notification server.
//!
//! ## Bootstrap Flow
//!
//! 1. **Load**: read the stored document; an unreadable one is discarded
//! 2. **FetchMembership**: full or delta, by the membership timestamp
//! 3. **FetchAddressBook**: full or delta, by the default book timestamp
//! 4. **FetchCircleBooks**: one fetch per accepted circle
//! 5. **ApplyProfile**: apply the held profile, truncate the journal
//! 6. **Announce**: queue the initial `ADL` batches
//!
//! Every merge is committed (and persisted) before the next step runs.
//! `Synchronized` is entered once the notification server has acknowledged
//! every initial batch; see [`RosterEngine::on_command_acknowledged`].
//!
//! ## Recovery
//!
//! A stale cache restarts the sequence from `Load` with an empty document;
//! a missing address book is created first. Restarts are counted and
//! bounded by `sync.max_recovery_attempts`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rostersync_core::config::Config;
use rostersync_core::domain::{
    Account, AddressBookId, Circle, CircleId, ClientType, Contact, ContactGroup, ContactHash,
    DeltaJournal, DomainError, OwnerProfile, RoleLists, RosterCache, RosterEvent, ServiceFault,
    SyncState, SyncTransition, TransactionId, CIRCLE_HOST_DOMAIN,
};
use rostersync_core::ports::{
    FetchMode, IMembershipService, INotificationChannel, IRosterStore, LoadOutcome, Scenario,
    WireCommand,
};

use crate::batch::build_wire_batches;
use crate::guard::{PendingBatch, RosterGuard, SessionControl};
use crate::merge;
use crate::recovery::{self, RecoveryAction, RecoveryContext};
use crate::SyncError;

/// Lists a joined circle is announced with
pub(crate) const CIRCLE_ANNOUNCED_LISTS: RoleLists = RoleLists::FORWARD.union(RoleLists::ALLOW);

// ============================================================================
// Reports
// ============================================================================

/// Steps of the bootstrap sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStep {
    /// Read the stored document
    Load,
    /// Fetch and merge the membership book
    FetchMembership,
    /// Fetch and merge the default address book
    FetchAddressBook,
    /// Fetch and merge the books of accepted circles
    FetchCircleBooks,
    /// Apply the held profile and truncate the journal
    ApplyProfile,
    /// Queue the initial wire batches
    Announce,
}

/// One remote fetch issued during a bootstrap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRecord {
    /// Step that issued the fetch
    pub step: BootstrapStep,
    /// Address book fetched; `None` for the membership book
    pub book: Option<AddressBookId>,
    /// Whether a full snapshot was requested
    pub full: bool,
}

/// Summary of a bootstrap run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    /// The call was a no-op because a bootstrap already ran or is running
    pub skipped: bool,
    /// Automatic restarts performed
    pub restarts: u32,
    /// Times the stored document was discarded
    pub cache_discards: u32,
    /// Remote fetches issued, in order
    pub fetches: Vec<FetchRecord>,
    /// Transaction ids of the initial batches, in queue order
    pub transactions: Vec<TransactionId>,
    /// State when the call returned
    pub final_state: SyncState,
}

/// Failure of one fetch-and-merge step
enum StepFailure {
    /// The remote service reported a fault; recovery decides what happens
    Fault(&'static str, ServiceFault),
    /// Anything else ends the flow
    Fatal(SyncError),
}

impl From<SyncError> for StepFailure {
    fn from(err: SyncError) -> Self {
        StepFailure::Fatal(err)
    }
}

// ============================================================================
// RosterEngine
// ============================================================================

/// Contact-list synchronization engine for one signed-in account
///
/// ## Dependencies
///
/// - `membership`: remote membership and address-book service
/// - `channel`: outbound notification channel
/// - `store`: durable cache and journal storage (held by the guard)
pub struct RosterEngine {
    /// Remote membership service
    pub(crate) membership: Arc<dyn IMembershipService>,
    /// Outbound notification channel
    pub(crate) channel: Arc<dyn INotificationChannel>,
    /// Shared session state
    pub(crate) guard: RosterGuard,
    /// Event publisher
    events: broadcast::Sender<RosterEvent>,
    /// Whether bootstrap talks to the remote service
    auto_sync: bool,
    /// Restart budget per flow
    pub(crate) max_recovery_attempts: u32,
    /// Period of the background refresh loop
    refresh_interval: Duration,
}

impl RosterEngine {
    /// Creates an engine for `account`
    pub fn new(
        account: Account,
        membership: Arc<dyn IMembershipService>,
        channel: Arc<dyn INotificationChannel>,
        store: Arc<dyn IRosterStore>,
        config: &Config,
    ) -> Self {
        let (events, _) = broadcast::channel(config.notification.event_capacity.max(1));
        Self {
            membership,
            channel,
            guard: RosterGuard::new(account, store),
            events,
            auto_sync: config.sync.auto_sync,
            max_recovery_attempts: config.sync.max_recovery_attempts,
            refresh_interval: Duration::from_secs(config.sync.refresh_interval_secs.max(1)),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Returns the owning account
    pub fn account(&self) -> &Account {
        self.guard.account()
    }

    /// Subscribes to roster events
    pub fn subscribe(&self) -> broadcast::Receiver<RosterEvent> {
        self.events.subscribe()
    }

    /// Returns the synchronization state
    pub async fn state(&self) -> SyncState {
        self.guard.read(|control, _| control.sync_state).await
    }

    /// Returns a contact by hash
    pub async fn contact(&self, hash: &ContactHash) -> Option<Contact> {
        self.guard.with_cache(|cache| cache.contact(hash).cloned()).await
    }

    /// Returns every contact
    pub async fn contacts(&self) -> Vec<Contact> {
        self.guard
            .with_cache(|cache| cache.contacts().values().cloned().collect())
            .await
    }

    /// Returns every group
    pub async fn groups(&self) -> Vec<ContactGroup> {
        self.guard
            .with_cache(|cache| cache.groups().values().cloned().collect())
            .await
    }

    /// Returns every circle
    pub async fn circles(&self) -> Vec<Circle> {
        self.guard
            .with_cache(|cache| cache.circles().values().cloned().collect())
            .await
    }

    /// Returns the owner profile
    pub async fn owner(&self) -> OwnerProfile {
        self.guard.with_cache(|cache| cache.owner().clone()).await
    }

    /// Returns the transaction ids still waiting for an acknowledgment
    pub async fn pending_transactions(&self) -> Vec<TransactionId> {
        self.guard
            .read(|control, _| control.pending.keys().copied().collect())
            .await
    }

    /// Returns the current cache document
    pub async fn snapshot(&self) -> Arc<RosterCache> {
        self.guard.snapshot().await
    }

    pub(crate) fn emit(&self, event: RosterEvent) {
        debug!(event = event.name(), "Publishing roster event");
        // No subscriber is not an error
        let _ = self.events.send(event);
    }

    fn emit_all(&self, events: impl IntoIterator<Item = RosterEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    /// Reports a terminal remote fault and turns it into an error
    ///
    /// Nothing is published once the session is signed off.
    pub(crate) fn fail(
        &self,
        session: &CancellationToken,
        operation: &str,
        fault: ServiceFault,
    ) -> SyncError {
        if session.is_cancelled() {
            return SyncError::Cancelled;
        }
        error!(operation, code = fault.code(), error = %fault, "Service operation failed");
        self.emit(RosterEvent::ServiceOperationFailed {
            operation: operation.to_string(),
            reason: fault.to_string(),
        });
        SyncError::Service {
            operation: operation.to_string(),
            fault,
        }
    }

    /// Reports the failure of a public mutation
    ///
    /// Remote faults were already published by [`fail`](Self::fail) and a
    /// rejected request (`SyncError::Domain`) is returned as is. Storage and
    /// channel failures publish `ServiceOperationFailed` here. A signed-off
    /// session turns every error into [`SyncError::Cancelled`].
    pub(crate) fn settle<T>(
        &self,
        session: &CancellationToken,
        operation: &str,
        result: Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if err.is_cancelled() || session.is_cancelled() {
            debug!(operation, "Abandoned: session signed off");
            return Err(SyncError::Cancelled);
        }
        match &err {
            SyncError::Storage(_) | SyncError::Channel(_) => {
                error!(operation, error = %err, "Operation failed");
                self.emit(RosterEvent::ServiceOperationFailed {
                    operation: operation.to_string(),
                    reason: err.to_string(),
                });
            }
            SyncError::Domain(_) => debug!(operation, error = %err, "Request rejected"),
            SyncError::Service { .. }
            | SyncError::RecoveryExhausted { .. }
            | SyncError::Cancelled => {}
        }
        Err(err)
    }

    // ========================================================================
    // Bootstrap
    // ========================================================================

    /// Runs the bootstrap sequence
    ///
    /// Returns once the initial batches are queued; `Synchronized` follows
    /// when they are acknowledged. A no-op unless the engine is
    /// `Unsynchronized`.
    ///
    /// # Errors
    ///
    /// Returns the terminal error of the sequence. A `ServiceOperationFailed`
    /// event is published first, except for [`SyncError::Cancelled`].
    #[tracing::instrument(skip(self), fields(account = %self.account()))]
    pub async fn bootstrap(&self) -> Result<BootstrapReport, SyncError> {
        let session = self.guard.session().await;

        let begun = self
            .guard
            .control(&session, |control, _| {
                if control.sync_state != SyncState::Unsynchronized {
                    return None;
                }
                control.sync_state = control
                    .sync_state
                    .transition(SyncTransition::BeginBootstrap)
                    .ok()?;
                control.recursive_attempt = 0;
                Some(())
            })
            .await?;

        if begun.is_none() {
            let state = self.state().await;
            info!(state = %state, "Bootstrap skipped");
            return Ok(BootstrapReport {
                skipped: true,
                final_state: state,
                ..BootstrapReport::default()
            });
        }

        let mut report = BootstrapReport::default();
        match self.run_bootstrap(&session, &mut report).await {
            Ok(()) => {
                report.final_state = self.state().await;
                info!(
                    restarts = report.restarts,
                    fetches = report.fetches.len(),
                    transactions = report.transactions.len(),
                    state = %report.final_state,
                    "Bootstrap finished"
                );
                Ok(report)
            }
            Err(err) if err.is_cancelled() || session.is_cancelled() => {
                debug!("Bootstrap abandoned: session signed off");
                Err(SyncError::Cancelled)
            }
            Err(err) => {
                let reset = self
                    .guard
                    .control(&session, |control, _| {
                        control.sync_state = SyncState::Unsynchronized;
                        control.pending.retain(|_, batch| !batch.initial);
                    })
                    .await;
                match reset {
                    Ok(()) => {}
                    Err(SyncError::Cancelled) => debug!("State already reset by sign-off"),
                    Err(reset_err) => warn!(error = %reset_err, "Failed to reset bootstrap state"),
                }
                let operation = match &err {
                    SyncError::Service { operation, .. }
                    | SyncError::RecoveryExhausted { operation, .. } => operation.clone(),
                    _ => "bootstrap".to_string(),
                };
                error!(%operation, error = %err, "Bootstrap failed");
                self.emit(RosterEvent::ServiceOperationFailed {
                    operation,
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn run_bootstrap(
        &self,
        session: &CancellationToken,
        report: &mut BootstrapReport,
    ) -> Result<(), SyncError> {
        let mut step = BootstrapStep::Load;
        loop {
            debug!(?step, "Bootstrap step");
            let outcome = match step {
                BootstrapStep::Load => {
                    self.load(session, report).await?;
                    Ok(if self.auto_sync {
                        BootstrapStep::FetchMembership
                    } else {
                        BootstrapStep::ApplyProfile
                    })
                }
                BootstrapStep::FetchMembership => self
                    .sync_membership(session, Scenario::Initial, false, Some(&mut *report))
                    .await
                    .map(|_| BootstrapStep::FetchAddressBook),
                BootstrapStep::FetchAddressBook => self
                    .sync_address_book(session, Scenario::Initial, false, Some(&mut *report))
                    .await
                    .map(|_| BootstrapStep::FetchCircleBooks),
                BootstrapStep::FetchCircleBooks => self
                    .sync_circle_books(session, Scenario::Initial, false, Some(&mut *report))
                    .await
                    .map(|_| BootstrapStep::ApplyProfile),
                BootstrapStep::ApplyProfile => {
                    self.apply_profile(session).await?;
                    if !self.auto_sync {
                        return self.skip_remote(session).await;
                    }
                    Ok(BootstrapStep::Announce)
                }
                BootstrapStep::Announce => return self.announce(session, report).await,
            };

            step = match outcome {
                Ok(next) => next,
                Err(StepFailure::Fatal(err)) => return Err(err),
                Err(StepFailure::Fault(operation, fault)) => {
                    self.recover(session, operation, fault, report).await?
                }
            };
        }
    }

    async fn load(
        &self,
        session: &CancellationToken,
        report: &mut BootstrapReport,
    ) -> Result<(), SyncError> {
        let store = Arc::clone(self.guard.store());
        let account = self.guard.account();
        let mut discarded = false;

        loop {
            let outcome = store.load(account).await.map_err(SyncError::Storage)?;
            match outcome {
                LoadOutcome::Absent => {
                    debug!("Starting from an empty roster");
                    return self
                        .guard
                        .replace_cache(session, RosterCache::new(), DeltaJournal::new())
                        .await;
                }
                LoadOutcome::Loaded(stored) => {
                    debug!(contacts = stored.cache.contacts().len(), "Roster loaded");
                    return self
                        .guard
                        .replace_cache(session, stored.cache, stored.journal)
                        .await;
                }
                LoadOutcome::Unreadable { .. } if session.is_cancelled() => {
                    return Err(SyncError::Cancelled);
                }
                LoadOutcome::Unreadable { reason } if !discarded => {
                    warn!(%reason, "Stored roster unusable, discarding");
                    store.discard(account).await.map_err(SyncError::Storage)?;
                    discarded = true;
                    report.cache_discards += 1;
                }
                LoadOutcome::Unreadable { reason } => {
                    return Err(SyncError::Storage(anyhow::anyhow!(
                        "Stored roster still unreadable after discard: {reason}"
                    )));
                }
            }
        }
    }

    async fn recover(
        &self,
        session: &CancellationToken,
        operation: &'static str,
        fault: ServiceFault,
        report: &mut BootstrapReport,
    ) -> Result<BootstrapStep, SyncError> {
        if session.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let attempts = self.guard.read(|control, _| control.recursive_attempt).await;
        let action = recovery::decide(
            &fault,
            RecoveryContext::Bootstrap,
            attempts,
            self.max_recovery_attempts,
        );
        warn!(operation, code = fault.code(), attempt = attempts, ?action, "Bootstrap fault");

        match action {
            RecoveryAction::RestartFromScratch => {
                self.guard
                    .store()
                    .discard(self.guard.account())
                    .await
                    .map_err(SyncError::Storage)?;
                self.guard
                    .replace_cache(session, RosterCache::new(), DeltaJournal::new())
                    .await?;
                report.cache_discards += 1;
            }
            RecoveryAction::CreateAddressBookThenRestart => {
                self.membership
                    .create_address_book()
                    .await
                    .map_err(|fault| SyncError::Service {
                        operation: "create_address_book".to_string(),
                        fault,
                    })?;
            }
            _ if recovery::is_recoverable(&fault) => {
                return Err(SyncError::RecoveryExhausted {
                    operation: operation.to_string(),
                    attempts,
                    fault,
                });
            }
            _ => {
                return Err(SyncError::Service {
                    operation: operation.to_string(),
                    fault,
                });
            }
        }

        self.guard
            .control(session, |control, _| control.recursive_attempt += 1)
            .await?;
        report.restarts += 1;
        Ok(BootstrapStep::Load)
    }

    async fn apply_profile(&self, session: &CancellationToken) -> Result<(), SyncError> {
        self.guard
            .commit(session, |w| {
                if let Some(profile) = w.journal.profile() {
                    let mut owner = w.cache.owner().clone();
                    profile.apply_to(&mut owner);
                    w.cache.set_owner(owner);
                }
                w.journal.truncate();
                Ok(())
            })
            .await
    }

    async fn skip_remote(&self, session: &CancellationToken) -> Result<(), SyncError> {
        let first = self
            .guard
            .control(session, |control, _| {
                control.sync_state = control.sync_state.transition(SyncTransition::SkipRemote)?;
                Ok::<_, SyncError>(!std::mem::replace(&mut control.signed_in, true))
            })
            .await??;
        info!("Automatic synchronization disabled, signed in from the local roster");
        if first {
            self.emit(RosterEvent::SignedIn);
        }
        Ok(())
    }

    // ========================================================================
    // Fetch and merge
    // ========================================================================

    async fn sync_membership(
        &self,
        session: &CancellationToken,
        scenario: Scenario,
        force_full: bool,
        report: Option<&mut BootstrapReport>,
    ) -> Result<Vec<RosterEvent>, StepFailure> {
        let mode = if force_full {
            FetchMode::Full
        } else {
            let last_change = self.guard.with_cache(|c| c.membership_last_change()).await;
            FetchMode::for_last_change(last_change)
        };
        if let Some(report) = report {
            report.fetches.push(FetchRecord {
                step: BootstrapStep::FetchMembership,
                book: None,
                full: mode.is_full(),
            });
        }

        debug!(scenario = scenario.as_str(), full = mode.is_full(), "Fetching membership");
        let snapshot = self
            .membership
            .fetch_membership(scenario, mode)
            .await
            .map_err(|fault| StepFailure::Fault("fetch_membership", fault))?;

        let events = self
            .guard
            .commit(session, |w| {
                Ok(merge::merge_membership(
                    &mut w.cache,
                    &mut w.journal,
                    &snapshot,
                    mode,
                ))
            })
            .await?;
        debug!(rows = snapshot.members.len(), changes = events.len(), "Membership merged");
        Ok(events)
    }

    async fn sync_address_book(
        &self,
        session: &CancellationToken,
        scenario: Scenario,
        force_full: bool,
        report: Option<&mut BootstrapReport>,
    ) -> Result<Vec<RosterEvent>, StepFailure> {
        let book = AddressBookId::default_book();
        let mode = if force_full {
            FetchMode::Full
        } else {
            let last_change = self
                .guard
                .with_cache(|c| c.address_book_last_change(&book))
                .await;
            FetchMode::for_last_change(last_change)
        };
        if let Some(report) = report {
            report.fetches.push(FetchRecord {
                step: BootstrapStep::FetchAddressBook,
                book: Some(book),
                full: mode.is_full(),
            });
        }

        debug!(scenario = scenario.as_str(), full = mode.is_full(), "Fetching address book");
        let snapshot = self
            .membership
            .fetch_address_book(scenario, book, mode)
            .await
            .map_err(|fault| StepFailure::Fault("fetch_address_book", fault))?;

        let events = self
            .guard
            .commit(session, |w| {
                Ok(merge::merge_address_book(
                    &mut w.cache,
                    &mut w.journal,
                    &snapshot,
                    mode,
                ))
            })
            .await?;
        debug!(rows = snapshot.contacts.len(), changes = events.len(), "Address book merged");
        Ok(events)
    }

    async fn sync_circle_books(
        &self,
        session: &CancellationToken,
        scenario: Scenario,
        force_full: bool,
        mut report: Option<&mut BootstrapReport>,
    ) -> Result<Vec<RosterEvent>, StepFailure> {
        let circles: Vec<(CircleId, FetchMode)> = self
            .guard
            .with_cache(|cache| {
                cache
                    .circles()
                    .values()
                    .filter(|circle| circle.is_accepted())
                    .map(|circle| {
                        let book = AddressBookId::for_circle(circle.id());
                        let mode = if force_full {
                            FetchMode::Full
                        } else {
                            FetchMode::for_last_change(cache.address_book_last_change(&book))
                        };
                        (*circle.id(), mode)
                    })
                    .collect()
            })
            .await;

        let mut events = Vec::new();
        for (id, mode) in circles {
            let book = AddressBookId::for_circle(&id);
            if let Some(report) = report.as_deref_mut() {
                report.fetches.push(FetchRecord {
                    step: BootstrapStep::FetchCircleBooks,
                    book: Some(book),
                    full: mode.is_full(),
                });
            }
            events.extend(self.sync_circle_book(session, scenario, &id, mode).await?);
        }
        Ok(events)
    }

    pub(crate) async fn sync_circle_book(
        &self,
        session: &CancellationToken,
        scenario: Scenario,
        circle: &CircleId,
        mode: FetchMode,
    ) -> Result<Vec<RosterEvent>, StepFailure> {
        debug!(%circle, full = mode.is_full(), "Fetching circle book");
        let snapshot = self
            .membership
            .fetch_address_book(scenario, AddressBookId::for_circle(circle), mode)
            .await
            .map_err(|fault| StepFailure::Fault("fetch_circle_book", fault))?;

        let events = self
            .guard
            .commit(session, |w| {
                // The circle may have been left while the fetch was in flight
                if w.cache.circle(circle).is_none() {
                    return Ok(Vec::new());
                }
                Ok(merge::merge_circle_book(
                    &mut w.cache,
                    &mut w.journal,
                    circle,
                    &snapshot,
                    mode,
                )?)
            })
            .await?;
        Ok(events)
    }

    // ========================================================================
    // Announcement and acknowledgments
    // ========================================================================

    async fn announce(
        &self,
        session: &CancellationToken,
        report: &mut BootstrapReport,
    ) -> Result<(), SyncError> {
        let (contacts, circles) = self
            .guard
            .control(session, |_, cache| {
                let mut contacts = BTreeMap::new();
                for contact in cache.contacts_mut() {
                    let lists = contact.lists() & RoleLists::ANNOUNCED;
                    if contact.client_type() == ClientType::Circle
                        || lists.is_empty()
                        || contact.pending_announcements() > 0
                    {
                        continue;
                    }
                    contact.announcement_queued();
                    contacts.insert(contact.hash().clone(), lists);
                }
                let circles: BTreeMap<ContactHash, RoleLists> = cache
                    .circles()
                    .values()
                    .filter(|circle| circle.is_accepted())
                    .map(|circle| (circle.contact_hash(), CIRCLE_ANNOUNCED_LISTS))
                    .collect();
                (contacts, circles)
            })
            .await?;

        // Contacts strictly before circles
        let mut transactions = self
            .queue_batch(session, WireCommand::Adl, &contacts, true)
            .await?;
        if !circles.is_empty() {
            transactions.extend(
                self.queue_batch(session, WireCommand::Adl, &circles, true)
                    .await?,
            );
        }
        info!(
            contacts = contacts.len(),
            circles = circles.len(),
            transactions = transactions.len(),
            "Initial batches queued"
        );
        report.transactions = transactions;

        let completion = self
            .guard
            .control(session, |control, _| {
                control.sync_state = control
                    .sync_state
                    .transition(SyncTransition::BatchesQueued)?;
                Ok::<_, SyncError>(try_complete(control))
            })
            .await??;

        if let Some(first) = completion {
            self.finish_synchronization(session, first).await?;
        }
        Ok(())
    }

    /// Builds the batches for `entries`, records them as pending and sends them
    ///
    /// A batch is recorded before it is sent so that an acknowledgment can
    /// never outrun its bookkeeping.
    pub(crate) async fn queue_batch(
        &self,
        session: &CancellationToken,
        command: WireCommand,
        entries: &BTreeMap<ContactHash, RoleLists>,
        initial: bool,
    ) -> Result<Vec<TransactionId>, SyncError> {
        let mut transactions = Vec::new();
        for batch in build_wire_batches(entries, initial) {
            let trid = self.channel.next_transaction_id();
            let pending = PendingBatch {
                command,
                payload: batch.payload.clone(),
                contacts: batch.contacts,
                initial,
            };
            self.guard
                .control(session, |control, _| control.pending.insert(trid, pending))
                .await?;

            if let Err(err) = self.channel.send_command(command, trid, &batch.payload).await {
                let dropped = self
                    .guard
                    .control(session, |control, _| control.pending.remove(&trid))
                    .await;
                match dropped {
                    Ok(_) => {}
                    Err(SyncError::Cancelled) => {
                        debug!(%trid, "Pending map already cleared by sign-off")
                    }
                    Err(drop_err) => {
                        warn!(%trid, error = %drop_err, "Failed to drop unsent batch")
                    }
                }
                return Err(SyncError::Channel(err));
            }
            debug!(%command, %trid, bytes = batch.payload.len(), initial, "Batch sent");
            transactions.push(trid);
        }
        Ok(transactions)
    }

    /// Sends a single-entry batch that is not part of the bootstrap
    pub(crate) async fn send_single(
        &self,
        session: &CancellationToken,
        command: WireCommand,
        hash: &ContactHash,
        lists: RoleLists,
    ) -> Result<(), SyncError> {
        let entries = BTreeMap::from([(hash.clone(), lists)]);
        self.queue_batch(session, command, &entries, false).await?;
        Ok(())
    }

    /// Handles an acknowledgment from the notification server
    ///
    /// Removing the transaction, checking for remaining initial batches and
    /// leaving `AwaitingAcknowledgment` happen in one critical section, so
    /// completion is signalled exactly once. Only initial batches hold
    /// completion back; a mutation batch queued while the initial ones are
    /// outstanding stays pending after `Synchronized` is entered.
    ///
    /// Returns `false` for a transaction id that is not pending.
    #[tracing::instrument(skip(self))]
    pub async fn on_command_acknowledged(&self, trid: TransactionId) -> Result<bool, SyncError> {
        let session = self.guard.session().await;
        let (known, completion) = self
            .guard
            .control(&session, |control, cache| {
                let Some(batch) = control.pending.remove(&trid) else {
                    return (false, None);
                };
                if batch.initial {
                    for hash in &batch.contacts {
                        if let Some(contact) = cache.contact_mut(hash) {
                            contact.announcement_acknowledged();
                        }
                    }
                }
                (true, try_complete(control))
            })
            .await?;

        if !known {
            warn!(%trid, "Acknowledgment for unknown transaction");
            return Ok(false);
        }
        if let Some(first) = completion {
            self.finish_synchronization(&session, first).await?;
        }
        Ok(true)
    }

    /// Handles a server error reply for a sent batch
    ///
    /// The batch leaves the pending map and `ServiceOperationFailed` is
    /// published. Rejecting an initial batch aborts the bootstrap: the
    /// remaining initial batches are dropped and the engine returns to
    /// `Unsynchronized`, ready for another [`bootstrap`](Self::bootstrap).
    ///
    /// Returns `false` for a transaction id that is not pending.
    #[tracing::instrument(skip(self))]
    pub async fn on_command_rejected(
        &self,
        trid: TransactionId,
        code: u16,
    ) -> Result<bool, SyncError> {
        let session = self.guard.session().await;
        let rejected = self
            .guard
            .control(&session, |control, cache| {
                let batch = control.pending.remove(&trid)?;
                let aborted = batch.initial
                    && control.sync_state == SyncState::AwaitingAcknowledgment;
                if aborted {
                    control.pending.retain(|_, pending| !pending.initial);
                    control.sync_state = control
                        .sync_state
                        .transition(SyncTransition::Abort)
                        .unwrap_or(SyncState::Unsynchronized);
                    cache.reset_announcements();
                }
                Some((batch.command, aborted))
            })
            .await?;

        let Some((command, aborted)) = rejected else {
            warn!(%trid, code, "Error reply for unknown transaction");
            return Ok(false);
        };

        let reason = format!("Notification server rejected {command} {trid} with error {code}");
        if aborted {
            error!(%command, %trid, code, "Initial batch rejected, bootstrap aborted");
        } else {
            warn!(%command, %trid, code, "Batch rejected");
        }
        self.emit(RosterEvent::ServiceOperationFailed {
            operation: if aborted {
                "bootstrap".to_string()
            } else {
                command.as_str().to_string()
            },
            reason,
        });
        Ok(true)
    }

    async fn finish_synchronization(
        &self,
        session: &CancellationToken,
        first_sign_in: bool,
    ) -> Result<(), SyncError> {
        let reconciled = self
            .guard
            .commit(session, |w| Ok(merge::reconcile_pending(&mut w.cache)))
            .await?;

        info!("Synchronization completed");
        if first_sign_in {
            self.emit(RosterEvent::SignedIn);
        }
        self.emit(RosterEvent::SynchronizationCompleted);
        self.emit_all(reconciled);
        Ok(())
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    /// Re-fetches the membership and address books after sign-in
    ///
    /// Changes are published as they are committed and returned. Circles
    /// joined or left during the refresh are announced or withdrawn.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidState` before the initial batches are
    /// queued, and the terminal error otherwise.
    #[tracing::instrument(skip(self))]
    pub async fn refresh_address_book(
        &self,
        scenario: Scenario,
    ) -> Result<Vec<RosterEvent>, SyncError> {
        let session = self.guard.session().await;
        let state = self.state().await;
        if !matches!(
            state,
            SyncState::Synchronized | SyncState::AwaitingAcknowledgment
        ) {
            return Err(DomainError::InvalidState {
                from: state.name().to_string(),
                to: "refresh".to_string(),
            }
            .into());
        }

        let mut published = Vec::new();
        let mut attempts = 0;
        let mut force_full = false;
        loop {
            match self
                .refresh_once(&session, scenario, force_full, &mut published)
                .await
            {
                Ok(()) => break,
                Err(StepFailure::Fatal(err)) => return Err(err),
                Err(StepFailure::Fault(operation, fault)) => {
                    let action = recovery::decide(
                        &fault,
                        RecoveryContext::Refresh,
                        attempts,
                        self.max_recovery_attempts,
                    );
                    warn!(
                        operation,
                        code = fault.code(),
                        attempt = attempts,
                        ?action,
                        "Refresh fault"
                    );
                    match action {
                        RecoveryAction::RestartFromScratch => force_full = true,
                        RecoveryAction::CreateAddressBookThenRestart => {
                            if let Err(fault) = self.membership.create_address_book().await {
                                return Err(self.fail(
                                    &session,
                                    "create_address_book",
                                    fault,
                                ));
                            }
                        }
                        _ => return Err(self.fail(&session, operation, fault)),
                    }
                    attempts += 1;
                }
            }
        }

        self.announce_circle_changes(&session, &published).await?;
        info!(changes = published.len(), "Refresh finished");
        Ok(published)
    }

    async fn refresh_once(
        &self,
        session: &CancellationToken,
        scenario: Scenario,
        force_full: bool,
        published: &mut Vec<RosterEvent>,
    ) -> Result<(), StepFailure> {
        let events = self
            .sync_membership(session, scenario, force_full, None)
            .await?;
        self.publish(events, published);
        let events = self
            .sync_address_book(session, scenario, force_full, None)
            .await?;
        self.publish(events, published);
        let events = self
            .sync_circle_books(session, scenario, force_full, None)
            .await?;
        self.publish(events, published);
        Ok(())
    }

    /// Re-fetches the default address book only
    pub(crate) async fn refresh_default_book(
        &self,
        session: &CancellationToken,
        scenario: Scenario,
    ) -> Result<Vec<RosterEvent>, SyncError> {
        let mut published = Vec::new();
        match self.sync_address_book(session, scenario, false, None).await {
            Ok(events) => self.publish(events, &mut published),
            Err(StepFailure::Fatal(err)) => return Err(err),
            Err(StepFailure::Fault(operation, fault)) => {
                return Err(self.fail(session, operation, fault))
            }
        }
        self.announce_circle_changes(session, &published).await?;
        Ok(published)
    }

    /// Fetches and merges the book of one circle
    pub(crate) async fn refresh_circle_book(
        &self,
        session: &CancellationToken,
        scenario: Scenario,
        circle: &CircleId,
    ) -> Result<(), SyncError> {
        let last_change = self
            .guard
            .with_cache(|c| c.address_book_last_change(&AddressBookId::for_circle(circle)))
            .await;
        let mode = FetchMode::for_last_change(last_change);
        match self.sync_circle_book(session, scenario, circle, mode).await {
            Ok(events) => {
                self.emit_all(events);
                Ok(())
            }
            Err(StepFailure::Fatal(err)) => Err(err),
            Err(StepFailure::Fault(operation, fault)) => Err(self.fail(session, operation, fault)),
        }
    }

    fn publish(&self, events: Vec<RosterEvent>, published: &mut Vec<RosterEvent>) {
        for event in events {
            self.emit(event.clone());
            published.push(event);
        }
    }

    async fn announce_circle_changes(
        &self,
        session: &CancellationToken,
        events: &[RosterEvent],
    ) -> Result<(), SyncError> {
        for event in events {
            let (command, circle) = match event {
                RosterEvent::CircleJoined { circle } => (WireCommand::Adl, circle),
                RosterEvent::CircleLeft { circle } => (WireCommand::Rml, circle),
                _ => continue,
            };
            let hash = ContactHash::for_circle(circle, CIRCLE_HOST_DOMAIN);
            self.send_single(session, command, &hash, CIRCLE_ANNOUNCED_LISTS)
                .await?;
        }
        Ok(())
    }

    /// Spawns a task refreshing the roster every `sync.refresh_interval_secs`
    ///
    /// The task ends when the current session is signed off.
    pub async fn spawn_refresh_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let session = self.guard.session().await;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.refresh_interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = session.cancelled() => {
                        debug!("Refresh loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.refresh_address_book(Scenario::Timer).await {
                            Ok(_) => {}
                            Err(err) if err.is_cancelled() => break,
                            Err(SyncError::Domain(err)) => debug!(error = %err, "Refresh skipped"),
                            Err(err) => warn!(error = %err, "Periodic refresh failed"),
                        }
                    }
                }
            }
        })
    }

    // ========================================================================
    // Session control
    // ========================================================================

    /// Ends the session
    ///
    /// In-flight flows stop at their next guarded step without touching
    /// the roster or publishing events. A later [`bootstrap`](Self::bootstrap)
    /// starts a new session from the stored roster.
    #[tracing::instrument(skip(self), fields(account = %self.account()))]
    pub async fn sign_off(&self) {
        let pending = self.guard.read(|control, _| control.pending.len()).await;
        self.guard.sign_off().await;
        info!(dropped_transactions = pending, "Signed off");
    }
}

/// Leaves `AwaitingAcknowledgment` once no initial batch is pending
///
/// Returns `Some(first_sign_in)` when the transition happened.
fn try_complete(control: &mut SessionControl) -> Option<bool> {
    if control.sync_state != SyncState::AwaitingAcknowledgment || control.has_pending_initial() {
        return None;
    }
    control.sync_state = control
        .sync_state
        .transition(SyncTransition::AllAcknowledged)
        .ok()?;
    Some(!std::mem::replace(&mut control.signed_in, true))
}
