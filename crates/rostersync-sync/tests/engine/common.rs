//! Shared fakes for engine integration tests
//!
//! The fakes keep their state behind `std::sync::Mutex` and record every
//! call so tests can assert on what reached the remote side.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{broadcast, Notify};

use rostersync_core::config::ConfigBuilder;
use rostersync_core::domain::{
    never_changed, Account, AddressBookId, CircleId, CircleRole, CircleState, ClientType,
    ContactGuid, ContactHash, DeltaJournal, GroupId, RoleLists, RosterCache, RosterEvent,
    ServiceCategory, ServiceFault, ServiceHandle, TransactionId,
};
use rostersync_core::ports::{
    AbContactEntry, AddressBookSnapshot, CircleEntry, ContactUpdate, FetchMode,
    IMembershipService, INotificationChannel, IRosterStore, LoadOutcome, MemberEntry,
    MemberRecord, MembershipSnapshot, NewContactRequest, Scenario, StoredRoster, WireCommand,
};
use rostersync_sync::RosterEngine;

// ============================================================================
// Membership service
// ============================================================================

/// Remote books served by [`FakeMembershipService`]
pub struct RemoteBooks {
    pub membership: MembershipSnapshot,
    pub address_book: AddressBookSnapshot,
    pub circle_books: HashMap<CircleId, AddressBookSnapshot>,
    next_service_id: u64,
}

fn empty_book(book: AddressBookId) -> AddressBookSnapshot {
    AddressBookSnapshot {
        book,
        contacts: Vec::new(),
        groups: Vec::new(),
        circles: Vec::new(),
        profile: None,
        cache_key: None,
        last_change: Utc::now(),
    }
}

impl Default for RemoteBooks {
    fn default() -> Self {
        Self {
            membership: MembershipSnapshot {
                services: Vec::new(),
                members: Vec::new(),
                last_change: Utc::now(),
            },
            address_book: empty_book(AddressBookId::default_book()),
            circle_books: HashMap::new(),
            next_service_id: 1,
        }
    }
}

/// Holds one remote call until the test releases it
#[derive(Default)]
pub struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    /// Waits until the held call has started
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Lets the held call continue
    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// Scriptable membership service
#[derive(Default)]
pub struct FakeMembershipService {
    pub books: Mutex<RemoteBooks>,
    faults: Mutex<HashMap<&'static str, VecDeque<ServiceFault>>>,
    gates: Mutex<HashMap<&'static str, Arc<Gate>>>,
    calls: Mutex<Vec<&'static str>>,
}

impl FakeMembershipService {
    /// Holds the next call of `operation` until the returned gate is released
    pub fn hold(&self, operation: &'static str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.gates
            .lock()
            .unwrap()
            .insert(operation, Arc::clone(&gate));
        gate
    }

    /// Makes the next call of `operation` fail with `fault`; repeat to queue more
    pub fn fail_next(&self, operation: &'static str, fault: ServiceFault) {
        self.faults
            .lock()
            .unwrap()
            .entry(operation)
            .or_default()
            .push_back(fault);
    }

    /// Returns every call made so far, in order
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    /// Returns how often `operation` was called
    pub fn count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| **call == operation)
            .count()
    }

    /// Adds a membership row
    pub fn add_member_row(&self, hash: &ContactHash, list: RoleLists) {
        self.books.lock().unwrap().membership.members.push(MemberEntry {
            hash: hash.clone(),
            list,
            deleted: false,
            display_name: None,
            invitation: None,
        });
    }

    /// Adds a pending membership row carrying an invitation
    pub fn add_pending_row(&self, hash: &ContactHash, invitation: &str) {
        self.books.lock().unwrap().membership.members.push(MemberEntry {
            hash: hash.clone(),
            list: RoleLists::PENDING,
            deleted: false,
            display_name: None,
            invitation: Some(invitation.to_string()),
        });
    }

    /// Registers a service for `category`
    pub fn add_service_row(&self, category: ServiceCategory) {
        let mut books = self.books.lock().unwrap();
        let id = books.next_service_id;
        books.next_service_id += 1;
        books.membership.services.push(ServiceHandle {
            id,
            category,
            last_change: never_changed(),
        });
    }

    /// Adds a messenger contact to the default book and returns its guid
    pub fn add_contact_row(&self, hash: &ContactHash) -> ContactGuid {
        let guid = ContactGuid::new();
        self.books
            .lock()
            .unwrap()
            .address_book
            .contacts
            .push(contact_row(guid, hash));
        guid
    }

    /// Adds a circle to the default book
    pub fn add_circle_row(&self, name: &str, state: CircleState) -> CircleId {
        let id = CircleId::new();
        let mut books = self.books.lock().unwrap();
        books.address_book.circles.push(CircleEntry {
            id,
            display_name: name.to_string(),
            state,
            role: CircleRole::Member,
            deleted: false,
        });
        books
            .circle_books
            .insert(id, empty_book(AddressBookId::for_circle(&id)));
        id
    }

    /// Adds a member row to a circle book
    pub fn add_circle_member_row(&self, circle: &CircleId, hash: &ContactHash) {
        let mut books = self.books.lock().unwrap();
        let book = books
            .circle_books
            .entry(*circle)
            .or_insert_with(|| empty_book(AddressBookId::for_circle(circle)));
        let mut row = contact_row(ContactGuid::new(), hash);
        row.circle_lists = RoleLists::FORWARD | RoleLists::ALLOW;
        book.contacts.push(row);
    }

    async fn record(&self, operation: &'static str) -> Result<(), ServiceFault> {
        let gate = self.gates.lock().unwrap().remove(operation);
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        self.calls.lock().unwrap().push(operation);
        match self
            .faults
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

fn contact_row(guid: ContactGuid, hash: &ContactHash) -> AbContactEntry {
    AbContactEntry {
        guid,
        hash: hash.clone(),
        display_name: None,
        is_messenger_user: true,
        groups: Vec::new(),
        circle_lists: RoleLists::empty(),
        deleted: false,
    }
}

#[async_trait::async_trait]
impl IMembershipService for FakeMembershipService {
    async fn fetch_membership(
        &self,
        _scenario: Scenario,
        _mode: FetchMode,
    ) -> Result<MembershipSnapshot, ServiceFault> {
        self.record("fetch_membership").await?;
        Ok(self.books.lock().unwrap().membership.clone())
    }

    async fn fetch_address_book(
        &self,
        _scenario: Scenario,
        book: AddressBookId,
        _mode: FetchMode,
    ) -> Result<AddressBookSnapshot, ServiceFault> {
        if book.is_default() {
            self.record("fetch_address_book").await?;
            return Ok(self.books.lock().unwrap().address_book.clone());
        }
        self.record("fetch_circle_book").await?;
        let snapshot = self
            .books
            .lock()
            .unwrap()
            .circle_books
            .get(&CircleId::from_uuid(*book.as_uuid()))
            .cloned()
            .unwrap_or_else(|| empty_book(book));
        Ok(snapshot)
    }

    async fn create_address_book(&self) -> Result<(), ServiceFault> {
        self.record("create_address_book").await
    }

    async fn add_service(&self, category: ServiceCategory) -> Result<ServiceHandle, ServiceFault> {
        self.record("add_service").await?;
        let mut books = self.books.lock().unwrap();
        let id = books.next_service_id;
        books.next_service_id += 1;
        Ok(ServiceHandle {
            id,
            category,
            last_change: never_changed(),
        })
    }

    async fn create_contact(&self, request: &NewContactRequest) -> Result<ContactGuid, ServiceFault> {
        self.record("create_contact").await?;
        Ok(self.add_contact_row(&request.hash))
    }

    async fn update_contact(
        &self,
        _guid: &ContactGuid,
        _update: &ContactUpdate,
    ) -> Result<(), ServiceFault> {
        self.record("update_contact").await
    }

    async fn add_member(
        &self,
        _service: &ServiceHandle,
        _list: RoleLists,
        _member: &MemberRecord,
    ) -> Result<(), ServiceFault> {
        self.record("add_member").await
    }

    async fn delete_member(
        &self,
        _service: &ServiceHandle,
        _list: RoleLists,
        _member: &MemberRecord,
    ) -> Result<(), ServiceFault> {
        self.record("delete_member").await
    }

    async fn break_connection(&self, guid: &ContactGuid, _block: bool) -> Result<(), ServiceFault> {
        self.record("break_connection").await?;
        let mut books = self.books.lock().unwrap();
        for row in &mut books.address_book.contacts {
            if row.guid == *guid {
                row.deleted = true;
            }
        }
        Ok(())
    }

    async fn add_group(&self, _name: &str) -> Result<GroupId, ServiceFault> {
        self.record("add_group").await?;
        Ok(GroupId::new())
    }

    async fn delete_group(&self, _group: &GroupId) -> Result<(), ServiceFault> {
        self.record("delete_group").await
    }

    async fn rename_group(&self, _group: &GroupId, _name: &str) -> Result<(), ServiceFault> {
        self.record("rename_group").await
    }

    async fn add_contact_to_group(
        &self,
        _contact: &ContactGuid,
        _group: &GroupId,
    ) -> Result<(), ServiceFault> {
        self.record("add_contact_to_group").await
    }

    async fn delete_contact_from_group(
        &self,
        _contact: &ContactGuid,
        _group: &GroupId,
    ) -> Result<(), ServiceFault> {
        self.record("delete_contact_from_group").await
    }

    async fn create_circle(&self, _name: &str) -> Result<CircleId, ServiceFault> {
        self.record("create_circle").await?;
        Ok(CircleId::new())
    }

    async fn invite_circle_member(
        &self,
        _circle: &CircleId,
        _member: &ContactHash,
        _message: Option<&str>,
    ) -> Result<(), ServiceFault> {
        self.record("invite_circle_member").await
    }

    async fn respond_circle_invitation(
        &self,
        _circle: &CircleId,
        _accept: bool,
    ) -> Result<(), ServiceFault> {
        self.record("respond_circle_invitation").await
    }

    async fn exit_circle(&self, _circle: &CircleId) -> Result<(), ServiceFault> {
        self.record("exit_circle").await
    }
}

// ============================================================================
// Notification channel
// ============================================================================

/// A frame handed to the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCommand {
    pub command: WireCommand,
    pub trid: TransactionId,
    pub payload: String,
}

/// Channel recording every frame it is asked to send
pub struct FakeChannel {
    next: AtomicU32,
    fail: AtomicBool,
    sent: Mutex<Vec<SentCommand>>,
}

impl Default for FakeChannel {
    fn default() -> Self {
        Self {
            next: AtomicU32::new(1),
            fail: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }
}

impl FakeChannel {
    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl INotificationChannel for FakeChannel {
    fn next_transaction_id(&self) -> TransactionId {
        TransactionId::new(self.next.fetch_add(1, Ordering::SeqCst))
    }

    async fn send_command(
        &self,
        command: WireCommand,
        trid: TransactionId,
        payload: &str,
    ) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("connection reset");
        }
        self.sent.lock().unwrap().push(SentCommand {
            command,
            trid,
            payload: payload.to_string(),
        });
        Ok(())
    }
}

// ============================================================================
// Roster store
// ============================================================================

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    stored: Mutex<Option<StoredRoster>>,
    unreadable: AtomicBool,
    failing_saves: AtomicBool,
    saves: AtomicU32,
    discards: AtomicU32,
}

impl MemoryStore {
    /// Makes the next load report an unreadable record
    pub fn corrupt(&self) {
        self.unreadable.store(true, Ordering::SeqCst);
    }

    /// Makes every save fail until reset
    pub fn set_failing_saves(&self, fail: bool) {
        self.failing_saves.store(fail, Ordering::SeqCst);
    }

    pub fn stored(&self) -> Option<StoredRoster> {
        self.stored.lock().unwrap().clone()
    }

    pub fn put(&self, cache: RosterCache) {
        *self.stored.lock().unwrap() = Some(StoredRoster {
            cache,
            journal: DeltaJournal::new(),
        });
    }

    pub fn saves(&self) -> u32 {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn discards(&self) -> u32 {
        self.discards.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl IRosterStore for MemoryStore {
    async fn load(&self, _account: &Account) -> anyhow::Result<LoadOutcome> {
        if self.unreadable.load(Ordering::SeqCst) {
            return Ok(LoadOutcome::Unreadable {
                reason: "schema version 1".to_string(),
            });
        }
        Ok(match self.stored() {
            Some(stored) => LoadOutcome::Loaded(stored),
            None => LoadOutcome::Absent,
        })
    }

    async fn save(
        &self,
        _account: &Account,
        cache: &RosterCache,
        journal: &DeltaJournal,
    ) -> anyhow::Result<()> {
        if self.failing_saves.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.stored.lock().unwrap() = Some(StoredRoster {
            cache: cache.clone(),
            journal: journal.clone(),
        });
        Ok(())
    }

    async fn discard(&self, _account: &Account) -> anyhow::Result<()> {
        self.discards.fetch_add(1, Ordering::SeqCst);
        self.unreadable.store(false, Ordering::SeqCst);
        *self.stored.lock().unwrap() = None;
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Engine wired to the fakes
pub struct Harness {
    pub engine: Arc<RosterEngine>,
    pub membership: Arc<FakeMembershipService>,
    pub channel: Arc<FakeChannel>,
    pub store: Arc<MemoryStore>,
}

/// Builds an engine with automatic synchronization enabled
pub fn harness() -> Harness {
    harness_with(ConfigBuilder::new(), MemoryStore::default())
}

/// Builds an engine from a config builder and a prepared store
pub fn harness_with(config: ConfigBuilder, store: MemoryStore) -> Harness {
    let membership = Arc::new(FakeMembershipService::default());
    let channel = Arc::new(FakeChannel::default());
    let store = Arc::new(store);
    let engine = RosterEngine::new(
        owner(),
        membership.clone(),
        channel.clone(),
        store.clone(),
        &config.build(),
    );
    Harness {
        engine: Arc::new(engine),
        membership,
        channel,
        store,
    }
}

impl Harness {
    /// Bootstraps and acknowledges every initial batch
    pub async fn synchronize(&self) {
        let report = self.engine.bootstrap().await.unwrap();
        for trid in report.transactions {
            self.engine.on_command_acknowledged(trid).await.unwrap();
        }
        self.channel.clear();
    }
}

pub fn owner() -> Account {
    Account::new("owner@example.com").unwrap()
}

pub fn contact(account: &str) -> ContactHash {
    ContactHash::new(ClientType::WindowsLive, account).unwrap()
}

/// Collects every event published so far
pub fn drain(events: &mut broadcast::Receiver<RosterEvent>) -> Vec<RosterEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Counts events matching `name`
pub fn count(events: &[RosterEvent], name: &str) -> usize {
    events.iter().filter(|event| event.name() == name).count()
}
