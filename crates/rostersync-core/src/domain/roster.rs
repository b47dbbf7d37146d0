//! Local Cache Store document
//!
//! [`RosterCache`] is the versioned document holding everything the engine
//! knows about the owner's roster: contacts, groups, circles, remote
//! service handles, the owner profile and per-book change timestamps.
//!
//! ## Timestamps
//!
//! Every book carries a last-change timestamp. The UNIX epoch is the
//! "never changed" sentinel: a book at the sentinel needs a full fetch,
//! any other value allows a delta fetch. Setters never move a timestamp
//! backwards.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::contact::{Contact, ContactHash, RoleLists};
use super::errors::DomainError;
use super::newtypes::{AddressBookId, CircleId, ContactGuid, GroupId};

/// Host domain used to build circle identities
pub const CIRCLE_HOST_DOMAIN: &str = "live.com";

/// Returns the "never changed" timestamp sentinel
pub fn never_changed() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

// ============================================================================
// Groups
// ============================================================================

/// A named contact group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactGroup {
    id: GroupId,
    name: String,
}

impl ContactGroup {
    /// Creates a new group
    pub fn new(id: GroupId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Returns the group id
    pub fn id(&self) -> &GroupId {
        &self.id
    }

    /// Returns the group name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the group
    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }
}

// ============================================================================
// Circles
// ============================================================================

/// The owner's relationship with a circle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircleState {
    /// The owner is a member
    Accepted,
    /// The owner was invited and has not answered yet
    PendingInvitation,
}

/// The owner's role inside a circle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircleRole {
    /// Created the circle and may invite members
    Admin,
    /// Regular member
    Member,
}

/// A circle: a group-like address book shared between its members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circle {
    id: CircleId,
    display_name: String,
    state: CircleState,
    role: CircleRole,
    /// Members of the circle and their lists inside it
    members: BTreeMap<ContactHash, RoleLists>,
}

impl Circle {
    /// Creates a circle with no known members
    pub fn new(
        id: CircleId,
        display_name: impl Into<String>,
        state: CircleState,
        role: CircleRole,
    ) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            state,
            role,
            members: BTreeMap::new(),
        }
    }

    /// Returns the circle id
    pub fn id(&self) -> &CircleId {
        &self.id
    }

    /// Returns the display name
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Returns the relationship state
    pub fn state(&self) -> CircleState {
        self.state
    }

    /// Returns the owner's role
    pub fn role(&self) -> CircleRole {
        self.role
    }

    /// Returns true once the owner is a member
    pub fn is_accepted(&self) -> bool {
        self.state == CircleState::Accepted
    }

    /// Returns the circle's own identity, as announced over the wire
    pub fn contact_hash(&self) -> ContactHash {
        ContactHash::for_circle(&self.id, CIRCLE_HOST_DOMAIN)
    }

    /// Returns the member map
    pub fn members(&self) -> &BTreeMap<ContactHash, RoleLists> {
        &self.members
    }

    /// Sets the display name
    pub fn set_display_name(&mut self, name: impl Into<String>) {
        self.display_name = name.into();
    }

    /// Sets the relationship state
    pub fn set_state(&mut self, state: CircleState) {
        self.state = state;
    }

    /// Sets the owner's role
    pub fn set_role(&mut self, role: CircleRole) {
        self.role = role;
    }

    /// Inserts or updates a member, returning true if it is new
    pub fn upsert_member(&mut self, member: ContactHash, lists: RoleLists) -> bool {
        self.members.insert(member, lists).is_none()
    }

    /// Removes a member, returning true if it was present
    pub fn remove_member(&mut self, member: &ContactHash) -> bool {
        self.members.remove(member).is_some()
    }

    /// Replaces the whole member map
    pub fn replace_members(&mut self, members: BTreeMap<ContactHash, RoleLists>) {
        self.members = members;
    }
}

// ============================================================================
// Remote services
// ============================================================================

/// Membership category a list bit belongs to on the remote service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceCategory {
    /// Primary messaging service (Allow, Block, Reverse, Pending)
    Messenger,
    /// Presence service (Hide)
    Presence,
}

impl ServiceCategory {
    /// Returns the category that owns the given single list bit
    pub fn for_list(list: RoleLists) -> Result<Self, DomainError> {
        if list == RoleLists::HIDE {
            Ok(ServiceCategory::Presence)
        } else if list == RoleLists::ALLOW
            || list == RoleLists::BLOCK
            || list == RoleLists::REVERSE
            || list == RoleLists::PENDING
        {
            Ok(ServiceCategory::Messenger)
        } else {
            Err(DomainError::ValidationFailed(format!(
                "List {} has no remote membership category",
                list.short_names()
            )))
        }
    }

    /// Returns the service name used on the wire and by the remote service
    pub fn wire_name(self) -> &'static str {
        match self {
            ServiceCategory::Messenger => "IM",
            ServiceCategory::Presence => "PE",
        }
    }
}

/// Handle to a registered service on the remote membership service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHandle {
    /// Remote service id
    pub id: u64,
    /// Category of the service
    pub category: ServiceCategory,
    /// Last time the service's memberships changed
    pub last_change: DateTime<Utc>,
}

// ============================================================================
// Owner profile
// ============================================================================

/// Display picture of the owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePhoto {
    /// Resource name on the storage service
    pub name: String,
    /// Location the picture can be fetched from
    pub url: String,
}

/// Profile of the owning identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerProfile {
    /// Friendly name
    pub display_name: String,
    /// Personal message
    pub personal_message: String,
    /// Status color as `#rrggbb`
    pub color: Option<String>,
    /// Display picture
    pub photo: Option<ProfilePhoto>,
}

// ============================================================================
// RosterCache
// ============================================================================

/// The versioned Local Cache Store document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterCache {
    contacts: BTreeMap<ContactHash, Contact>,
    groups: BTreeMap<GroupId, ContactGroup>,
    circles: BTreeMap<CircleId, Circle>,
    services: BTreeMap<ServiceCategory, ServiceHandle>,
    owner: OwnerProfile,
    membership_last_change: DateTime<Utc>,
    address_book_last_change: BTreeMap<AddressBookId, DateTime<Utc>>,
}

impl Default for RosterCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RosterCache {
    /// Schema version of the serialized document
    pub const SCHEMA_VERSION: u32 = 3;

    /// Creates an empty document with every book at the sentinel
    pub fn new() -> Self {
        Self {
            contacts: BTreeMap::new(),
            groups: BTreeMap::new(),
            circles: BTreeMap::new(),
            services: BTreeMap::new(),
            owner: OwnerProfile::default(),
            membership_last_change: never_changed(),
            address_book_last_change: BTreeMap::new(),
        }
    }

    // --- Contacts ---

    /// Returns all contacts
    pub fn contacts(&self) -> &BTreeMap<ContactHash, Contact> {
        &self.contacts
    }

    /// Returns a contact by hash
    pub fn contact(&self, hash: &ContactHash) -> Option<&Contact> {
        self.contacts.get(hash)
    }

    /// Returns a mutable contact by hash
    pub fn contact_mut(&mut self, hash: &ContactHash) -> Option<&mut Contact> {
        self.contacts.get_mut(hash)
    }

    /// Returns a contact, or the `ContactNotFound` error
    pub fn require_contact(&self, hash: &ContactHash) -> Result<&Contact, DomainError> {
        self.contacts
            .get(hash)
            .ok_or_else(|| DomainError::ContactNotFound(hash.to_string()))
    }

    /// Returns a mutable contact, or the `ContactNotFound` error
    pub fn require_contact_mut(&mut self, hash: &ContactHash) -> Result<&mut Contact, DomainError> {
        self.contacts
            .get_mut(hash)
            .ok_or_else(|| DomainError::ContactNotFound(hash.to_string()))
    }

    /// Returns the contact for `hash`, creating it on first reference
    pub fn ensure_contact(&mut self, hash: &ContactHash) -> &mut Contact {
        self.contacts
            .entry(hash.clone())
            .or_insert_with(|| Contact::new(hash.clone()))
    }

    /// Finds a contact by its remote guid
    pub fn contact_by_guid(&self, guid: &ContactGuid) -> Option<&Contact> {
        self.contacts.values().find(|c| c.guid() == Some(guid))
    }

    /// Iterates over every contact mutably
    pub fn contacts_mut(&mut self) -> impl Iterator<Item = &mut Contact> {
        self.contacts.values_mut()
    }

    /// Contacts holding every bit of `lists`
    pub fn contacts_in(&self, lists: RoleLists) -> impl Iterator<Item = &Contact> {
        self.contacts.values().filter(move |c| c.has_lists(lists))
    }

    /// Clears outstanding wire announcements on every contact
    pub fn reset_announcements(&mut self) {
        for contact in self.contacts.values_mut() {
            contact.reset_announcements();
        }
    }

    // --- Groups ---

    /// Returns all groups
    pub fn groups(&self) -> &BTreeMap<GroupId, ContactGroup> {
        &self.groups
    }

    /// Returns a group by id
    pub fn group(&self, id: &GroupId) -> Option<&ContactGroup> {
        self.groups.get(id)
    }

    /// Returns a mutable group, or the `GroupNotFound` error
    pub fn require_group_mut(&mut self, id: &GroupId) -> Result<&mut ContactGroup, DomainError> {
        self.groups
            .get_mut(id)
            .ok_or_else(|| DomainError::GroupNotFound(id.to_string()))
    }

    /// Finds a group by name (case-insensitive)
    pub fn group_by_name(&self, name: &str) -> Option<&ContactGroup> {
        self.groups
            .values()
            .find(|g| g.name().eq_ignore_ascii_case(name))
    }

    /// Inserts or replaces a group
    pub fn insert_group(&mut self, group: ContactGroup) {
        self.groups.insert(*group.id(), group);
    }

    /// Removes a group and unfiles every contact from it
    pub fn remove_group(&mut self, id: &GroupId) -> Option<ContactGroup> {
        let removed = self.groups.remove(id);
        if removed.is_some() {
            for contact in self.contacts.values_mut() {
                contact.remove_group(id);
            }
        }
        removed
    }

    // --- Circles ---

    /// Returns all circles
    pub fn circles(&self) -> &BTreeMap<CircleId, Circle> {
        &self.circles
    }

    /// Returns a circle by id
    pub fn circle(&self, id: &CircleId) -> Option<&Circle> {
        self.circles.get(id)
    }

    /// Returns a mutable circle, or the `CircleNotFound` error
    pub fn require_circle_mut(&mut self, id: &CircleId) -> Result<&mut Circle, DomainError> {
        self.circles
            .get_mut(id)
            .ok_or_else(|| DomainError::CircleNotFound(id.to_string()))
    }

    /// Inserts or replaces a circle
    pub fn insert_circle(&mut self, circle: Circle) {
        self.circles.insert(*circle.id(), circle);
    }

    /// Removes a circle together with its address book timestamp
    pub fn remove_circle(&mut self, id: &CircleId) -> Option<Circle> {
        self.address_book_last_change
            .remove(&AddressBookId::for_circle(id));
        self.circles.remove(id)
    }

    // --- Services ---

    /// Returns the registered service handle for a category
    pub fn service(&self, category: ServiceCategory) -> Option<&ServiceHandle> {
        self.services.get(&category)
    }

    /// Records a service handle
    pub fn set_service(&mut self, handle: ServiceHandle) {
        self.services.insert(handle.category, handle);
    }

    // --- Owner ---

    /// Returns the owner profile
    pub fn owner(&self) -> &OwnerProfile {
        &self.owner
    }

    /// Replaces the owner profile
    pub fn set_owner(&mut self, owner: OwnerProfile) {
        self.owner = owner;
    }

    // --- Timestamps ---

    /// Returns the membership book's last change
    pub fn membership_last_change(&self) -> DateTime<Utc> {
        self.membership_last_change
    }

    /// Advances the membership book's last change (never moves backwards)
    pub fn advance_membership_last_change(&mut self, at: DateTime<Utc>) {
        if at > self.membership_last_change {
            self.membership_last_change = at;
        }
    }

    /// Returns an address book's last change (the sentinel when unknown)
    pub fn address_book_last_change(&self, book: &AddressBookId) -> DateTime<Utc> {
        self.address_book_last_change
            .get(book)
            .copied()
            .unwrap_or_else(never_changed)
    }

    /// Advances an address book's last change (never moves backwards)
    pub fn advance_address_book_last_change(&mut self, book: AddressBookId, at: DateTime<Utc>) {
        let entry = self
            .address_book_last_change
            .entry(book)
            .or_insert_with(never_changed);
        if at > *entry {
            *entry = at;
        }
    }
}
