//! Membership service port (driven/secondary port)
//!
//! This module defines the interface to the remote membership and
//! address-book service. The service returns either full snapshots or
//! deltas since a given timestamp, and accepts member, contact, group and
//! circle mutations.
//!
//! ## Design Notes
//!
//! - Returns `Result<_, ServiceFault>` rather than `anyhow::Result`: the
//!   recovery policy switches on the fault variant, so adapters must map
//!   their transport failures onto the taxonomy (see `ServiceFault::classify`).
//! - The snapshot structs are port-level DTOs, not domain entities; the
//!   sync crate merges them into the `RosterCache`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    contact::{ClientType, ContactHash, RoleLists},
    errors::DomainError,
    fault::ServiceFault,
    journal::ProfileSnapshot,
    newtypes::{AddressBookId, CircleId, ContactGuid, GroupId},
    roster::{CircleRole, CircleState, ServiceCategory, ServiceHandle},
};

// ============================================================================
// Request parameters
// ============================================================================

/// Why a fetch is issued; forwarded to the service as a hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// First fetch of a session
    Initial,
    /// Periodic or server-notified refresh
    Timer,
    /// Reconciliation after a contact was saved or removed
    ContactSave,
    /// Reconciliation after a block or unblock
    BlockUnblock,
    /// Reconciliation after a circle changed
    CircleSave,
}

impl Scenario {
    /// Returns the scenario name sent to the service
    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::Initial => "Initial",
            Scenario::Timer => "Timer",
            Scenario::ContactSave => "ContactSave",
            Scenario::BlockUnblock => "BlockUnblock",
            Scenario::CircleSave => "CircleSave",
        }
    }
}

/// Full snapshot or delta since a timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FetchMode {
    /// Everything the service holds
    Full,
    /// Changes after `since`
    Delta { since: DateTime<Utc> },
}

impl FetchMode {
    /// Chooses the mode from a book's last-change timestamp
    ///
    /// A timestamp at the "never changed" sentinel requires a full fetch.
    pub fn for_last_change(last_change: DateTime<Utc>) -> Self {
        if last_change == DateTime::<Utc>::default() {
            FetchMode::Full
        } else {
            FetchMode::Delta { since: last_change }
        }
    }

    /// Returns true for a full fetch
    pub fn is_full(&self) -> bool {
        matches!(self, FetchMode::Full)
    }
}

/// Type-specific member record sent with add/delete member calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MemberRecord {
    /// Network account (passport name)
    Passport { account: String },
    /// Foreign email identity with its buddy-type annotation
    Email {
        email: String,
        annotation: Option<String>,
    },
    /// Phone number
    Phone { number: String },
    /// Circle identity
    Circle { circle: CircleId },
}

impl MemberRecord {
    /// Annotation key carrying the buddy type of email members
    pub const BUDDY_TYPE_ANNOTATION: &'static str = "MSN.IM.BuddyType";

    /// Selects the member record for a contact by its client type
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidContactHash` if a circle hash does not
    /// carry a circle id in its local part.
    pub fn for_contact(hash: &ContactHash) -> Result<Self, DomainError> {
        let record = match hash.client_type() {
            ClientType::WindowsLive => MemberRecord::Passport {
                account: hash.account().to_string(),
            },
            ClientType::Telephone => MemberRecord::Phone {
                number: hash.account().to_string(),
            },
            ClientType::Circle => {
                let circle = hash
                    .local_part()
                    .parse::<CircleId>()
                    .map_err(|_| DomainError::InvalidContactHash(hash.to_string()))?;
                MemberRecord::Circle { circle }
            }
            other => MemberRecord::Email {
                email: hash.account().to_string(),
                annotation: Some(format!(
                    "{}={}:",
                    Self::BUDDY_TYPE_ANNOTATION,
                    other.code()
                )),
            },
        };
        Ok(record)
    }
}

/// Request to create a contact in the default address book
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContactRequest {
    /// Identity of the new contact
    pub hash: ContactHash,
    /// Message attached to the invitation, if any
    pub invitation: Option<String>,
}

/// Partial update of an address-book contact
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactUpdate {
    /// New friendly name
    pub display_name: Option<String>,
    /// New messenger-buddy flag
    pub is_messenger_user: Option<bool>,
}

// ============================================================================
// Snapshots
// ============================================================================

/// One membership row: a contact on one list of one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberEntry {
    /// Identity of the member
    pub hash: ContactHash,
    /// Single list bit the row describes
    pub list: RoleLists,
    /// Whether the row was deleted since the requested timestamp
    pub deleted: bool,
    /// Friendly name, when the service knows one
    pub display_name: Option<String>,
    /// Invitation message attached to a pending row
    pub invitation: Option<String>,
}

/// Result of a membership fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipSnapshot {
    /// Services registered for the owner
    pub services: Vec<ServiceHandle>,
    /// Membership rows
    pub members: Vec<MemberEntry>,
    /// Latest change timestamp covered by the snapshot
    pub last_change: DateTime<Utc>,
}

/// One address-book contact row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbContactEntry {
    /// Remote identifier
    pub guid: ContactGuid,
    /// Identity of the contact
    pub hash: ContactHash,
    /// Friendly name
    pub display_name: Option<String>,
    /// Messenger-buddy flag
    pub is_messenger_user: bool,
    /// Groups the contact is filed under
    pub groups: Vec<GroupId>,
    /// Role of the member inside a circle book; ignored for the default book
    pub circle_lists: RoleLists,
    /// Whether the row was deleted since the requested timestamp
    pub deleted: bool,
}

/// One group row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    /// Group id
    pub id: GroupId,
    /// Group name
    pub name: String,
    /// Whether the row was deleted since the requested timestamp
    pub deleted: bool,
}

/// One circle row from the default book
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircleEntry {
    /// Circle id
    pub id: CircleId,
    /// Circle name
    pub display_name: String,
    /// Invitation state
    pub state: CircleState,
    /// Role of the owner
    pub role: CircleRole,
    /// Whether the row was deleted since the requested timestamp
    pub deleted: bool,
}

/// Result of an address-book fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBookSnapshot {
    /// Book the snapshot belongs to
    pub book: AddressBookId,
    /// Contact rows
    pub contacts: Vec<AbContactEntry>,
    /// Group rows
    pub groups: Vec<GroupEntry>,
    /// Circle rows (default book only)
    pub circles: Vec<CircleEntry>,
    /// Owner profile (default book only)
    pub profile: Option<ProfileSnapshot>,
    /// Cache key to reuse on the next request
    pub cache_key: Option<String>,
    /// Latest change timestamp covered by the snapshot
    pub last_change: DateTime<Utc>,
}

// ============================================================================
// IMembershipService trait
// ============================================================================

/// Port trait for the remote membership and address-book service
///
/// Every call may fail with a [`ServiceFault`]. Implementations surface
/// timeouts as `ServiceFault::Transport`; the engine never retries those.
#[async_trait::async_trait]
pub trait IMembershipService: Send + Sync {
    // --- Fetch ---

    /// Fetches the owner's service memberships
    async fn fetch_membership(
        &self,
        scenario: Scenario,
        mode: FetchMode,
    ) -> Result<MembershipSnapshot, ServiceFault>;

    /// Fetches an address book (the default book or a circle book)
    async fn fetch_address_book(
        &self,
        scenario: Scenario,
        book: AddressBookId,
        mode: FetchMode,
    ) -> Result<AddressBookSnapshot, ServiceFault>;

    /// Creates the owner's default address book
    async fn create_address_book(&self) -> Result<(), ServiceFault>;

    /// Registers a service for a membership category
    async fn add_service(&self, category: ServiceCategory) -> Result<ServiceHandle, ServiceFault>;

    // --- Contacts and members ---

    /// Creates a contact in the default address book
    async fn create_contact(&self, request: &NewContactRequest) -> Result<ContactGuid, ServiceFault>;

    /// Updates an address-book contact
    async fn update_contact(
        &self,
        guid: &ContactGuid,
        update: &ContactUpdate,
    ) -> Result<(), ServiceFault>;

    /// Adds a member to a list of a service
    async fn add_member(
        &self,
        service: &ServiceHandle,
        list: RoleLists,
        member: &MemberRecord,
    ) -> Result<(), ServiceFault>;

    /// Deletes a member from a list of a service
    async fn delete_member(
        &self,
        service: &ServiceHandle,
        list: RoleLists,
        member: &MemberRecord,
    ) -> Result<(), ServiceFault>;

    /// Removes a contact from the address book, optionally blocking it
    async fn break_connection(&self, guid: &ContactGuid, block: bool) -> Result<(), ServiceFault>;

    // --- Groups ---

    /// Creates a group
    async fn add_group(&self, name: &str) -> Result<GroupId, ServiceFault>;

    /// Deletes a group
    async fn delete_group(&self, group: &GroupId) -> Result<(), ServiceFault>;

    /// Renames a group
    async fn rename_group(&self, group: &GroupId, name: &str) -> Result<(), ServiceFault>;

    /// Files a contact under a group
    async fn add_contact_to_group(
        &self,
        contact: &ContactGuid,
        group: &GroupId,
    ) -> Result<(), ServiceFault>;

    /// Removes a contact from a group
    async fn delete_contact_from_group(
        &self,
        contact: &ContactGuid,
        group: &GroupId,
    ) -> Result<(), ServiceFault>;

    // --- Circles ---

    /// Creates a circle owned by the owner
    async fn create_circle(&self, name: &str) -> Result<CircleId, ServiceFault>;

    /// Invites an account into a circle
    async fn invite_circle_member(
        &self,
        circle: &CircleId,
        member: &ContactHash,
        message: Option<&str>,
    ) -> Result<(), ServiceFault>;

    /// Accepts or rejects a circle invitation
    async fn respond_circle_invitation(
        &self,
        circle: &CircleId,
        accept: bool,
    ) -> Result<(), ServiceFault>;

    /// Leaves a circle
    async fn exit_circle(&self, circle: &CircleId) -> Result<(), ServiceFault>;
}
