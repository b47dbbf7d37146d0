//! Contact domain entity
//!
//! A [`Contact`] is identified by its [`ContactHash`], the network-type
//! qualified account string (`"1:alice@example.com"`). Its membership in
//! the server-side lists is tracked as a [`RoleLists`] bit set.

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{CircleId, ContactGuid, GroupId};

// ============================================================================
// ClientType
// ============================================================================

/// Network-type tag of a contact identity
///
/// The discriminants are the type codes used on the wire (`t` attribute).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    /// Windows Live / passport account
    WindowsLive = 1,
    /// Office Communicator account
    OfficeCommunicator = 2,
    /// Telephone number
    Telephone = 4,
    /// Mobile network account
    MobileNetwork = 8,
    /// Circle (shared address book)
    Circle = 9,
    /// Federated remote network account
    RemoteNetwork = 14,
    /// Plain e-mail contact
    Email = 16,
    /// Yahoo! Messenger account
    Yahoo = 32,
}

impl ClientType {
    /// All known client types
    pub const ALL: [ClientType; 8] = [
        ClientType::WindowsLive,
        ClientType::OfficeCommunicator,
        ClientType::Telephone,
        ClientType::MobileNetwork,
        ClientType::Circle,
        ClientType::RemoteNetwork,
        ClientType::Email,
        ClientType::Yahoo,
    ];

    /// Returns the numeric wire type code
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Looks up a client type by its wire type code
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.code() == code)
    }

    /// Returns true if identities of this type carry an `@domain` part
    #[must_use]
    pub fn has_domain(self) -> bool {
        !matches!(self, ClientType::Telephone | ClientType::RemoteNetwork)
    }

    /// Returns the display name of this client type
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ClientType::WindowsLive => "WindowsLive",
            ClientType::OfficeCommunicator => "OfficeCommunicator",
            ClientType::Telephone => "Telephone",
            ClientType::MobileNetwork => "MobileNetwork",
            ClientType::Circle => "Circle",
            ClientType::RemoteNetwork => "RemoteNetwork",
            ClientType::Email => "Email",
            ClientType::Yahoo => "Yahoo",
        }
    }
}

impl Display for ClientType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// RoleLists
// ============================================================================

bitflags! {
    /// Membership lists a contact belongs to
    ///
    /// The bit values match the list levels used on the wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct RoleLists: u32 {
        /// The owner has this contact in the address book
        const FORWARD = 1;
        /// The contact may see the owner's presence
        const ALLOW = 2;
        /// The contact is blocked
        const BLOCK = 4;
        /// The contact has the owner in their address book
        const REVERSE = 8;
        /// The contact added the owner and awaits a decision
        const PENDING = 16;
        /// The owner appears offline to this contact
        const HIDE = 64;
    }
}

impl RoleLists {
    /// Lists the client may change through membership calls or the wire
    pub const CLIENT_SETTABLE: RoleLists = RoleLists::FORWARD
        .union(RoleLists::ALLOW)
        .union(RoleLists::BLOCK)
        .union(RoleLists::HIDE);

    /// Lists that are announced to the notification server
    pub const ANNOUNCED: RoleLists = RoleLists::CLIENT_SETTABLE;

    /// Lists reflected to the notification server after a remote membership change
    pub const WIRE_REFLECTED: RoleLists = RoleLists::ALLOW
        .union(RoleLists::BLOCK)
        .union(RoleLists::HIDE);

    /// Returns true if exactly one list bit is set
    #[must_use]
    pub fn is_single(self) -> bool {
        self.bits().count_ones() == 1
    }

    /// Parses a list name (`forward`, `allow`, `block`, `reverse`, `pending`, `hide`)
    pub fn from_list_name(name: &str) -> Result<Self, DomainError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "forward" | "fl" => Ok(RoleLists::FORWARD),
            "allow" | "al" => Ok(RoleLists::ALLOW),
            "block" | "bl" => Ok(RoleLists::BLOCK),
            "reverse" | "rl" => Ok(RoleLists::REVERSE),
            "pending" | "pl" => Ok(RoleLists::PENDING),
            "hide" | "hl" => Ok(RoleLists::HIDE),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown membership list: {other}"
            ))),
        }
    }

    /// Short list names for logging (`FL|AL`)
    #[must_use]
    pub fn short_names(self) -> String {
        const SHORT: [(RoleLists, &str); 6] = [
            (RoleLists::FORWARD, "FL"),
            (RoleLists::ALLOW, "AL"),
            (RoleLists::BLOCK, "BL"),
            (RoleLists::REVERSE, "RL"),
            (RoleLists::PENDING, "PL"),
            (RoleLists::HIDE, "HL"),
        ];
        let names: Vec<&str> = SHORT
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            "none".to_string()
        } else {
            names.join("|")
        }
    }
}

// ============================================================================
// ContactHash
// ============================================================================

/// Network-type qualified identity string, e.g. `"1:alice@example.com"`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContactHash {
    client_type: ClientType,
    account: String,
}

impl ContactHash {
    /// Builds a hash from a client type and an account string
    ///
    /// # Errors
    /// Returns error if the account is empty, or lacks a domain for a
    /// client type that requires one
    pub fn new(client_type: ClientType, account: &str) -> Result<Self, DomainError> {
        let account = account.trim().to_lowercase();
        if account.is_empty() {
            return Err(DomainError::InvalidContactHash(
                "Account cannot be empty".to_string(),
            ));
        }
        if client_type.has_domain() {
            let (local, domain) = account.split_once('@').ok_or_else(|| {
                DomainError::InvalidContactHash(format!(
                    "{client_type} account must contain '@': {account}"
                ))
            })?;
            if local.is_empty() || domain.is_empty() {
                return Err(DomainError::InvalidContactHash(format!(
                    "{client_type} account is malformed: {account}"
                )));
            }
        }
        Ok(Self {
            client_type,
            account,
        })
    }

    /// Identity of a circle, as announced over the wire
    pub fn for_circle(circle: &CircleId, host_domain: &str) -> Self {
        Self {
            client_type: ClientType::Circle,
            account: format!("{circle}@{host_domain}").to_lowercase(),
        }
    }

    /// Returns the client type part
    #[must_use]
    pub fn client_type(&self) -> ClientType {
        self.client_type
    }

    /// Returns the account part
    #[must_use]
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Returns the domain of the account, if the client type has one
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        if !self.client_type.has_domain() {
            return None;
        }
        self.account.rsplit_once('@').map(|(_, domain)| domain)
    }

    /// Returns the account without its domain (the whole account if there is none)
    #[must_use]
    pub fn local_part(&self) -> &str {
        match self.domain() {
            Some(_) => self
                .account
                .rsplit_once('@')
                .map(|(local, _)| local)
                .unwrap_or(&self.account),
            None => &self.account,
        }
    }
}

impl Display for ContactHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client_type.code(), self.account)
    }
}

impl FromStr for ContactHash {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (code, account) = s
            .split_once(':')
            .ok_or_else(|| DomainError::InvalidContactHash(s.to_string()))?;
        let code: u32 = code
            .parse()
            .map_err(|_| DomainError::InvalidContactHash(s.to_string()))?;
        let client_type = ClientType::from_code(code).ok_or_else(|| {
            DomainError::InvalidContactHash(format!("Unknown type code {code} in {s}"))
        })?;
        Self::new(client_type, account)
    }
}

impl TryFrom<String> for ContactHash {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContactHash> for String {
    fn from(hash: ContactHash) -> Self {
        hash.to_string()
    }
}

// ============================================================================
// Contact
// ============================================================================

/// A roster entry
///
/// Contacts are created when first referenced, either locally or by a
/// remote payload. They are never deleted while the cache references them;
/// only their list bits change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Identity of the contact
    hash: ContactHash,
    /// Remote identifier, once the address book knows the contact
    guid: Option<ContactGuid>,
    /// Friendly name
    display_name: String,
    /// Membership lists
    lists: RoleLists,
    /// Groups this contact is filed under
    groups: BTreeSet<GroupId>,
    /// Whether the address book marks this contact as a messenger buddy
    is_messenger_user: bool,
    /// Message attached to a pending invitation
    invitation: Option<String>,
    /// Wire announcements not yet acknowledged in this session
    #[serde(skip)]
    pending_announcements: u32,
}

impl Contact {
    /// Creates a new contact with no list membership
    pub fn new(hash: ContactHash) -> Self {
        let display_name = hash.account().to_string();
        Self {
            hash,
            guid: None,
            display_name,
            lists: RoleLists::empty(),
            groups: BTreeSet::new(),
            is_messenger_user: false,
            invitation: None,
            pending_announcements: 0,
        }
    }

    // --- Getters ---

    /// Returns the identity hash
    pub fn hash(&self) -> &ContactHash {
        &self.hash
    }

    /// Returns the client type
    pub fn client_type(&self) -> ClientType {
        self.hash.client_type()
    }

    /// Returns the remote guid, if known
    pub fn guid(&self) -> Option<&ContactGuid> {
        self.guid.as_ref()
    }

    /// Returns the display name
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Returns the membership lists
    pub fn lists(&self) -> RoleLists {
        self.lists
    }

    /// Returns true if the contact holds every bit of `lists`
    pub fn has_lists(&self, lists: RoleLists) -> bool {
        self.lists.contains(lists)
    }

    /// Returns the groups this contact belongs to
    pub fn groups(&self) -> &BTreeSet<GroupId> {
        &self.groups
    }

    /// Returns whether the address book marks this contact as a messenger user
    pub fn is_messenger_user(&self) -> bool {
        self.is_messenger_user
    }

    /// Returns the pending invitation message
    pub fn invitation(&self) -> Option<&str> {
        self.invitation.as_deref()
    }

    /// Returns the number of unacknowledged wire announcements
    pub fn pending_announcements(&self) -> u32 {
        self.pending_announcements
    }

    // --- Mutations ---

    /// Sets the remote guid
    pub fn set_guid(&mut self, guid: ContactGuid) {
        self.guid = Some(guid);
    }

    /// Sets the display name
    pub fn set_display_name(&mut self, name: impl Into<String>) {
        self.display_name = name.into();
    }

    /// Sets the messenger-user flag
    pub fn set_messenger_user(&mut self, value: bool) {
        self.is_messenger_user = value;
    }

    /// Sets or clears the invitation message
    pub fn set_invitation(&mut self, message: Option<String>) {
        self.invitation = message;
    }

    /// Adds list bits
    pub fn add_lists(&mut self, lists: RoleLists) {
        self.lists.insert(lists);
    }

    /// Removes list bits
    pub fn remove_lists(&mut self, lists: RoleLists) {
        self.lists.remove(lists);
    }

    /// Files the contact under a group
    pub fn add_group(&mut self, group: GroupId) -> bool {
        self.groups.insert(group)
    }

    /// Removes the contact from a group
    pub fn remove_group(&mut self, group: &GroupId) -> bool {
        self.groups.remove(group)
    }

    /// Removes the contact from every group
    pub fn clear_groups(&mut self) {
        self.groups.clear();
    }

    /// Records that the contact was queued in a wire announcement
    pub fn announcement_queued(&mut self) {
        self.pending_announcements += 1;
    }

    /// Records that an announcement carrying this contact was acknowledged
    pub fn announcement_acknowledged(&mut self) {
        self.pending_announcements = self.pending_announcements.saturating_sub(1);
    }

    /// Forgets all outstanding announcements
    pub fn reset_announcements(&mut self) {
        self.pending_announcements = 0;
    }
}
