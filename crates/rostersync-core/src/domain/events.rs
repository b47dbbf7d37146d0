//! Roster events
//!
//! Events are published by the synchronization engine after the change they
//! describe has been committed to the cache. Consumers receive them through
//! a broadcast subscription.

use serde::{Deserialize, Serialize};

use super::contact::{ContactHash, RoleLists};
use super::newtypes::{CircleId, GroupId};

/// A change observed or caused by the synchronization engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RosterEvent {
    /// The session is signed in; fired once per session
    SignedIn,
    /// Every initial wire batch has been acknowledged
    SynchronizationCompleted,
    /// A contact joined a list
    ContactAdded {
        contact: ContactHash,
        list: RoleLists,
    },
    /// A contact left a list
    ContactRemoved {
        contact: ContactHash,
        list: RoleLists,
    },
    /// A contact added the owner to their list
    ReverseAdded { contact: ContactHash },
    /// A contact removed the owner from their list
    ReverseRemoved { contact: ContactHash },
    /// A group was created
    ContactGroupAdded { group: GroupId, name: String },
    /// A group was deleted
    ContactGroupRemoved { group: GroupId, name: String },
    /// The owner's visibility to a contact changed
    ContactBlockedStatusChanged { contact: ContactHash, blocked: bool },
    /// A remote or local operation failed terminally
    ServiceOperationFailed { operation: String, reason: String },
    /// The owner joined a circle
    CircleJoined { circle: CircleId },
    /// The owner left a circle
    CircleLeft { circle: CircleId },
    /// A member joined a circle
    CircleMemberJoined {
        circle: CircleId,
        member: ContactHash,
    },
    /// A member left a circle
    CircleMemberLeft {
        circle: CircleId,
        member: ContactHash,
    },
}

impl RosterEvent {
    /// Returns the event name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            RosterEvent::SignedIn => "signed_in",
            RosterEvent::SynchronizationCompleted => "synchronization_completed",
            RosterEvent::ContactAdded { .. } => "contact_added",
            RosterEvent::ContactRemoved { .. } => "contact_removed",
            RosterEvent::ReverseAdded { .. } => "reverse_added",
            RosterEvent::ReverseRemoved { .. } => "reverse_removed",
            RosterEvent::ContactGroupAdded { .. } => "contact_group_added",
            RosterEvent::ContactGroupRemoved { .. } => "contact_group_removed",
            RosterEvent::ContactBlockedStatusChanged { .. } => "contact_blocked_status_changed",
            RosterEvent::ServiceOperationFailed { .. } => "service_operation_failed",
            RosterEvent::CircleJoined { .. } => "circle_joined",
            RosterEvent::CircleLeft { .. } => "circle_left",
            RosterEvent::CircleMemberJoined { .. } => "circle_member_joined",
            RosterEvent::CircleMemberLeft { .. } => "circle_member_left",
        }
    }
}
