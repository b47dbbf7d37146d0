//! Remote service fault taxonomy
//!
//! The remote membership service reports structured faults. Adapters that
//! only receive free-text fault strings use [`ServiceFault::classify`] to map
//! them onto the same set of conditions.

use thiserror::Error;

/// A failure reported by the remote membership service
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceFault {
    /// The local cache is stale and must be rebuilt from a full fetch
    #[error("Full sync required: {0}")]
    FullSyncRequired(String),

    /// The owner's address book has not been created yet
    #[error("Address book does not exist")]
    AddressBookMissing,

    /// Adding a member that is already on the list
    #[error("Member already exists")]
    MemberAlreadyExists,

    /// Deleting a member that is not on the list
    #[error("Member does not exist")]
    MemberDoesNotExist,

    /// No service is registered for the membership category
    #[error("Service not registered")]
    ServiceMissing,

    /// The session ticket was invalidated
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Network or timeout failure surfaced by the transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Any other fault
    #[error("Service fault: {0}")]
    Other(String),
}

impl ServiceFault {
    /// Maps a free-text fault onto the structured taxonomy
    ///
    /// Matching is case-insensitive and tolerant of surrounding text.
    pub fn classify(message: &str) -> ServiceFault {
        let lower = message.to_lowercase();

        if lower.contains("need full sync")
            || lower.contains("full sync required")
            || lower.contains("fullsyncrequired")
        {
            return ServiceFault::FullSyncRequired(message.to_string());
        }
        if lower.contains("address book does not exist")
            || lower.contains("abdoesnotexist")
        {
            return ServiceFault::AddressBookMissing;
        }
        if lower.contains("member already exists") || lower.contains("memberalreadyexists") {
            return ServiceFault::MemberAlreadyExists;
        }
        if lower.contains("member does not exist") || lower.contains("memberdoesnotexist") {
            return ServiceFault::MemberDoesNotExist;
        }
        if lower.contains("service not found") || lower.contains("service does not exist") {
            return ServiceFault::ServiceMissing;
        }
        if lower.contains("ticket") && (lower.contains("invalid") || lower.contains("expired")) {
            return ServiceFault::Unauthorized(message.to_string());
        }
        if lower.contains("timed out") || lower.contains("timeout") || lower.contains("connection")
        {
            return ServiceFault::Transport(message.to_string());
        }

        ServiceFault::Other(message.to_string())
    }

    /// Returns true for faults that mean the requested membership state already holds
    pub fn is_idempotent_outcome(&self) -> bool {
        matches!(
            self,
            ServiceFault::MemberAlreadyExists | ServiceFault::MemberDoesNotExist
        )
    }

    /// Short machine-readable code for logs and events
    pub fn code(&self) -> &'static str {
        match self {
            ServiceFault::FullSyncRequired(_) => "full_sync_required",
            ServiceFault::AddressBookMissing => "address_book_missing",
            ServiceFault::MemberAlreadyExists => "member_already_exists",
            ServiceFault::MemberDoesNotExist => "member_does_not_exist",
            ServiceFault::ServiceMissing => "service_missing",
            ServiceFault::Unauthorized(_) => "unauthorized",
            ServiceFault::Transport(_) => "transport",
            ServiceFault::Other(_) => "other",
        }
    }
}
