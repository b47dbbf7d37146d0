//! Domain entities and business logic
//!
//! This module contains the core domain types for rostersync:
//! - Newtypes for type-safe identifiers and validated domain types
//! - Contacts, identity hashes and membership list bits
//! - The roster cache document and its companion journal
//! - The synchronization state machine
//! - Remote fault taxonomy and roster events
//! - Domain-specific error types

pub mod contact;
pub mod errors;
pub mod events;
pub mod fault;
pub mod journal;
pub mod newtypes;
pub mod roster;
pub mod sync_state;

// Re-export commonly used types
pub use contact::{ClientType, Contact, ContactHash, RoleLists};
pub use errors::DomainError;
pub use events::RosterEvent;
pub use fault::ServiceFault;
pub use journal::{DeltaJournal, ProfileSnapshot};
pub use newtypes::*;
pub use roster::{
    never_changed, Circle, CircleRole, CircleState, ContactGroup, OwnerProfile, ProfilePhoto,
    RosterCache, ServiceCategory, ServiceHandle, CIRCLE_HOST_DOMAIN,
};
pub use sync_state::{SyncState, SyncTransition};
