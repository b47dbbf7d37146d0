//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the domain core
//! depends on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IMembershipService`] - Remote membership and address-book service
//! - [`INotificationChannel`] - Outbound list-membership commands
//! - [`IRosterStore`] - Persistent storage for the roster cache and journal

pub mod membership_service;
pub mod notification_channel;
pub mod roster_store;

pub use membership_service::{
    AbContactEntry, AddressBookSnapshot, CircleEntry, ContactUpdate, FetchMode, GroupEntry,
    IMembershipService, MemberEntry, MemberRecord, MembershipSnapshot, NewContactRequest, Scenario,
};
pub use notification_channel::{INotificationChannel, WireCommand};
pub use roster_store::{IRosterStore, LoadOutcome, StoredRoster};
