//! rostersync Core - Domain logic for contact-list synchronization
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `Contact`, `ContactGroup`, `Circle`, `RosterCache`, `DeltaJournal`
//! - **State machine** - `SyncState` and its transition table
//! - **Fault taxonomy** - `ServiceFault` reported by the remote membership service
//! - **Port definitions** - Traits for adapters: `IMembershipService`,
//!   `INotificationChannel`, `IRosterStore`
//!
//! # Architecture
//!
//! This crate follows the hexagonal (ports & adapters) architecture pattern.
//! The domain module contains pure data and rules with no I/O.
//! Ports define trait interfaces that adapter crates implement; the
//! synchronization engine in `rostersync-sync` depends only on these ports.

pub mod config;
pub mod domain;
pub mod ports;
