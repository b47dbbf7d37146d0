//! rostersync Sync - Contact-list synchronization engine
//!
//! Provides:
//! - Bootstrap reconciliation of the local roster with the remote membership service
//! - Size-bounded `<ml>` wire batches for the notification server
//! - The list-mutation protocol (lists, groups, circles)
//! - Bounded recovery from stale-cache and missing-address-book faults
//!
//! ## Modules
//!
//! - [`batch`] - Pure wire batch builder
//! - [`merge`] - Merges membership and address-book snapshots into the cache
//! - [`recovery`] - Fault recovery table
//! - [`guard`] - Mutex-guarded session state with copy-on-write commits
//! - [`engine`] - Bootstrap, acknowledgments, refresh and session control
//! - [`mutation`] - List, group and circle mutations

pub mod batch;
pub mod engine;
pub mod guard;
pub mod merge;
pub mod mutation;
pub mod recovery;

pub use engine::{BootstrapReport, BootstrapStep, FetchRecord, RosterEngine};
pub use mutation::MutationOutcome;

use thiserror::Error;

use rostersync_core::domain::{DomainError, ServiceFault};

/// Errors that can occur during synchronization operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// A domain-level error propagated from rostersync-core
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// The remote membership service reported a terminal fault
    #[error("{operation} failed: {fault}")]
    Service {
        /// Name of the failed operation
        operation: String,
        /// Fault reported by the service
        fault: ServiceFault,
    },

    /// Reading or writing the roster store failed
    #[error("Storage error: {0:#}")]
    Storage(anyhow::Error),

    /// Sending on the notification channel failed
    #[error("Notification channel error: {0:#}")]
    Channel(anyhow::Error),

    /// The session was signed off while the operation was in flight
    #[error("Session signed off")]
    Cancelled,

    /// A recoverable fault repeated past the recovery budget
    #[error("{operation} failed after {attempts} recovery attempts: {fault}")]
    RecoveryExhausted {
        /// Name of the failed operation
        operation: String,
        /// Restarts already performed
        attempts: u32,
        /// Last fault reported by the service
        fault: ServiceFault,
    },
}

impl SyncError {
    /// Returns true if the error only reflects a signed-off session
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}
