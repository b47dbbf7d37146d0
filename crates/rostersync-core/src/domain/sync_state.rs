//! Synchronization state machine
//!
//! ```text
//! Unsynchronized --BeginBootstrap--> Bootstrapping --BatchesQueued--> AwaitingAcknowledgment
//!                                         |                                   |
//!                                     SkipRemote                       AllAcknowledged
//!                                         v                                   v
//!                                    Synchronized <---------------------------+
//! ```
//!
//! `SignOff` and `Abort` return to `Unsynchronized` from any state.

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// Session synchronization state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// No bootstrap has run in this session
    #[default]
    Unsynchronized,
    /// Loading, fetching and merging
    Bootstrapping,
    /// Initial batches queued, waiting for the notification server
    AwaitingAcknowledgment,
    /// Every initial batch was acknowledged
    Synchronized,
}

/// Inputs that drive [`SyncState`] transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTransition {
    /// A bootstrap starts
    BeginBootstrap,
    /// All initial wire batches have been queued
    BatchesQueued,
    /// Automatic synchronization is disabled; remote calls are skipped
    SkipRemote,
    /// The pending wire batch map drained
    AllAcknowledged,
    /// The bootstrap failed terminally
    Abort,
    /// The session ended
    SignOff,
}

impl SyncState {
    /// Returns the state name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            SyncState::Unsynchronized => "Unsynchronized",
            SyncState::Bootstrapping => "Bootstrapping",
            SyncState::AwaitingAcknowledgment => "AwaitingAcknowledgment",
            SyncState::Synchronized => "Synchronized",
        }
    }

    /// Returns true while a bootstrap is running or waiting for acknowledgments
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            SyncState::Bootstrapping | SyncState::AwaitingAcknowledgment
        )
    }

    /// Computes the state reached by applying `input`
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidState` if the transition is not allowed.
    pub fn transition(self, input: SyncTransition) -> Result<SyncState, DomainError> {
        let next = match (self, input) {
            (_, SyncTransition::SignOff) | (_, SyncTransition::Abort) => {
                Some(SyncState::Unsynchronized)
            }
            (SyncState::Unsynchronized, SyncTransition::BeginBootstrap) => {
                Some(SyncState::Bootstrapping)
            }
            (SyncState::Bootstrapping, SyncTransition::BatchesQueued) => {
                Some(SyncState::AwaitingAcknowledgment)
            }
            (SyncState::Bootstrapping, SyncTransition::SkipRemote) => Some(SyncState::Synchronized),
            (SyncState::AwaitingAcknowledgment, SyncTransition::AllAcknowledged) => {
                Some(SyncState::Synchronized)
            }
            _ => None,
        };

        next.ok_or_else(|| DomainError::InvalidState {
            from: self.name().to_string(),
            to: format!("{input:?}"),
        })
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
