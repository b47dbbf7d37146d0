//! Domain error types
//!
//! This module defines error types specific to domain operations,
//! including validation failures, invalid state transitions, and lookups
//! of roster entries that do not exist.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid account identity (empty, malformed or wrong network)
    #[error("Invalid account: {0}")]
    InvalidAccount(String),

    /// Invalid contact hash format (expected `<typeCode>:<account>`)
    #[error("Invalid contact hash: {0}")]
    InvalidContactHash(String),

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// No contact with the given hash exists in the roster
    #[error("Contact not found: {0}")]
    ContactNotFound(String),

    /// No group with the given id exists in the roster
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    /// No circle with the given id exists in the roster
    #[error("Circle not found: {0}")]
    CircleNotFound(String),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),
}
