//! Domain newtypes with validation
//!
//! This module provides strongly-typed wrappers for roster identifiers.
//! Each newtype ensures data validity at construction time.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// UUID-based ID types
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create an identifier from an existing UUID
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID value
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| DomainError::InvalidId(format!("Invalid {}: {e}", stringify!($name))))
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Stable 128-bit identifier assigned to a contact by the remote service
    ContactGuid
);

uuid_id!(
    /// Identifier of a contact group
    GroupId
);

uuid_id!(
    /// Identifier of a circle (a group-like address book)
    CircleId
);

/// Identifier of an address book
///
/// The owner's default address book uses the nil UUID; every circle has an
/// address book whose id equals the circle id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressBookId(Uuid);

impl AddressBookId {
    /// The owner's default address book
    #[must_use]
    pub const fn default_book() -> Self {
        Self(Uuid::nil())
    }

    /// The address book backing a circle
    #[must_use]
    pub const fn for_circle(circle: &CircleId) -> Self {
        Self(*circle.as_uuid())
    }

    /// Returns true for the owner's default address book
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.0.is_nil()
    }

    /// Get the inner UUID value
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Display for AddressBookId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// TransactionId
// ============================================================================

/// Correlation token tagging an outbound wire command
///
/// Transaction ids are allocated in increasing order by the notification
/// channel, so comparing two ids tells which command was queued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(u32);

impl TransactionId {
    /// Wrap a raw transaction number
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the raw transaction number
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>()
            .map(Self)
            .map_err(|e| DomainError::InvalidId(format!("Invalid transaction id '{s}': {e}")))
    }
}

// ============================================================================
// Account
// ============================================================================

/// The signed-in account identity that owns a roster
///
/// Stored lowercased. Only the shape `local@domain` is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Account(String);

impl Account {
    /// Create a new validated account
    ///
    /// # Errors
    /// Returns error if the account is empty or not of the form `local@domain`
    pub fn new(account: impl Into<String>) -> Result<Self, DomainError> {
        let account = account.into().trim().to_lowercase();
        let mut parts = account.split('@');
        let local = parts.next().unwrap_or("");
        let domain = parts.next().unwrap_or("");
        if local.is_empty() || domain.is_empty() || parts.next().is_some() {
            return Err(DomainError::InvalidAccount(format!(
                "Account must be of the form local@domain: {account}"
            )));
        }
        if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
            return Err(DomainError::InvalidAccount(format!(
                "Account domain is malformed: {account}"
            )));
        }
        Ok(Self(account))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the domain part (after @)
    #[must_use]
    pub fn domain(&self) -> &str {
        self.0.split('@').nth(1).unwrap_or("")
    }
}

impl Display for Account {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Account {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Account> for String {
    fn from(account: Account) -> Self {
        account.0
    }
}
