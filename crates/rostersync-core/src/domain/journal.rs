//! Delta/Journal record
//!
//! The journal is persisted together with the [`RosterCache`](super::roster::RosterCache)
//! in the same critical section. It holds the cache keys needed to talk to the
//! remote service again and the profile snapshot received from the address
//! book until it has been applied to the owner.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::roster::{OwnerProfile, ProfilePhoto};

/// Profile held in the journal until it is applied to the owner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    /// Friendly name
    pub display_name: Option<String>,
    /// Personal message
    pub personal_message: Option<String>,
    /// Status color as `#rrggbb`
    pub color: Option<String>,
    /// Display picture
    pub photo: Option<ProfilePhoto>,
}

impl ProfileSnapshot {
    /// Applies the snapshot over an owner profile; absent fields keep their value
    pub fn apply_to(&self, owner: &mut OwnerProfile) {
        if let Some(name) = &self.display_name {
            owner.display_name = name.clone();
        }
        if let Some(message) = &self.personal_message {
            owner.personal_message = message.clone();
        }
        if self.color.is_some() {
            owner.color = self.color.clone();
        }
        if self.photo.is_some() {
            owner.photo = self.photo.clone();
        }
    }
}

/// The versioned journal record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaJournal {
    cache_keys: BTreeMap<String, String>,
    profile: Option<ProfileSnapshot>,
    deltas_applied: u64,
}

impl DeltaJournal {
    /// Schema version of the serialized record
    pub const SCHEMA_VERSION: u32 = 2;

    /// Creates an empty journal
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a cache key by name
    pub fn cache_key(&self, name: &str) -> Option<&str> {
        self.cache_keys.get(name).map(String::as_str)
    }

    /// Returns all cache keys
    pub fn cache_keys(&self) -> &BTreeMap<String, String> {
        &self.cache_keys
    }

    /// Stores a cache key
    pub fn set_cache_key(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cache_keys.insert(name.into(), value.into());
    }

    /// Returns the held profile snapshot
    pub fn profile(&self) -> Option<&ProfileSnapshot> {
        self.profile.as_ref()
    }

    /// Holds a profile snapshot until it is applied
    pub fn hold_profile(&mut self, profile: ProfileSnapshot) {
        self.profile = Some(profile);
    }

    /// Returns the number of remote deltas merged since the last truncate
    pub fn deltas_applied(&self) -> u64 {
        self.deltas_applied
    }

    /// Records that a remote delta was merged into the cache
    pub fn record_delta(&mut self) {
        self.deltas_applied += 1;
    }

    /// Drops applied content while keeping the cache keys
    pub fn truncate(&mut self) {
        self.profile = None;
        self.deltas_applied = 0;
    }

    /// Returns true when nothing is waiting to be applied
    pub fn is_truncated(&self) -> bool {
        self.profile.is_none() && self.deltas_applied == 0
    }
}
