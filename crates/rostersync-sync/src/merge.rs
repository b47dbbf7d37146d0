//! Snapshot merging
//!
//! Pure functions that fold remote snapshots into the cache document and the
//! journal. They run inside a guard commit, so they never see a half-applied
//! state, and return the events describing what changed. Events are derived
//! by diffing the document before and after the merge rather than from the
//! rows themselves, so replaying a delta twice yields no events the second
//! time.
//!
//! Ownership of list bits:
//!
//! | Source        | Bits                              |
//! |---------------|-----------------------------------|
//! | membership    | Allow, Block, Reverse, Pending, Hide |
//! | address book  | Forward                           |

use std::collections::{BTreeMap, BTreeSet};

use rostersync_core::domain::{
    AddressBookId, Circle, CircleId, ContactGroup, ContactHash, DeltaJournal, DomainError, GroupId,
    RoleLists, RosterCache, RosterEvent,
};
use rostersync_core::ports::{AddressBookSnapshot, FetchMode, MembershipSnapshot};

/// Journal key holding the address-book cache key
pub const ADDRESS_BOOK_CACHE_KEY: &str = "ab";

/// Bits owned by the membership book
const MEMBERSHIP_LISTS: RoleLists = RoleLists::ALLOW
    .union(RoleLists::BLOCK)
    .union(RoleLists::REVERSE)
    .union(RoleLists::PENDING)
    .union(RoleLists::HIDE);

/// Lists given to a circle member whose row carries none
const DEFAULT_CIRCLE_MEMBER_LISTS: RoleLists = RoleLists::FORWARD.union(RoleLists::ALLOW);

fn list_bits(cache: &RosterCache) -> BTreeMap<ContactHash, RoleLists> {
    cache
        .contacts()
        .iter()
        .map(|(hash, contact)| (hash.clone(), contact.lists()))
        .collect()
}

/// Emits one event per list bit of `mask` that differs between the two maps
fn list_events(
    before: &BTreeMap<ContactHash, RoleLists>,
    cache: &RosterCache,
    mask: RoleLists,
) -> Vec<RosterEvent> {
    let mut events = Vec::new();
    for (hash, contact) in cache.contacts() {
        let old = before.get(hash).copied().unwrap_or_default() & mask;
        let new = contact.lists() & mask;

        for bit in (new - old).iter() {
            events.push(if bit == RoleLists::REVERSE {
                RosterEvent::ReverseAdded {
                    contact: hash.clone(),
                }
            } else {
                RosterEvent::ContactAdded {
                    contact: hash.clone(),
                    list: bit,
                }
            });
        }
        for bit in (old - new).iter() {
            events.push(if bit == RoleLists::REVERSE {
                RosterEvent::ReverseRemoved {
                    contact: hash.clone(),
                }
            } else {
                RosterEvent::ContactRemoved {
                    contact: hash.clone(),
                    list: bit,
                }
            });
        }
    }
    events
}

// ============================================================================
// Membership
// ============================================================================

/// Merges a membership snapshot
///
/// A full snapshot replaces every membership-owned bit; a delta only
/// touches the rows it carries.
pub fn merge_membership(
    cache: &mut RosterCache,
    journal: &mut DeltaJournal,
    snapshot: &MembershipSnapshot,
    mode: FetchMode,
) -> Vec<RosterEvent> {
    let before = list_bits(cache);

    if mode.is_full() {
        for contact in cache.contacts_mut() {
            contact.remove_lists(MEMBERSHIP_LISTS);
        }
    }

    for service in &snapshot.services {
        cache.set_service(service.clone());
    }

    for row in &snapshot.members {
        let list = row.list & MEMBERSHIP_LISTS;
        if list.is_empty() {
            tracing::debug!(contact = %row.hash, list = %row.list.short_names(), "Ignoring membership row");
            continue;
        }

        if row.deleted {
            if let Some(contact) = cache.contact_mut(&row.hash) {
                contact.remove_lists(list);
                if list.contains(RoleLists::PENDING) {
                    contact.set_invitation(None);
                }
            }
            continue;
        }

        let contact = cache.ensure_contact(&row.hash);
        contact.add_lists(list);
        if let Some(name) = &row.display_name {
            contact.set_display_name(name.clone());
        }
        if list.contains(RoleLists::PENDING) {
            contact.set_invitation(row.invitation.clone());
        }
    }

    cache.advance_membership_last_change(snapshot.last_change);
    journal.record_delta();

    list_events(&before, cache, MEMBERSHIP_LISTS)
}

// ============================================================================
// Default address book
// ============================================================================

/// Merges a snapshot of the owner's default address book
pub fn merge_address_book(
    cache: &mut RosterCache,
    journal: &mut DeltaJournal,
    snapshot: &AddressBookSnapshot,
    mode: FetchMode,
) -> Vec<RosterEvent> {
    let before = list_bits(cache);
    let groups_before: BTreeMap<GroupId, String> = cache
        .groups()
        .iter()
        .map(|(id, group)| (*id, group.name().to_string()))
        .collect();
    let joined_before: BTreeSet<CircleId> = accepted_circles(cache);

    if mode.is_full() {
        let listed: BTreeSet<&ContactHash> = snapshot
            .contacts
            .iter()
            .filter(|row| !row.deleted)
            .map(|row| &row.hash)
            .collect();
        for contact in cache.contacts_mut() {
            if !listed.contains(contact.hash()) {
                contact.remove_lists(RoleLists::FORWARD);
                contact.clear_groups();
            }
        }

        let live_groups: BTreeSet<GroupId> = snapshot
            .groups
            .iter()
            .filter(|row| !row.deleted)
            .map(|row| row.id)
            .collect();
        let stale_groups: Vec<GroupId> = cache
            .groups()
            .keys()
            .filter(|id| !live_groups.contains(id))
            .copied()
            .collect();
        for id in stale_groups {
            cache.remove_group(&id);
        }

        let live_circles: BTreeSet<CircleId> = snapshot
            .circles
            .iter()
            .filter(|row| !row.deleted)
            .map(|row| row.id)
            .collect();
        let stale_circles: Vec<CircleId> = cache
            .circles()
            .keys()
            .filter(|id| !live_circles.contains(id))
            .copied()
            .collect();
        for id in stale_circles {
            cache.remove_circle(&id);
        }
    }

    // Groups first so contact rows can be filed under new groups
    for row in &snapshot.groups {
        if row.deleted {
            cache.remove_group(&row.id);
        } else {
            cache.insert_group(ContactGroup::new(row.id, row.name.clone()));
        }
    }

    for row in &snapshot.contacts {
        if row.deleted {
            if let Some(contact) = cache.contact_mut(&row.hash) {
                contact.remove_lists(RoleLists::FORWARD);
                contact.clear_groups();
            }
            continue;
        }

        let contact = cache.ensure_contact(&row.hash);
        contact.set_guid(row.guid);
        if let Some(name) = &row.display_name {
            contact.set_display_name(name.clone());
        }
        contact.set_messenger_user(row.is_messenger_user);
        if row.is_messenger_user {
            contact.add_lists(RoleLists::FORWARD);
        } else {
            contact.remove_lists(RoleLists::FORWARD);
        }
        contact.clear_groups();
        for group in &row.groups {
            contact.add_group(*group);
        }
    }

    for row in &snapshot.circles {
        if row.deleted {
            cache.remove_circle(&row.id);
            continue;
        }
        match cache.require_circle_mut(&row.id) {
            Ok(circle) => {
                circle.set_display_name(row.display_name.clone());
                circle.set_state(row.state);
                circle.set_role(row.role);
            }
            Err(_) => cache.insert_circle(Circle::new(
                row.id,
                row.display_name.clone(),
                row.state,
                row.role,
            )),
        }
    }

    if let Some(profile) = &snapshot.profile {
        journal.hold_profile(profile.clone());
    }
    if let Some(key) = &snapshot.cache_key {
        journal.set_cache_key(ADDRESS_BOOK_CACHE_KEY, key.clone());
    }
    cache.advance_address_book_last_change(AddressBookId::default_book(), snapshot.last_change);
    journal.record_delta();

    let mut events = list_events(&before, cache, RoleLists::FORWARD);

    for (id, group) in cache.groups() {
        if !groups_before.contains_key(id) {
            events.push(RosterEvent::ContactGroupAdded {
                group: *id,
                name: group.name().to_string(),
            });
        }
    }
    for (id, name) in &groups_before {
        if cache.group(id).is_none() {
            events.push(RosterEvent::ContactGroupRemoved {
                group: *id,
                name: name.clone(),
            });
        }
    }

    let joined_after = accepted_circles(cache);
    for circle in joined_after.difference(&joined_before) {
        events.push(RosterEvent::CircleJoined { circle: *circle });
    }
    for circle in joined_before.difference(&joined_after) {
        events.push(RosterEvent::CircleLeft { circle: *circle });
    }

    events
}

fn accepted_circles(cache: &RosterCache) -> BTreeSet<CircleId> {
    cache
        .circles()
        .values()
        .filter(|circle| circle.is_accepted())
        .map(|circle| *circle.id())
        .collect()
}

// ============================================================================
// Circle books
// ============================================================================

/// Merges the address book of one circle into its member map
///
/// # Errors
///
/// Returns `DomainError::CircleNotFound` if the circle is not cached.
pub fn merge_circle_book(
    cache: &mut RosterCache,
    journal: &mut DeltaJournal,
    circle_id: &CircleId,
    snapshot: &AddressBookSnapshot,
    mode: FetchMode,
) -> Result<Vec<RosterEvent>, DomainError> {
    let circle = cache.require_circle_mut(circle_id)?;
    let before: BTreeSet<ContactHash> = circle.members().keys().cloned().collect();

    let lists_of = |lists: RoleLists| {
        if lists.is_empty() {
            DEFAULT_CIRCLE_MEMBER_LISTS
        } else {
            lists
        }
    };

    if mode.is_full() {
        let members = snapshot
            .contacts
            .iter()
            .filter(|row| !row.deleted)
            .map(|row| (row.hash.clone(), lists_of(row.circle_lists)))
            .collect();
        circle.replace_members(members);
    } else {
        for row in &snapshot.contacts {
            if row.deleted {
                circle.remove_member(&row.hash);
            } else {
                circle.upsert_member(row.hash.clone(), lists_of(row.circle_lists));
            }
        }
    }

    let after: BTreeSet<ContactHash> = circle.members().keys().cloned().collect();
    let mut events = Vec::new();
    for member in after.difference(&before) {
        events.push(RosterEvent::CircleMemberJoined {
            circle: *circle_id,
            member: member.clone(),
        });
    }
    for member in before.difference(&after) {
        events.push(RosterEvent::CircleMemberLeft {
            circle: *circle_id,
            member: member.clone(),
        });
    }

    cache.advance_address_book_last_change(AddressBookId::for_circle(circle_id), snapshot.last_change);
    journal.record_delta();
    Ok(events)
}

// ============================================================================
// Pending-reverse reconciliation
// ============================================================================

/// Resolves contacts left on the pending list once synchronization completes
///
/// A pending contact the owner already has on the forward list was accepted
/// elsewhere: the pending bit is dropped without an event. Any other pending
/// contact is a genuine reverse add.
pub fn reconcile_pending(cache: &mut RosterCache) -> Vec<RosterEvent> {
    let mut events = Vec::new();
    for contact in cache.contacts_mut() {
        if !contact.has_lists(RoleLists::PENDING) {
            continue;
        }
        if contact.has_lists(RoleLists::FORWARD) {
            contact.remove_lists(RoleLists::PENDING);
            contact.set_invitation(None);
        } else {
            events.push(RosterEvent::ReverseAdded {
                contact: contact.hash().clone(),
            });
        }
    }
    events
}
