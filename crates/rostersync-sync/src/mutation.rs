//! List, group and circle mutations
//!
//! Every mutation follows the same shape: validate against the cache,
//! issue the remote call with the guard released, commit the result, send
//! any wire command and only then publish the event. A remote failure
//! leaves the cache untouched. Failures other than a rejected request are
//! reported once as `ServiceOperationFailed` by [`RosterEngine::settle`].
//!
//! The forward list is the exception: it is owned by the notification
//! server, so adding or removing it is a wire command only.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use rostersync_core::domain::{
    Circle, CircleId, CircleRole, CircleState, ClientType, ContactGroup, ContactGuid, ContactHash,
    DomainError, GroupId, RoleLists, RosterEvent, ServiceCategory, ServiceHandle,
};
use rostersync_core::ports::{ContactUpdate, MemberRecord, NewContactRequest, Scenario, WireCommand};

use crate::engine::{RosterEngine, CIRCLE_ANNOUNCED_LISTS};
use crate::recovery::{self, RecoveryAction, RecoveryContext};
use crate::SyncError;

/// Result of a mutation that may already hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The change was made
    Applied,
    /// The requested state already held; nothing was sent
    Unchanged,
}

impl MutationOutcome {
    /// Returns true if the change was made
    pub fn is_applied(self) -> bool {
        self == MutationOutcome::Applied
    }
}

/// Retries allowed after registering a missing service
const SERVICE_REGISTRATION_RETRIES: u32 = 1;

fn validate_list(list: RoleLists) -> Result<(), DomainError> {
    if list.is_single() && RoleLists::CLIENT_SETTABLE.contains(list) {
        Ok(())
    } else {
        Err(DomainError::ValidationFailed(format!(
            "{} is not a single client-settable list",
            list.short_names()
        )))
    }
}

fn validate_name(kind: &str, name: &str) -> Result<String, DomainError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(DomainError::ValidationFailed(format!(
            "{kind} name cannot be empty"
        )));
    }
    Ok(name.to_string())
}

impl RosterEngine {
    // ========================================================================
    // Lists
    // ========================================================================

    /// Adds a contact to a list
    ///
    /// `list` must be one of `FORWARD`, `ALLOW`, `BLOCK` or `HIDE`. The
    /// contact is created locally on first reference.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ValidationFailed` for other lists and
    /// [`SyncError::Service`] if the remote service rejects the change.
    #[tracing::instrument(skip(self), fields(contact = %hash, list = %list.short_names()))]
    pub async fn add_contact_to_list(
        &self,
        hash: &ContactHash,
        list: RoleLists,
    ) -> Result<MutationOutcome, SyncError> {
        let session = self.guard.session().await;
        let result = self.change_list(&session, hash, list, true).await;
        self.settle(&session, "add_contact_to_list", result)
    }

    /// Removes a contact from a list
    #[tracing::instrument(skip(self), fields(contact = %hash, list = %list.short_names()))]
    pub async fn remove_contact_from_list(
        &self,
        hash: &ContactHash,
        list: RoleLists,
    ) -> Result<MutationOutcome, SyncError> {
        let session = self.guard.session().await;
        let result = self.change_list(&session, hash, list, false).await;
        self.settle(&session, "remove_contact_from_list", result)
    }

    async fn change_list(
        &self,
        session: &CancellationToken,
        hash: &ContactHash,
        list: RoleLists,
        add: bool,
    ) -> Result<MutationOutcome, SyncError> {
        validate_list(list)?;

        let holds = self
            .guard
            .with_cache(|cache| cache.contact(hash).is_some_and(|c| c.has_lists(list)))
            .await;
        if holds == add {
            debug!("List already in requested state");
            return Ok(MutationOutcome::Unchanged);
        }

        let command = if add { WireCommand::Adl } else { WireCommand::Rml };
        if list == RoleLists::FORWARD {
            self.send_single(session, command, hash, list).await?;
        } else {
            self.call_member_service(session, hash, list, add).await?;
        }

        self.guard
            .commit(session, |w| {
                let contact = w.cache.ensure_contact(hash);
                if add {
                    contact.add_lists(list);
                } else {
                    contact.remove_lists(list);
                }
                Ok(())
            })
            .await?;

        if RoleLists::WIRE_REFLECTED.contains(list) {
            self.send_single(session, command, hash, list).await?;
        }

        self.emit(if add {
            RosterEvent::ContactAdded {
                contact: hash.clone(),
                list,
            }
        } else {
            RosterEvent::ContactRemoved {
                contact: hash.clone(),
                list,
            }
        });
        info!(added = add, "List updated");
        Ok(MutationOutcome::Applied)
    }

    /// Issues the add/delete member call, registering the service if needed
    async fn call_member_service(
        &self,
        session: &CancellationToken,
        hash: &ContactHash,
        list: RoleLists,
        add: bool,
    ) -> Result<(), SyncError> {
        let category = ServiceCategory::for_list(list)?;
        let member = MemberRecord::for_contact(hash)?;
        let operation = if add { "add_member" } else { "delete_member" };

        let mut attempts = 0;
        loop {
            let cached = self
                .guard
                .with_cache(|cache| cache.service(category).cloned())
                .await;
            let service = match cached {
                Some(service) => service,
                None => self.register_service(session, category).await?,
            };

            let result = if add {
                self.membership.add_member(&service, list, &member).await
            } else {
                self.membership.delete_member(&service, list, &member).await
            };
            let Err(fault) = result else {
                return Ok(());
            };

            match recovery::decide(
                &fault,
                RecoveryContext::MemberMutation,
                attempts,
                SERVICE_REGISTRATION_RETRIES,
            ) {
                RecoveryAction::TreatAsSuccess => {
                    debug!(operation, code = fault.code(), "Membership already in requested state");
                    return Ok(());
                }
                RecoveryAction::RegisterServiceThenRetry => {
                    self.register_service(session, category).await?;
                    attempts += 1;
                }
                _ => return Err(self.fail(session, operation, fault)),
            }
        }
    }

    async fn register_service(
        &self,
        session: &CancellationToken,
        category: ServiceCategory,
    ) -> Result<ServiceHandle, SyncError> {
        let service = self
            .membership
            .add_service(category)
            .await
            .map_err(|fault| self.fail(session, "add_service", fault))?;

        self.guard
            .commit(session, |w| {
                w.cache.set_service(service.clone());
                Ok(())
            })
            .await?;
        info!(category = category.wire_name(), id = service.id, "Service registered");
        Ok(service)
    }

    /// Lets the contact see the owner: leaves the block list, joins the allow list
    #[tracing::instrument(skip(self), fields(contact = %hash))]
    pub async fn appear_online(&self, hash: &ContactHash) -> Result<MutationOutcome, SyncError> {
        let session = self.guard.session().await;
        let result = self.change_visibility(&session, hash, false).await;
        self.settle(&session, "appear_online", result)
    }

    /// Hides the owner from the contact: leaves the allow list, joins the block list
    #[tracing::instrument(skip(self), fields(contact = %hash))]
    pub async fn appear_offline(&self, hash: &ContactHash) -> Result<MutationOutcome, SyncError> {
        let session = self.guard.session().await;
        let result = self.change_visibility(&session, hash, true).await;
        self.settle(&session, "appear_offline", result)
    }

    async fn change_visibility(
        &self,
        session: &CancellationToken,
        hash: &ContactHash,
        blocked: bool,
    ) -> Result<MutationOutcome, SyncError> {
        let (leave, join) = if blocked {
            (RoleLists::ALLOW, RoleLists::BLOCK)
        } else {
            (RoleLists::BLOCK, RoleLists::ALLOW)
        };

        let left = self.change_list(session, hash, leave, false).await?;
        let joined = self.change_list(session, hash, join, true).await?;
        if !left.is_applied() && !joined.is_applied() {
            return Ok(MutationOutcome::Unchanged);
        }

        self.emit(RosterEvent::ContactBlockedStatusChanged {
            contact: hash.clone(),
            blocked,
        });
        Ok(MutationOutcome::Applied)
    }

    // ========================================================================
    // Contacts
    // ========================================================================

    /// Creates a contact in the address book and adds it to the forward
    /// and allow lists
    ///
    /// Returns the contact's hash.
    #[tracing::instrument(skip(self, invitation))]
    pub async fn add_new_contact(
        &self,
        account: &str,
        client_type: ClientType,
        invitation: Option<String>,
    ) -> Result<ContactHash, SyncError> {
        let session = self.guard.session().await;
        let result = self
            .create_contact(&session, account, client_type, invitation)
            .await;
        self.settle(&session, "add_new_contact", result)
    }

    async fn create_contact(
        &self,
        session: &CancellationToken,
        account: &str,
        client_type: ClientType,
        invitation: Option<String>,
    ) -> Result<ContactHash, SyncError> {
        let hash = ContactHash::new(client_type, account)?;

        let known = self
            .guard
            .with_cache(|cache| cache.contact(&hash).and_then(|c| c.guid()).is_some())
            .await;
        if !known {
            let request = NewContactRequest {
                hash: hash.clone(),
                invitation: invitation.clone(),
            };
            let guid = self
                .membership
                .create_contact(&request)
                .await
                .map_err(|fault| self.fail(session, "create_contact", fault))?;

            self.guard
                .commit(session, |w| {
                    let contact = w.cache.ensure_contact(&hash);
                    contact.set_guid(guid);
                    contact.set_messenger_user(true);
                    contact.set_invitation(invitation);
                    Ok(())
                })
                .await?;
            info!(contact = %hash, %guid, "Contact created");
        }

        self.change_list(session, &hash, RoleLists::FORWARD, true)
            .await?;
        let blocked = self
            .guard
            .with_cache(|cache| cache.contact(&hash).is_some_and(|c| c.has_lists(RoleLists::BLOCK)))
            .await;
        if blocked {
            self.change_visibility(session, &hash, false).await?;
        } else {
            self.change_list(session, &hash, RoleLists::ALLOW, true)
                .await?;
        }
        Ok(hash)
    }

    /// Removes a contact from the address book, optionally blocking it
    ///
    /// The allow bit is cleared before the remote call and restored if the
    /// call fails. On success the forward bit and group filing are dropped,
    /// the change is withdrawn on the wire and the address book is
    /// re-fetched.
    #[tracing::instrument(skip(self), fields(contact = %hash))]
    pub async fn remove_contact(&self, hash: &ContactHash, block: bool) -> Result<(), SyncError> {
        let session = self.guard.session().await;
        let result = self.break_contact(&session, hash, block).await;
        self.settle(&session, "remove_contact", result)
    }

    async fn break_contact(
        &self,
        session: &CancellationToken,
        hash: &ContactHash,
        block: bool,
    ) -> Result<(), SyncError> {
        let guid = self.require_guid(hash).await?;

        let had_allow = self
            .guard
            .commit(session, |w| {
                let contact = w.cache.require_contact_mut(hash)?;
                let had = contact.has_lists(RoleLists::ALLOW);
                contact.remove_lists(RoleLists::ALLOW);
                Ok(had)
            })
            .await?;

        if let Err(fault) = self.membership.break_connection(&guid, block).await {
            if had_allow {
                self.guard
                    .commit(session, |w| {
                        w.cache.require_contact_mut(hash)?.add_lists(RoleLists::ALLOW);
                        Ok(())
                    })
                    .await?;
            }
            return Err(self.fail(session, "break_connection", fault));
        }

        let removed = self
            .guard
            .commit(session, |w| {
                let contact = w.cache.require_contact_mut(hash)?;
                let mut removed = contact.lists() & RoleLists::FORWARD;
                if had_allow {
                    removed |= RoleLists::ALLOW;
                }
                contact.remove_lists(RoleLists::FORWARD);
                contact.clear_groups();
                if block {
                    contact.add_lists(RoleLists::BLOCK);
                }
                Ok(removed)
            })
            .await?;

        if !removed.is_empty() {
            self.send_single(session, WireCommand::Rml, hash, removed)
                .await?;
        }
        if block {
            self.send_single(session, WireCommand::Adl, hash, RoleLists::BLOCK)
                .await?;
        }
        for list in removed.iter() {
            self.emit(RosterEvent::ContactRemoved {
                contact: hash.clone(),
                list,
            });
        }
        if block {
            self.emit(RosterEvent::ContactBlockedStatusChanged {
                contact: hash.clone(),
                blocked: true,
            });
        }
        info!(block, "Contact removed");

        self.refresh_default_book(session, Scenario::ContactSave)
            .await?;
        Ok(())
    }

    /// Changes the friendly name stored in the address book
    #[tracing::instrument(skip(self), fields(contact = %hash))]
    pub async fn rename_contact(
        &self,
        hash: &ContactHash,
        display_name: &str,
    ) -> Result<MutationOutcome, SyncError> {
        let session = self.guard.session().await;
        let result = self.update_display_name(&session, hash, display_name).await;
        self.settle(&session, "rename_contact", result)
    }

    async fn update_display_name(
        &self,
        session: &CancellationToken,
        hash: &ContactHash,
        display_name: &str,
    ) -> Result<MutationOutcome, SyncError> {
        let display_name = validate_name("Contact", display_name)?;
        let guid = self.require_guid(hash).await?;

        let current = self
            .guard
            .with_cache(|cache| cache.contact(hash).map(|c| c.display_name().to_string()))
            .await;
        if current.as_deref() == Some(display_name.as_str()) {
            return Ok(MutationOutcome::Unchanged);
        }

        let update = ContactUpdate {
            display_name: Some(display_name.clone()),
            ..ContactUpdate::default()
        };
        self.membership
            .update_contact(&guid, &update)
            .await
            .map_err(|fault| self.fail(session, "update_contact", fault))?;

        self.guard
            .commit(session, |w| {
                w.cache.require_contact_mut(hash)?.set_display_name(display_name);
                Ok(())
            })
            .await?;
        Ok(MutationOutcome::Applied)
    }

    async fn require_guid(&self, hash: &ContactHash) -> Result<ContactGuid, SyncError> {
        let guid = self
            .guard
            .with_cache(|cache| cache.require_contact(hash).map(|c| c.guid().copied()))
            .await?;
        guid.ok_or_else(|| {
            DomainError::ValidationFailed(format!("{hash} has no address book entry")).into()
        })
    }

    // ========================================================================
    // Groups
    // ========================================================================

    /// Creates a contact group
    #[tracing::instrument(skip(self))]
    pub async fn add_contact_group(&self, name: &str) -> Result<GroupId, SyncError> {
        let session = self.guard.session().await;
        let result = self.create_group(&session, name).await;
        self.settle(&session, "add_contact_group", result)
    }

    async fn create_group(
        &self,
        session: &CancellationToken,
        name: &str,
    ) -> Result<GroupId, SyncError> {
        let name = validate_name("Group", name)?;

        let duplicate = self
            .guard
            .with_cache(|cache| cache.group_by_name(&name).is_some())
            .await;
        if duplicate {
            return Err(
                DomainError::ValidationFailed(format!("Group already exists: {name}")).into(),
            );
        }

        let id = self
            .membership
            .add_group(&name)
            .await
            .map_err(|fault| self.fail(session, "add_group", fault))?;

        self.guard
            .commit(session, |w| {
                w.cache.insert_group(ContactGroup::new(id, name.clone()));
                Ok(())
            })
            .await?;
        self.emit(RosterEvent::ContactGroupAdded { group: id, name });
        Ok(id)
    }

    /// Deletes a contact group; its contacts are unfiled
    #[tracing::instrument(skip(self))]
    pub async fn remove_contact_group(&self, group: &GroupId) -> Result<(), SyncError> {
        let session = self.guard.session().await;
        let result = self.delete_group(&session, group).await;
        self.settle(&session, "remove_contact_group", result)
    }

    async fn delete_group(
        &self,
        session: &CancellationToken,
        group: &GroupId,
    ) -> Result<(), SyncError> {
        self.require_group(group).await?;

        self.membership
            .delete_group(group)
            .await
            .map_err(|fault| self.fail(session, "delete_group", fault))?;

        let removed = self
            .guard
            .commit(session, |w| Ok(w.cache.remove_group(group)))
            .await?;
        if let Some(removed) = removed {
            self.emit(RosterEvent::ContactGroupRemoved {
                group: *group,
                name: removed.name().to_string(),
            });
        }
        Ok(())
    }

    /// Renames a contact group
    #[tracing::instrument(skip(self))]
    pub async fn rename_group(
        &self,
        group: &GroupId,
        name: &str,
    ) -> Result<MutationOutcome, SyncError> {
        let session = self.guard.session().await;
        let result = self.update_group_name(&session, group, name).await;
        self.settle(&session, "rename_group", result)
    }

    async fn update_group_name(
        &self,
        session: &CancellationToken,
        group: &GroupId,
        name: &str,
    ) -> Result<MutationOutcome, SyncError> {
        let name = validate_name("Group", name)?;
        let current = self.require_group(group).await?;
        if current.name() == name {
            return Ok(MutationOutcome::Unchanged);
        }

        self.membership
            .rename_group(group, &name)
            .await
            .map_err(|fault| self.fail(session, "rename_group", fault))?;

        self.guard
            .commit(session, |w| {
                w.cache.require_group_mut(group)?.rename(name);
                Ok(())
            })
            .await?;
        Ok(MutationOutcome::Applied)
    }

    /// Files a contact under a group
    #[tracing::instrument(skip(self), fields(contact = %hash))]
    pub async fn add_contact_to_group(
        &self,
        hash: &ContactHash,
        group: &GroupId,
    ) -> Result<MutationOutcome, SyncError> {
        let session = self.guard.session().await;
        let result = self.change_group_filing(&session, hash, group, true).await;
        self.settle(&session, "add_contact_to_group", result)
    }

    /// Removes a contact from a group
    #[tracing::instrument(skip(self), fields(contact = %hash))]
    pub async fn remove_contact_from_group(
        &self,
        hash: &ContactHash,
        group: &GroupId,
    ) -> Result<MutationOutcome, SyncError> {
        let session = self.guard.session().await;
        let result = self.change_group_filing(&session, hash, group, false).await;
        self.settle(&session, "remove_contact_from_group", result)
    }

    async fn change_group_filing(
        &self,
        session: &CancellationToken,
        hash: &ContactHash,
        group: &GroupId,
        file: bool,
    ) -> Result<MutationOutcome, SyncError> {
        self.require_group(group).await?;
        let guid = self.require_guid(hash).await?;

        let filed = self
            .guard
            .with_cache(|cache| cache.contact(hash).is_some_and(|c| c.groups().contains(group)))
            .await;
        if filed == file {
            return Ok(MutationOutcome::Unchanged);
        }

        let (operation, result) = if file {
            ("add_contact_to_group", self.membership.add_contact_to_group(&guid, group).await)
        } else {
            (
                "delete_contact_from_group",
                self.membership.delete_contact_from_group(&guid, group).await,
            )
        };
        result.map_err(|fault| self.fail(session, operation, fault))?;

        self.guard
            .commit(session, |w| {
                let contact = w.cache.require_contact_mut(hash)?;
                if file {
                    contact.add_group(*group);
                } else {
                    contact.remove_group(group);
                }
                Ok(())
            })
            .await?;
        Ok(MutationOutcome::Applied)
    }

    async fn require_group(&self, group: &GroupId) -> Result<ContactGroup, SyncError> {
        self.guard
            .with_cache(|cache| cache.group(group).cloned())
            .await
            .ok_or_else(|| DomainError::GroupNotFound(group.to_string()).into())
    }

    // ========================================================================
    // Circles
    // ========================================================================

    /// Creates a circle owned by the owner and announces it
    #[tracing::instrument(skip(self))]
    pub async fn create_circle(&self, name: &str) -> Result<CircleId, SyncError> {
        let session = self.guard.session().await;
        let result = self.host_circle(&session, name).await;
        self.settle(&session, "create_circle", result)
    }

    async fn host_circle(
        &self,
        session: &CancellationToken,
        name: &str,
    ) -> Result<CircleId, SyncError> {
        let name = validate_name("Circle", name)?;

        let id = self
            .membership
            .create_circle(&name)
            .await
            .map_err(|fault| self.fail(session, "create_circle", fault))?;

        let circle = Circle::new(id, name, CircleState::Accepted, CircleRole::Admin);
        let hash = circle.contact_hash();
        self.guard
            .commit(session, |w| {
                w.cache.insert_circle(circle);
                Ok(())
            })
            .await?;

        self.send_single(session, WireCommand::Adl, &hash, CIRCLE_ANNOUNCED_LISTS)
            .await?;
        self.emit(RosterEvent::CircleJoined { circle: id });
        info!(circle = %id, "Circle created");
        Ok(id)
    }

    /// Invites an account into a circle
    #[tracing::instrument(skip(self, message), fields(member = %member))]
    pub async fn invite_circle_member(
        &self,
        circle: &CircleId,
        member: &ContactHash,
        message: Option<&str>,
    ) -> Result<MutationOutcome, SyncError> {
        let session = self.guard.session().await;
        let result = self.invite_member(&session, circle, member, message).await;
        self.settle(&session, "invite_circle_member", result)
    }

    async fn invite_member(
        &self,
        session: &CancellationToken,
        circle: &CircleId,
        member: &ContactHash,
        message: Option<&str>,
    ) -> Result<MutationOutcome, SyncError> {
        let current = self.require_circle(circle).await?;
        if !current.is_accepted() {
            return Err(DomainError::ValidationFailed(format!(
                "Circle {circle} has not been joined"
            ))
            .into());
        }
        if current.members().contains_key(member) {
            return Ok(MutationOutcome::Unchanged);
        }

        self.membership
            .invite_circle_member(circle, member, message)
            .await
            .map_err(|fault| self.fail(session, "invite_circle_member", fault))?;

        self.guard
            .commit(session, |w| {
                w.cache
                    .require_circle_mut(circle)?
                    .upsert_member(member.clone(), RoleLists::PENDING);
                Ok(())
            })
            .await?;
        Ok(MutationOutcome::Applied)
    }

    /// Accepts a circle invitation, announces the circle and fetches its book
    #[tracing::instrument(skip(self))]
    pub async fn accept_circle_invitation(
        &self,
        circle: &CircleId,
    ) -> Result<MutationOutcome, SyncError> {
        let session = self.guard.session().await;
        let result = self.join_circle(&session, circle).await;
        self.settle(&session, "accept_circle_invitation", result)
    }

    async fn join_circle(
        &self,
        session: &CancellationToken,
        circle: &CircleId,
    ) -> Result<MutationOutcome, SyncError> {
        let current = self.require_circle(circle).await?;
        if current.is_accepted() {
            return Ok(MutationOutcome::Unchanged);
        }

        self.membership
            .respond_circle_invitation(circle, true)
            .await
            .map_err(|fault| self.fail(session, "respond_circle_invitation", fault))?;

        self.guard
            .commit(session, |w| {
                w.cache
                    .require_circle_mut(circle)?
                    .set_state(CircleState::Accepted);
                Ok(())
            })
            .await?;

        self.send_single(
            session,
            WireCommand::Adl,
            &current.contact_hash(),
            CIRCLE_ANNOUNCED_LISTS,
        )
        .await?;
        self.emit(RosterEvent::CircleJoined { circle: *circle });

        self.refresh_circle_book(session, Scenario::CircleSave, circle)
            .await?;
        Ok(MutationOutcome::Applied)
    }

    /// Declines a circle invitation and forgets the circle
    #[tracing::instrument(skip(self))]
    pub async fn reject_circle_invitation(&self, circle: &CircleId) -> Result<(), SyncError> {
        let session = self.guard.session().await;
        let result = self.decline_circle(&session, circle).await;
        self.settle(&session, "reject_circle_invitation", result)
    }

    async fn decline_circle(
        &self,
        session: &CancellationToken,
        circle: &CircleId,
    ) -> Result<(), SyncError> {
        let current = self.require_circle(circle).await?;
        if current.is_accepted() {
            return Err(DomainError::ValidationFailed(format!(
                "Circle {circle} was already joined"
            ))
            .into());
        }

        self.membership
            .respond_circle_invitation(circle, false)
            .await
            .map_err(|fault| self.fail(session, "respond_circle_invitation", fault))?;

        self.guard
            .commit(session, |w| {
                w.cache.remove_circle(circle);
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Leaves a circle and withdraws it from the wire
    #[tracing::instrument(skip(self))]
    pub async fn exit_circle(&self, circle: &CircleId) -> Result<(), SyncError> {
        let session = self.guard.session().await;
        let result = self.leave_circle(&session, circle).await;
        self.settle(&session, "exit_circle", result)
    }

    async fn leave_circle(
        &self,
        session: &CancellationToken,
        circle: &CircleId,
    ) -> Result<(), SyncError> {
        let current = self.require_circle(circle).await?;

        self.membership
            .exit_circle(circle)
            .await
            .map_err(|fault| self.fail(session, "exit_circle", fault))?;

        self.guard
            .commit(session, |w| {
                w.cache.remove_circle(circle);
                Ok(())
            })
            .await?;

        if current.is_accepted() {
            self.send_single(
                session,
                WireCommand::Rml,
                &current.contact_hash(),
                CIRCLE_ANNOUNCED_LISTS,
            )
            .await?;
            self.emit(RosterEvent::CircleLeft { circle: *circle });
        }
        Ok(())
    }

    async fn require_circle(&self, circle: &CircleId) -> Result<Circle, SyncError> {
        self.guard
            .with_cache(|cache| cache.circle(circle).cloned())
            .await
            .ok_or_else(|| DomainError::CircleNotFound(circle.to_string()).into())
    }
}
