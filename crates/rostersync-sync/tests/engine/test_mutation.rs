//! List, contact, group and circle mutations

use rostersync_core::domain::{
    CircleState, ClientType, RoleLists, RosterEvent, ServiceCategory, ServiceFault,
};
use rostersync_core::ports::WireCommand;
use rostersync_sync::{MutationOutcome, SyncError};

use crate::common::{self, Harness};

/// Synchronized engine knowing Alice on the forward and allow lists
async fn with_alice() -> (Harness, rostersync_core::domain::ContactHash) {
    let h = common::harness();
    let alice = common::contact("alice@example.com");
    h.membership.add_service_row(ServiceCategory::Messenger);
    h.membership.add_member_row(&alice, RoleLists::ALLOW);
    h.membership.add_contact_row(&alice);
    h.synchronize().await;
    (h, alice)
}

// ============================================================================
// Lists
// ============================================================================

#[tokio::test]
async fn test_add_to_allow_list_is_idempotent() {
    let h = common::harness();
    h.synchronize().await;
    let bob = common::contact("bob@example.com");

    let first = h.engine.add_contact_to_list(&bob, RoleLists::ALLOW).await.unwrap();
    let second = h.engine.add_contact_to_list(&bob, RoleLists::ALLOW).await.unwrap();

    assert_eq!(first, MutationOutcome::Applied);
    assert_eq!(second, MutationOutcome::Unchanged);
    assert_eq!(h.membership.count("add_member"), 1);
    assert!(h
        .engine
        .contact(&bob)
        .await
        .unwrap()
        .has_lists(RoleLists::ALLOW));

    let sent = h.channel.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].command, WireCommand::Adl);
    assert_eq!(
        sent[0].payload,
        "<ml><d n=\"example.com\"><c n=\"bob\" t=\"1\"><s l=\"2\" n=\"IM\"/></c></d></ml>"
    );
}

#[tokio::test]
async fn test_missing_service_is_registered_lazily() {
    let h = common::harness();
    h.synchronize().await;
    let bob = common::contact("bob@example.com");

    h.engine.add_contact_to_list(&bob, RoleLists::ALLOW).await.unwrap();
    h.engine.add_contact_to_list(&bob, RoleLists::BLOCK).await.unwrap();

    assert_eq!(
        h.membership.calls()[2..],
        ["add_service", "add_member", "add_member"]
    );
    assert!(h.engine.snapshot().await.service(ServiceCategory::Messenger).is_some());
}

#[tokio::test]
async fn test_service_missing_fault_registers_and_retries_once() {
    let (h, alice) = with_alice().await;
    h.membership
        .fail_next("add_member", ServiceFault::ServiceMissing);

    let outcome = h.engine.add_contact_to_list(&alice, RoleLists::BLOCK).await.unwrap();

    assert_eq!(outcome, MutationOutcome::Applied);
    assert_eq!(h.membership.count("add_service"), 1);
    assert_eq!(h.membership.count("add_member"), 2);
}

#[tokio::test]
async fn test_repeated_service_missing_fails() {
    let (h, alice) = with_alice().await;
    h.membership
        .fail_next("add_member", ServiceFault::ServiceMissing);
    h.membership
        .fail_next("add_member", ServiceFault::ServiceMissing);

    let err = h
        .engine
        .add_contact_to_list(&alice, RoleLists::BLOCK)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Service { .. }));
    assert!(!h
        .engine
        .contact(&alice)
        .await
        .unwrap()
        .has_lists(RoleLists::BLOCK));
}

#[tokio::test]
async fn test_member_conflicts_are_treated_as_success() {
    let (h, alice) = with_alice().await;
    h.membership
        .fail_next("add_member", ServiceFault::MemberAlreadyExists);
    h.membership
        .fail_next("delete_member", ServiceFault::MemberDoesNotExist);

    let added = h.engine.add_contact_to_list(&alice, RoleLists::HIDE).await.unwrap();
    let removed = h
        .engine
        .remove_contact_from_list(&alice, RoleLists::ALLOW)
        .await
        .unwrap();

    assert_eq!(added, MutationOutcome::Applied);
    assert_eq!(removed, MutationOutcome::Applied);
    let contact = h.engine.contact(&alice).await.unwrap();
    assert!(contact.has_lists(RoleLists::HIDE));
    assert!(!contact.has_lists(RoleLists::ALLOW));

    let sent = h.channel.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent[0].payload.contains("<s l=\"4\" n=\"PE\"/>"));
    assert_eq!(sent[1].command, WireCommand::Rml);
}

#[tokio::test]
async fn test_terminal_fault_leaves_roster_untouched() {
    let (h, alice) = with_alice().await;
    let mut events = h.engine.subscribe();
    h.membership.fail_next(
        "add_member",
        ServiceFault::Transport("timed out".to_string()),
    );

    let err = h
        .engine
        .add_contact_to_list(&alice, RoleLists::BLOCK)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Service { ref operation, .. } if operation == "add_member"));
    assert!(!h
        .engine
        .contact(&alice)
        .await
        .unwrap()
        .has_lists(RoleLists::BLOCK));
    assert!(h.channel.sent().is_empty());
    match common::drain(&mut events).as_slice() {
        [RosterEvent::ServiceOperationFailed { operation, reason }] => {
            assert_eq!(operation, "add_member");
            assert!(reason.contains("timed out"));
        }
        other => panic!("unexpected events: {other:?}"),
    }
}

#[tokio::test]
async fn test_channel_failure_reports_instead_of_success() {
    let h = common::harness();
    h.synchronize().await;
    let mut events = h.engine.subscribe();
    let bob = common::contact("bob@example.com");
    h.channel.set_failing(true);

    let err = h
        .engine
        .add_contact_to_list(&bob, RoleLists::ALLOW)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Channel(_)));
    assert!(h.engine.pending_transactions().await.is_empty());
    match common::drain(&mut events).as_slice() {
        [RosterEvent::ServiceOperationFailed { operation, reason }] => {
            assert_eq!(operation, "add_contact_to_list");
            assert!(reason.contains("connection reset"));
        }
        other => panic!("unexpected events: {other:?}"),
    }
}

#[tokio::test]
async fn test_storage_failure_is_reported() {
    let h = common::harness();
    h.synchronize().await;
    let mut events = h.engine.subscribe();
    h.store.set_failing_saves(true);

    let err = h.engine.add_contact_group("Friends").await.unwrap_err();

    assert!(matches!(err, SyncError::Storage(_)));
    assert!(h.engine.groups().await.is_empty());
    assert_eq!(
        common::drain(&mut events),
        vec![RosterEvent::ServiceOperationFailed {
            operation: "add_contact_group".to_string(),
            reason: "Storage error: disk full".to_string(),
        }]
    );
}

#[tokio::test]
async fn test_composite_failure_is_reported_once() {
    let (h, alice) = with_alice().await;
    let mut events = h.engine.subscribe();
    h.channel.set_failing(true);

    let err = h.engine.appear_offline(&alice).await.unwrap_err();

    assert!(matches!(err, SyncError::Channel(_)));
    let events = common::drain(&mut events);
    assert_eq!(common::count(&events, "service_operation_failed"), 1);
    assert_eq!(common::count(&events, "contact_removed"), 0);
    assert_eq!(common::count(&events, "contact_blocked_status_changed"), 0);
}

#[tokio::test]
async fn test_forward_list_is_wire_only() {
    let h = common::harness();
    h.synchronize().await;
    let bob = common::contact("bob@example.com");

    h.engine.add_contact_to_list(&bob, RoleLists::FORWARD).await.unwrap();

    assert!(h.membership.calls()[2..].is_empty());
    let sent = h.channel.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].payload.contains("<s l=\"1\" n=\"IM\"/>"));
}

#[tokio::test]
async fn test_lists_outside_the_client_set_are_rejected() {
    let (h, alice) = with_alice().await;
    let calls = h.membership.calls().len();

    for list in [RoleLists::REVERSE, RoleLists::PENDING, RoleLists::ALLOW | RoleLists::BLOCK] {
        let err = h.engine.add_contact_to_list(&alice, list).await.unwrap_err();
        assert!(matches!(err, SyncError::Domain(_)));
    }
    assert_eq!(h.membership.calls().len(), calls);
}

#[tokio::test]
async fn test_remove_absent_list_is_unchanged() {
    let (h, alice) = with_alice().await;

    let outcome = h
        .engine
        .remove_contact_from_list(&alice, RoleLists::BLOCK)
        .await
        .unwrap();

    assert_eq!(outcome, MutationOutcome::Unchanged);
    assert_eq!(h.membership.count("delete_member"), 0);
}

#[tokio::test]
async fn test_appear_offline_then_online() {
    let (h, alice) = with_alice().await;
    let mut events = h.engine.subscribe();

    let offline = h.engine.appear_offline(&alice).await.unwrap();
    assert_eq!(offline, MutationOutcome::Applied);
    let contact = h.engine.contact(&alice).await.unwrap();
    assert!(contact.has_lists(RoleLists::BLOCK));
    assert!(!contact.has_lists(RoleLists::ALLOW));
    assert_eq!(
        common::drain(&mut events),
        vec![
            RosterEvent::ContactRemoved {
                contact: alice.clone(),
                list: RoleLists::ALLOW
            },
            RosterEvent::ContactAdded {
                contact: alice.clone(),
                list: RoleLists::BLOCK
            },
            RosterEvent::ContactBlockedStatusChanged {
                contact: alice.clone(),
                blocked: true
            },
        ]
    );

    assert_eq!(
        h.engine.appear_offline(&alice).await.unwrap(),
        MutationOutcome::Unchanged
    );
    assert!(common::drain(&mut events).is_empty());

    h.engine.appear_online(&alice).await.unwrap();
    let contact = h.engine.contact(&alice).await.unwrap();
    assert!(contact.has_lists(RoleLists::ALLOW));
    assert!(!contact.has_lists(RoleLists::BLOCK));
    assert_eq!(
        common::count(&common::drain(&mut events), "contact_blocked_status_changed"),
        1
    );
}

// ============================================================================
// Contacts
// ============================================================================

#[tokio::test]
async fn test_add_new_contact() {
    let h = common::harness();
    h.synchronize().await;

    let dave = h
        .engine
        .add_new_contact("Dave@Example.com", ClientType::WindowsLive, Some("hi".to_string()))
        .await
        .unwrap();

    assert_eq!(dave, common::contact("dave@example.com"));
    let contact = h.engine.contact(&dave).await.unwrap();
    assert!(contact.guid().is_some());
    assert!(contact.is_messenger_user());
    assert!(contact.has_lists(RoleLists::FORWARD | RoleLists::ALLOW));
    assert_eq!(h.membership.count("create_contact"), 1);
    assert_eq!(h.channel.sent().len(), 2);

    // Adding again reuses the address-book entry
    h.engine
        .add_new_contact("dave@example.com", ClientType::WindowsLive, None)
        .await
        .unwrap();
    assert_eq!(h.membership.count("create_contact"), 1);
}

#[tokio::test]
async fn test_add_new_contact_unblocks_blocked_contact() {
    let h = common::harness();
    let mallory = common::contact("mallory@example.com");
    h.membership.add_service_row(ServiceCategory::Messenger);
    h.membership.add_member_row(&mallory, RoleLists::BLOCK);
    h.synchronize().await;

    h.engine
        .add_new_contact("mallory@example.com", ClientType::WindowsLive, None)
        .await
        .unwrap();

    let contact = h.engine.contact(&mallory).await.unwrap();
    assert!(contact.has_lists(RoleLists::FORWARD | RoleLists::ALLOW));
    assert!(!contact.has_lists(RoleLists::BLOCK));
}

#[tokio::test]
async fn test_remove_contact() {
    let (h, alice) = with_alice().await;
    let mut events = h.engine.subscribe();

    h.engine.remove_contact(&alice, false).await.unwrap();

    let contact = h.engine.contact(&alice).await.unwrap();
    assert!(!contact.has_lists(RoleLists::FORWARD));
    assert!(!contact.has_lists(RoleLists::ALLOW));
    assert!(!contact.has_lists(RoleLists::BLOCK));

    let sent = h.channel.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].command, WireCommand::Rml);
    assert!(sent[0].payload.contains("<s l=\"3\" n=\"IM\"/>"));
    assert_eq!(
        h.membership.calls().last().copied(),
        Some("fetch_address_book")
    );
    assert_eq!(
        common::drain(&mut events),
        vec![
            RosterEvent::ContactRemoved {
                contact: alice.clone(),
                list: RoleLists::FORWARD
            },
            RosterEvent::ContactRemoved {
                contact: alice.clone(),
                list: RoleLists::ALLOW
            },
        ]
    );
}

#[tokio::test]
async fn test_remove_and_block_contact() {
    let (h, alice) = with_alice().await;
    let mut events = h.engine.subscribe();

    h.engine.remove_contact(&alice, true).await.unwrap();

    let contact = h.engine.contact(&alice).await.unwrap();
    assert_eq!(contact.lists() & RoleLists::CLIENT_SETTABLE, RoleLists::BLOCK);
    let sent = h.channel.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].command, WireCommand::Adl);
    assert!(sent[1].payload.contains("<s l=\"4\" n=\"IM\"/>"));
    assert!(common::drain(&mut events).contains(&RosterEvent::ContactBlockedStatusChanged {
        contact: alice.clone(),
        blocked: true
    }));
}

#[tokio::test]
async fn test_failed_remove_restores_allow_list() {
    let (h, alice) = with_alice().await;
    h.membership.fail_next(
        "break_connection",
        ServiceFault::Other("internal error".to_string()),
    );

    let err = h.engine.remove_contact(&alice, false).await.unwrap_err();

    assert!(matches!(err, SyncError::Service { .. }));
    let contact = h.engine.contact(&alice).await.unwrap();
    assert!(contact.has_lists(RoleLists::FORWARD | RoleLists::ALLOW));
    assert!(h.channel.sent().is_empty());
}

#[tokio::test]
async fn test_remove_unknown_contact() {
    let h = common::harness();
    h.synchronize().await;

    let err = h
        .engine
        .remove_contact(&common::contact("nobody@example.com"), false)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Domain(_)));
    assert_eq!(h.membership.count("break_connection"), 0);
}

#[tokio::test]
async fn test_rename_contact() {
    let (h, alice) = with_alice().await;

    let renamed = h.engine.rename_contact(&alice, " Alice A. ").await.unwrap();
    let again = h.engine.rename_contact(&alice, "Alice A.").await.unwrap();

    assert_eq!(renamed, MutationOutcome::Applied);
    assert_eq!(again, MutationOutcome::Unchanged);
    assert_eq!(h.membership.count("update_contact"), 1);
    assert_eq!(
        h.engine.contact(&alice).await.unwrap().display_name(),
        "Alice A."
    );
}

// ============================================================================
// Groups
// ============================================================================

#[tokio::test]
async fn test_group_lifecycle() {
    let (h, alice) = with_alice().await;
    let mut events = h.engine.subscribe();

    let group = h.engine.add_contact_group("Friends").await.unwrap();
    let duplicate = h.engine.add_contact_group(" Friends ").await;
    assert!(matches!(duplicate, Err(SyncError::Domain(_))));
    assert_eq!(h.membership.count("add_group"), 1);

    assert_eq!(
        h.engine.add_contact_to_group(&alice, &group).await.unwrap(),
        MutationOutcome::Applied
    );
    assert_eq!(
        h.engine.add_contact_to_group(&alice, &group).await.unwrap(),
        MutationOutcome::Unchanged
    );
    assert!(h.engine.contact(&alice).await.unwrap().groups().contains(&group));

    assert_eq!(
        h.engine.rename_group(&group, "Friends").await.unwrap(),
        MutationOutcome::Unchanged
    );
    h.engine.rename_group(&group, "Close friends").await.unwrap();

    h.engine.remove_contact_group(&group).await.unwrap();
    assert!(h.engine.groups().await.is_empty());
    assert!(h.engine.contact(&alice).await.unwrap().groups().is_empty());

    assert_eq!(
        common::drain(&mut events),
        vec![
            RosterEvent::ContactGroupAdded {
                group,
                name: "Friends".to_string()
            },
            RosterEvent::ContactGroupRemoved {
                group,
                name: "Close friends".to_string()
            },
        ]
    );
}

#[tokio::test]
async fn test_group_operations_require_known_group() {
    let (h, alice) = with_alice().await;
    let unknown = rostersync_core::domain::GroupId::new();

    assert!(matches!(
        h.engine.add_contact_to_group(&alice, &unknown).await,
        Err(SyncError::Domain(_))
    ));
    assert!(matches!(
        h.engine.remove_contact_group(&unknown).await,
        Err(SyncError::Domain(_))
    ));
    assert!(matches!(
        h.engine.add_contact_group("   ").await,
        Err(SyncError::Domain(_))
    ));
}

// ============================================================================
// Circles
// ============================================================================

#[tokio::test]
async fn test_create_invite_and_exit_circle() {
    let h = common::harness();
    h.synchronize().await;
    let mut events = h.engine.subscribe();
    let bob = common::contact("bob@example.com");

    let circle = h.engine.create_circle("Hiking").await.unwrap();
    assert_eq!(
        h.engine.invite_circle_member(&circle, &bob, Some("join us")).await.unwrap(),
        MutationOutcome::Applied
    );
    assert_eq!(
        h.engine.invite_circle_member(&circle, &bob, None).await.unwrap(),
        MutationOutcome::Unchanged
    );
    let circles = h.engine.circles().await;
    assert_eq!(circles.len(), 1);
    assert!(circles[0].members().contains_key(&bob));

    h.engine.exit_circle(&circle).await.unwrap();
    assert!(h.engine.circles().await.is_empty());

    let sent = h.channel.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].command, WireCommand::Adl);
    assert_eq!(sent[1].command, WireCommand::Rml);
    for frame in &sent {
        assert!(frame.payload.contains("<d n=\"live.com\">"));
        assert!(frame.payload.contains(&format!("<c n=\"{circle}\" t=\"9\">")));
    }
    assert_eq!(
        common::drain(&mut events),
        vec![
            RosterEvent::CircleJoined { circle },
            RosterEvent::CircleLeft { circle },
        ]
    );
}

#[tokio::test]
async fn test_accept_circle_invitation_fetches_members() {
    let h = common::harness();
    let circle = h
        .membership
        .add_circle_row("Book club", CircleState::PendingInvitation);
    let eve = common::contact("eve@example.com");
    h.membership.add_circle_member_row(&circle, &eve);
    h.synchronize().await;
    let mut events = h.engine.subscribe();

    let outcome = h.engine.accept_circle_invitation(&circle).await.unwrap();

    assert_eq!(outcome, MutationOutcome::Applied);
    assert_eq!(h.membership.count("respond_circle_invitation"), 1);
    assert_eq!(h.membership.count("fetch_circle_book"), 1);
    assert_eq!(h.channel.sent().len(), 1);
    assert_eq!(
        common::drain(&mut events),
        vec![
            RosterEvent::CircleJoined { circle },
            RosterEvent::CircleMemberJoined {
                circle,
                member: eve
            },
        ]
    );
    assert_eq!(
        h.engine.accept_circle_invitation(&circle).await.unwrap(),
        MutationOutcome::Unchanged
    );
}

#[tokio::test]
async fn test_reject_circle_invitation() {
    let h = common::harness();
    let circle = h
        .membership
        .add_circle_row("Spam", CircleState::PendingInvitation);
    h.synchronize().await;

    h.engine.reject_circle_invitation(&circle).await.unwrap();

    assert!(h.engine.circles().await.is_empty());
    assert!(h.channel.sent().is_empty());
    assert!(matches!(
        h.engine.exit_circle(&circle).await,
        Err(SyncError::Domain(_))
    ));
}
