//! Initial batch ordering, acknowledgment tracking and sign-off

use rostersync_core::domain::{CircleState, RoleLists, RosterEvent, SyncState, TransactionId};

use crate::common;

#[tokio::test]
async fn test_contact_batches_precede_circle_batches() {
    let h = common::harness();
    h.membership
        .add_member_row(&common::contact("alice@example.com"), RoleLists::ALLOW);
    h.membership.add_circle_row("Family", CircleState::Accepted);

    let report = h.engine.bootstrap().await.unwrap();

    let sent = h.channel.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent[0].trid < sent[1].trid);
    assert!(sent[0].payload.contains("<d n=\"example.com\">"));
    assert!(!sent[0].payload.contains("live.com"));
    assert!(sent[1].payload.contains("<d n=\"live.com\">"));
    assert!(sent[1].payload.contains("<s l=\"3\" n=\"IM\"/>"));
    assert_eq!(report.transactions, vec![sent[0].trid, sent[1].trid]);
}

#[tokio::test]
async fn test_pending_invitation_circle_is_not_announced() {
    let h = common::harness();
    h.membership.add_circle_row("Invited", CircleState::PendingInvitation);

    let report = h.engine.bootstrap().await.unwrap();

    assert_eq!(report.transactions.len(), 1);
    assert_eq!(h.membership.count("fetch_circle_book"), 0);
}

#[tokio::test]
async fn test_completion_fires_once_after_last_acknowledgment() {
    let h = common::harness();
    for i in 0..400 {
        h.membership.add_member_row(
            &common::contact(&format!("user{i:03}@example.com")),
            RoleLists::ALLOW,
        );
    }
    h.membership.add_circle_row("Team", CircleState::Accepted);
    let mut events = h.engine.subscribe();

    let report = h.engine.bootstrap().await.unwrap();
    assert!(report.transactions.len() >= 3);
    for sent in h.channel.sent() {
        assert!(sent.payload.len() <= 7300);
    }

    // Acknowledge in reverse order
    let mut pending: Vec<TransactionId> = report.transactions.clone();
    pending.reverse();
    let last = pending.pop().unwrap();
    for trid in pending {
        assert!(h.engine.on_command_acknowledged(trid).await.unwrap());
        assert_eq!(h.engine.state().await, SyncState::AwaitingAcknowledgment);
    }
    assert!(common::drain(&mut events).is_empty());

    assert!(h.engine.on_command_acknowledged(last).await.unwrap());
    assert_eq!(h.engine.state().await, SyncState::Synchronized);
    assert_eq!(
        common::drain(&mut events),
        vec![RosterEvent::SignedIn, RosterEvent::SynchronizationCompleted]
    );

    // A repeated acknowledgment changes nothing
    assert!(!h.engine.on_command_acknowledged(last).await.unwrap());
    assert!(common::drain(&mut events).is_empty());
}

#[tokio::test]
async fn test_every_contact_is_announced_exactly_once() {
    let h = common::harness();
    let contacts: Vec<_> = (0..250)
        .map(|i| common::contact(&format!("member{i:03}@example.com")))
        .collect();
    for hash in &contacts {
        h.membership.add_member_row(hash, RoleLists::ALLOW);
    }

    h.engine.bootstrap().await.unwrap();

    let payloads: String = h.channel.sent().into_iter().map(|s| s.payload).collect();
    for i in 0..250 {
        let node = format!("<c n=\"member{i:03}\" t=\"1\">");
        assert_eq!(payloads.matches(&node).count(), 1, "{node}");
    }
    for hash in &contacts {
        let contact = h.engine.contact(hash).await.unwrap();
        assert_eq!(contact.pending_announcements(), 1);
    }
}

#[tokio::test]
async fn test_acknowledgment_clears_announcement_counters() {
    let h = common::harness();
    let alice = common::contact("alice@example.com");
    h.membership.add_member_row(&alice, RoleLists::ALLOW);

    let report = h.engine.bootstrap().await.unwrap();
    assert_eq!(h.engine.pending_transactions().await, report.transactions);
    h.engine
        .on_command_acknowledged(report.transactions[0])
        .await
        .unwrap();

    assert_eq!(
        h.engine.contact(&alice).await.unwrap().pending_announcements(),
        0
    );
    assert!(h.engine.pending_transactions().await.is_empty());
}

#[tokio::test]
async fn test_unknown_acknowledgment_is_ignored() {
    let h = common::harness();
    let report = h.engine.bootstrap().await.unwrap();

    let known = h
        .engine
        .on_command_acknowledged(TransactionId::new(9999))
        .await
        .unwrap();

    assert!(!known);
    assert_eq!(h.engine.state().await, SyncState::AwaitingAcknowledgment);
    assert_eq!(h.engine.pending_transactions().await, report.transactions);
}

#[tokio::test]
async fn test_pending_reverse_is_reconciled_on_completion() {
    let h = common::harness();
    let bob = common::contact("bob@example.com");
    let carol = common::contact("carol@example.com");
    // Bob is already a forward contact; Carol is a new request
    h.membership.add_pending_row(&bob, "hi");
    h.membership.add_contact_row(&bob);
    h.membership.add_pending_row(&carol, "add me");
    let mut events = h.engine.subscribe();

    h.synchronize().await;

    let events = common::drain(&mut events);
    assert_eq!(
        events,
        vec![
            RosterEvent::SignedIn,
            RosterEvent::SynchronizationCompleted,
            RosterEvent::ReverseAdded {
                contact: carol.clone()
            },
        ]
    );
    let bob = h.engine.contact(&bob).await.unwrap();
    assert!(!bob.has_lists(RoleLists::PENDING));
    assert_eq!(bob.invitation(), None);
    let carol = h.engine.contact(&carol).await.unwrap();
    assert!(carol.has_lists(RoleLists::PENDING));
    assert_eq!(carol.invitation(), Some("add me"));
}

#[tokio::test]
async fn test_sign_off_drops_pending_batches() {
    let h = common::harness();
    let report = h.engine.bootstrap().await.unwrap();
    let mut events = h.engine.subscribe();

    h.engine.sign_off().await;

    assert_eq!(h.engine.state().await, SyncState::Unsynchronized);
    assert!(h.engine.pending_transactions().await.is_empty());
    assert!(!h
        .engine
        .on_command_acknowledged(report.transactions[0])
        .await
        .unwrap());
    assert!(common::drain(&mut events).is_empty());

    // A new session starts over and signs in again
    h.synchronize().await;
    assert_eq!(h.engine.state().await, SyncState::Synchronized);
    assert_eq!(common::count(&common::drain(&mut events), "signed_in"), 1);
}

#[tokio::test]
async fn test_channel_failure_aborts_bootstrap() {
    let h = common::harness();
    h.channel.set_failing(true);

    let err = h.engine.bootstrap().await.unwrap_err();

    assert!(matches!(err, rostersync_sync::SyncError::Channel(_)));
    assert_eq!(h.engine.state().await, SyncState::Unsynchronized);
    assert!(h.engine.pending_transactions().await.is_empty());
}

#[tokio::test]
async fn test_mutation_batch_does_not_hold_back_completion() {
    let h = common::harness();
    let report = h.engine.bootstrap().await.unwrap();
    let bob = common::contact("bob@example.com");

    h.engine
        .add_contact_to_list(&bob, RoleLists::FORWARD)
        .await
        .unwrap();
    let pending = h.engine.pending_transactions().await;
    assert_eq!(pending.len(), 2);
    let mutation = pending[1];

    h.engine
        .on_command_acknowledged(report.transactions[0])
        .await
        .unwrap();

    assert_eq!(h.engine.state().await, SyncState::Synchronized);
    assert_eq!(h.engine.pending_transactions().await, vec![mutation]);
}

// ============================================================================
// Rejections
// ============================================================================

#[tokio::test]
async fn test_rejected_initial_batch_aborts_bootstrap() {
    let h = common::harness();
    let alice = common::contact("alice@example.com");
    h.membership.add_member_row(&alice, RoleLists::ALLOW);
    h.membership.add_circle_row("Family", CircleState::Accepted);
    let mut events = h.engine.subscribe();

    let report = h.engine.bootstrap().await.unwrap();
    assert_eq!(report.transactions.len(), 2);

    let known = h
        .engine
        .on_command_rejected(report.transactions[0], 241)
        .await
        .unwrap();

    assert!(known);
    assert_eq!(h.engine.state().await, SyncState::Unsynchronized);
    assert!(h.engine.pending_transactions().await.is_empty());
    assert_eq!(
        h.engine.contact(&alice).await.unwrap().pending_announcements(),
        0
    );
    match common::drain(&mut events).as_slice() {
        [RosterEvent::ServiceOperationFailed { operation, reason }] => {
            assert_eq!(operation, "bootstrap");
            assert!(reason.contains("241"));
        }
        other => panic!("unexpected events: {other:?}"),
    }

    // The late acknowledgment of the other batch is ignored
    assert!(!h
        .engine
        .on_command_acknowledged(report.transactions[1])
        .await
        .unwrap());

    // Bootstrap can run again
    h.synchronize().await;
    assert_eq!(h.engine.state().await, SyncState::Synchronized);
}

#[tokio::test]
async fn test_rejected_mutation_batch_is_dropped() {
    let h = common::harness();
    h.synchronize().await;
    let mut events = h.engine.subscribe();
    let bob = common::contact("bob@example.com");

    h.engine
        .add_contact_to_list(&bob, RoleLists::FORWARD)
        .await
        .unwrap();
    common::drain(&mut events);
    let trid = h.channel.sent()[0].trid;

    assert!(h.engine.on_command_rejected(trid, 208).await.unwrap());

    assert_eq!(h.engine.state().await, SyncState::Synchronized);
    assert!(h.engine.pending_transactions().await.is_empty());
    assert_eq!(
        common::drain(&mut events),
        vec![RosterEvent::ServiceOperationFailed {
            operation: "ADL".to_string(),
            reason: format!("Notification server rejected ADL {trid} with error 208"),
        }]
    );

    assert!(!h.engine.on_command_rejected(trid, 208).await.unwrap());
    assert!(common::drain(&mut events).is_empty());
}
