//! Sign-off while a remote call is in flight

use rostersync_core::domain::{RoleLists, ServiceCategory, SyncState};
use rostersync_core::ports::Scenario;
use rostersync_sync::SyncError;

use crate::common;

#[tokio::test]
async fn test_sign_off_during_member_call() {
    let h = common::harness();
    h.membership.add_service_row(ServiceCategory::Messenger);
    h.synchronize().await;
    let bob = common::contact("bob@example.com");
    let mut events = h.engine.subscribe();

    let gate = h.membership.hold("add_member");
    let engine = h.engine.clone();
    let target = bob.clone();
    let task =
        tokio::spawn(async move { engine.add_contact_to_list(&target, RoleLists::ALLOW).await });

    gate.entered().await;
    let saves = h.store.saves();
    h.engine.sign_off().await;
    gate.release();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert_eq!(h.store.saves(), saves);
    assert!(h.engine.contact(&bob).await.is_none());
    assert!(h.channel.sent().is_empty());
    assert!(common::drain(&mut events).is_empty());
}

#[tokio::test]
async fn test_sign_off_during_bootstrap_fetch() {
    let h = common::harness();
    h.membership
        .add_member_row(&common::contact("alice@example.com"), RoleLists::ALLOW);
    let mut events = h.engine.subscribe();

    let gate = h.membership.hold("fetch_membership");
    let engine = h.engine.clone();
    let task = tokio::spawn(async move { engine.bootstrap().await });

    gate.entered().await;
    let saves = h.store.saves();
    h.engine.sign_off().await;
    gate.release();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert_eq!(h.store.saves(), saves);
    assert_eq!(h.membership.count("fetch_address_book"), 0);
    assert_eq!(h.engine.state().await, SyncState::Unsynchronized);
    assert!(h.engine.contacts().await.is_empty());
    assert!(h.channel.sent().is_empty());
    assert!(common::drain(&mut events).is_empty());
}

#[tokio::test]
async fn test_sign_off_during_refresh_fetch() {
    let h = common::harness();
    h.synchronize().await;
    let carol = common::contact("carol@example.com");
    h.membership.add_member_row(&carol, RoleLists::ALLOW);
    let mut events = h.engine.subscribe();

    let gate = h.membership.hold("fetch_membership");
    let engine = h.engine.clone();
    let task = tokio::spawn(async move { engine.refresh_address_book(Scenario::Timer).await });

    gate.entered().await;
    let saves = h.store.saves();
    h.engine.sign_off().await;
    gate.release();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert_eq!(h.store.saves(), saves);
    assert!(h.engine.contact(&carol).await.is_none());
    assert!(common::drain(&mut events).is_empty());
}
