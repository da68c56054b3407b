//! Integration tests for managed units of work and transaction enlistment.

use std::sync::Arc;

use keel_core::bus::MessageBus;
use keel_core::error::DomainError;
use keel_core::store::Outcome;
use keel_core::transaction::Transaction;
use keel_core::unit_of_work::DEFAULT_ALIAS;
use keel_test_support::domain::bank::Account;
use keel_test_support::domain::cycle::{Ping, Pong};
use keel_test_support::{Harness, RecordingBus};

#[tokio::test]
async fn test_unit_of_work_without_transaction_is_released_by_dispose() {
    // Arrange
    let harness = Harness::new();
    let manager = harness.manager(None);
    let uow = manager.get_unit_of_work(None).unwrap();
    harness
        .repository
        .add(&uow, Account::open("acc-a", "ada").unwrap())
        .unwrap();
    uow.submit_changes().await.unwrap();

    // Act
    uow.dispose().await.unwrap();

    // Assert
    assert!(uow.can_auto_dispose());
    assert!(!uow.is_active());
    assert!(manager.store().is_current_activity_empty_for(DEFAULT_ALIAS));
    assert_eq!(harness.event_store.committed_count(), 1);
}

#[tokio::test]
async fn test_nested_request_reuses_the_live_unit_of_work() {
    // Arrange
    let harness = Harness::new();
    let manager = harness.manager(None);
    let outer = manager.get_unit_of_work(None).unwrap();

    // Act
    let inner = manager.get_unit_of_work(None).unwrap();

    // Assert
    assert!(Arc::ptr_eq(&outer, &inner));
    assert_eq!(inner.alias(), DEFAULT_ALIAS);
    outer.dispose().await.unwrap();
    let fresh = manager.get_unit_of_work(None).unwrap();
    assert!(!Arc::ptr_eq(&outer, &fresh));
}

#[tokio::test]
async fn test_enlisted_unit_of_work_commits_with_the_transaction() {
    // Arrange
    let harness = Harness::new();
    let async_bus = Arc::new(RecordingBus::new());
    let manager = harness.manager(Some(async_bus.clone() as Arc<dyn MessageBus>));
    let transaction = Transaction::new();
    let uow = manager.get_unit_of_work(Some(&transaction)).unwrap();
    let account = harness
        .repository
        .add(&uow, Account::open("acc-a", "ada").unwrap())
        .unwrap();
    account.lock().deposit(25).unwrap();

    // Act
    uow.dispose().await.unwrap();
    let still_active = uow.is_active();
    let outcome = transaction.commit().await.unwrap();

    // Assert
    assert!(still_active);
    assert_eq!(outcome, Outcome::Committed);
    assert!(!uow.is_active());
    assert!(manager.store().is_current_activity_empty_for(DEFAULT_ALIAS));
    assert_eq!(harness.event_store.stream("bank.account", "acc-a").len(), 2);
    assert_eq!(harness.sync_bus.published().len(), 2);
    assert_eq!(async_bus.published().len(), 2);
}

#[tokio::test]
async fn test_rolled_back_transaction_discards_changes_and_skips_async_bus() {
    // Arrange
    let harness = Harness::new();
    let async_bus = Arc::new(RecordingBus::new());
    let manager = harness.manager(Some(async_bus.clone() as Arc<dyn MessageBus>));
    let transaction = Transaction::new();
    let uow = manager.get_unit_of_work(Some(&transaction)).unwrap();
    harness
        .repository
        .add(&uow, Account::open("acc-a", "ada").unwrap())
        .unwrap();

    // Act
    transaction.rollback().await.unwrap();

    // Assert
    assert!(!uow.is_active());
    assert_eq!(harness.event_store.committed_count(), 0);
    assert!(harness.sync_bus.published().is_empty());
    assert!(async_bus.published().is_empty());
}

#[tokio::test]
async fn test_failed_submit_turns_commit_into_rollback() {
    // Arrange
    let harness = Harness::new();
    let async_bus = Arc::new(RecordingBus::new());
    let manager = harness.manager(Some(async_bus.clone() as Arc<dyn MessageBus>));
    let setup = manager.get_unit_of_work(None).unwrap();
    harness
        .repository
        .add(&setup, Ping::open("ping", "pong").unwrap())
        .unwrap();
    harness
        .repository
        .add(&setup, Pong::open("pong", "ping").unwrap())
        .unwrap();
    setup.submit_changes().await.unwrap();
    setup.dispose().await.unwrap();

    let transaction = Transaction::new();
    let uow = manager.get_unit_of_work(Some(&transaction)).unwrap();
    let ping = harness
        .repository
        .get_by_id::<Ping>(&uow, "ping")
        .await
        .unwrap()
        .unwrap();
    ping.lock().serve().unwrap();

    // Act
    let result = transaction.commit().await;

    // Assert
    assert!(matches!(result, Err(DomainError::CascadeCycle { .. })));
    assert!(transaction.is_rollback_only());
    assert!(!uow.is_active());
    assert_eq!(harness.event_store.stream("rally.ping", "ping").len(), 1);
    assert!(async_bus.published().is_empty());
}

#[tokio::test]
async fn test_live_unit_of_work_is_enlisted_when_a_transaction_arrives() {
    // Arrange
    let harness = Harness::new();
    let manager = harness.manager(None);
    let uow = manager.get_unit_of_work(None).unwrap();
    harness
        .repository
        .add(&uow, Account::open("acc-a", "ada").unwrap())
        .unwrap();
    let transaction = Transaction::new();

    // Act
    let enlisted = manager.get_unit_of_work(Some(&transaction)).unwrap();
    let outcome = transaction.commit().await.unwrap();

    // Assert
    assert!(Arc::ptr_eq(&uow, &enlisted));
    assert!(!enlisted.can_auto_dispose());
    assert_eq!(outcome, Outcome::Committed);
    assert_eq!(harness.event_store.committed_count(), 1);
}

#[tokio::test]
async fn test_enlisted_unit_of_work_reused_without_transaction_stays_deferred() {
    // Arrange
    let harness = Harness::new();
    let manager = harness.manager(None);
    let transaction = Transaction::new();
    let outer = manager.get_unit_of_work(Some(&transaction)).unwrap();
    harness
        .repository
        .add(&outer, Account::open("acc-a", "ada").unwrap())
        .unwrap();

    // Act
    let inner = manager.get_unit_of_work(None).unwrap();
    inner.dispose().await.unwrap();
    let active_after_inner_dispose = inner.is_active();
    let outcome = transaction.commit().await.unwrap();

    // Assert
    assert!(Arc::ptr_eq(&outer, &inner));
    assert!(!inner.can_auto_dispose());
    assert!(active_after_inner_dispose);
    assert_eq!(outcome, Outcome::Committed);
    assert_eq!(harness.event_store.committed_count(), 1);
    assert!(!outer.is_active());
}

#[tokio::test]
async fn test_completed_transaction_cannot_enlist() {
    // Arrange
    let harness = Harness::new();
    let manager = harness.manager(None);
    let transaction = Transaction::new();
    transaction.commit().await.unwrap();

    // Act
    let result = manager.get_unit_of_work(Some(&transaction));

    // Assert
    assert!(matches!(result, Err(DomainError::InvalidProgram(_))));
    assert!(manager.store().is_current_activity_empty_for(DEFAULT_ALIAS));
}
