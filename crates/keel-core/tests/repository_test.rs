//! Integration tests for repository loading, snapshots and rebuilds.

use std::sync::Arc;

use chrono::Utc;
use keel_core::AggregateRoot;
use keel_core::error::DomainError;
use keel_core::event::{AggregateRootEvent, DomainEvent};
use keel_core::snapshot::Snapshot;
use keel_core::store::{Outcome, SnapshotStore};
use keel_test_support::Harness;
use keel_test_support::domain::bank::{Account, AccountOpened, AccountState, Deposited, Held};
use keel_test_support::domain::orders::Order;

async fn commit_account(harness: &Harness, id: &str, deposits: &[i64]) {
    let uow = harness.unit_of_work();
    let mut account = Account::open(id, "ada").unwrap();
    for amount in deposits {
        account.deposit(*amount).unwrap();
    }
    harness.repository.add(&uow, account).unwrap();
    uow.submit_changes().await.unwrap();
    uow.dispose(Outcome::Committed).await.unwrap();
}

fn persisted(id: &str, version: u64, payload: impl DomainEvent) -> AggregateRootEvent {
    AggregateRootEvent::persisted::<Account>(id.to_owned(), version, Arc::new(payload), Utc::now())
}

#[tokio::test]
async fn test_get_by_id_returns_the_tracked_instance() {
    // Arrange
    let harness = Harness::new();
    commit_account(&harness, "acc-a", &[10]).await;
    let uow = harness.unit_of_work();

    // Act
    let first = harness
        .repository
        .get_by_id::<Account>(&uow, "acc-a")
        .await
        .unwrap()
        .unwrap();
    let second = harness
        .repository
        .get_by_id::<Account>(&uow, "acc-a")
        .await
        .unwrap()
        .unwrap();

    // Assert
    assert!(first.ptr_eq(&second));
    assert_eq!(uow.tracked_count(), 1);
}

#[tokio::test]
async fn test_get_by_id_without_history_returns_none() {
    // Arrange
    let harness = Harness::new();
    let uow = harness.unit_of_work();

    // Act
    let found = harness
        .repository
        .get_by_id::<Account>(&uow, "nobody")
        .await
        .unwrap();

    // Assert
    assert!(found.is_none());
    assert_eq!(uow.tracked_count(), 0);
}

#[tokio::test]
async fn test_get_by_id_with_empty_id_is_rejected() {
    // Arrange
    let harness = Harness::new();
    let uow = harness.unit_of_work();

    // Act
    let result = harness.repository.get_by_id::<Account>(&uow, "").await;

    // Assert
    assert!(matches!(result, Err(DomainError::MissingAggregateId { .. })));
}

#[tokio::test]
async fn test_add_without_id_is_rejected() {
    // Arrange
    let harness = Harness::new();
    let uow = harness.unit_of_work();

    // Act
    let result = harness.repository.add(&uow, Account::default());

    // Assert
    assert!(matches!(result, Err(DomainError::MissingAggregateId { .. })));
    assert_eq!(uow.tracked_count(), 0);
}

#[tokio::test]
async fn test_operations_on_disposed_unit_of_work_are_rejected() {
    // Arrange
    let harness = Harness::new();
    let uow = harness.unit_of_work();
    uow.dispose(Outcome::Committed).await.unwrap();

    // Act
    let added = harness
        .repository
        .add(&uow, Account::open("acc-a", "ada").unwrap());
    let loaded = harness.repository.get_by_id::<Account>(&uow, "acc-a").await;
    let rebuilt = harness.repository.get_from_events::<Account>(&uow, &[]);

    // Assert
    assert!(matches!(added, Err(DomainError::NoActiveUnitOfWork)));
    assert!(matches!(loaded, Err(DomainError::NoActiveUnitOfWork)));
    assert!(matches!(rebuilt, Err(DomainError::NoActiveUnitOfWork)));
}

#[tokio::test]
async fn test_snapshot_plus_tail_matches_full_history() {
    // Arrange
    let harness = Harness::new();
    commit_account(&harness, "acc-a", &[100]).await;
    let uow = harness.unit_of_work();
    let account = harness
        .repository
        .get_by_id::<Account>(&uow, "acc-a")
        .await
        .unwrap()
        .unwrap();
    let snapshot = harness.repository.take_snapshot(&account).await.unwrap();
    account.lock().deposit(5).unwrap();
    account.lock().withdraw(20).unwrap();
    uow.submit_changes().await.unwrap();
    uow.dispose(Outcome::Committed).await.unwrap();

    // Act
    let uow = harness.unit_of_work();
    let reloaded = harness
        .repository
        .get_by_id::<Account>(&uow, "acc-a")
        .await
        .unwrap()
        .unwrap();

    // Assert
    assert_eq!(snapshot.version, 2);
    assert_eq!(snapshot.name, "bank.account-state");
    assert_eq!(snapshot.created_time, harness.clock.0);
    assert_eq!(
        snapshot.payload::<AccountState>().unwrap(),
        AccountState {
            owner: "ada".into(),
            balance: 100
        }
    );
    let reloaded = reloaded.lock();
    assert_eq!(reloaded.balance(), 85);
    assert_eq!(reloaded.original_version(), 4);
    assert_eq!(reloaded.act_as::<dyn Held>().unwrap().holder(), "ada");
}

fn account_view(account: &Account) -> (Option<String>, u64, i64, String) {
    (
        account.id().map(ToOwned::to_owned),
        account.original_version(),
        account.balance(),
        account.act_as::<dyn Held>().unwrap().holder().to_owned(),
    )
}

#[tokio::test]
async fn test_snapshot_at_every_version_plus_tail_matches_full_history() {
    // Arrange
    let harness = Harness::new();
    let deposits = [10, 20, 30, 40, 50];
    commit_account(&harness, "acc-a", &deposits).await;
    let mut history = vec![persisted(
        "acc-a",
        1,
        AccountOpened {
            account_id: "acc-a".into(),
            owner: "ada".into(),
        },
    )];
    history.extend(
        deposits
            .iter()
            .zip(2..)
            .map(|(amount, version)| persisted("acc-a", version, Deposited { amount: *amount })),
    );
    let full = harness
        .repository
        .build_for_view::<Account>(&history)
        .unwrap()
        .unwrap();
    let expected = account_view(&full);
    let snapshotter = harness.repository.snapshotter();

    for k in 0..=history.len() {
        // Act
        let prefix = harness
            .repository
            .build_for_view::<Account>(&history[..k])
            .unwrap();
        let mut rebuilt = match prefix {
            Some(prefix) => {
                let snapshot = snapshotter.create_snapshot(&prefix).unwrap();
                harness.snapshot_store.store_snapshot(&snapshot).await.unwrap();
                snapshotter.restore_from_snapshot::<Account>(&snapshot).unwrap()
            }
            None => Account::default(),
        };
        rebuilt.replay_events(&history[k..]).unwrap();
        let uow = harness.unit_of_work();
        let loaded = harness
            .repository
            .get_by_id::<Account>(&uow, "acc-a")
            .await
            .unwrap()
            .unwrap();
        let loaded = account_view(&loaded.lock());
        uow.dispose(Outcome::Committed).await.unwrap();

        // Assert
        assert_eq!(account_view(&rebuilt), expected, "snapshot at version {k}");
        assert_eq!(loaded, expected, "repository load with snapshot at version {k}");
    }
    assert_eq!(expected.1, 6);
    assert_eq!(expected.2, 150);
}

#[tokio::test]
async fn test_invalid_snapshot_falls_back_to_full_replay() {
    // Arrange
    let harness = Harness::new();
    commit_account(&harness, "acc-a", &[40]).await;
    harness
        .snapshot_store
        .store_snapshot(&Snapshot {
            aggregate_root_name: "bank.account".into(),
            aggregate_root_id: "acc-a".into(),
            version: 0,
            name: "bank.account-state".into(),
            data: serde_json::json!({ "owner": "mallory", "balance": 1_000_000 }),
            created_time: harness.clock.0,
        })
        .await
        .unwrap();
    let uow = harness.unit_of_work();

    // Act
    let account = harness
        .repository
        .get_by_id::<Account>(&uow, "acc-a")
        .await
        .unwrap()
        .unwrap();

    // Assert
    let account = account.lock();
    assert_eq!(account.balance(), 40);
    assert_eq!(account.act_as::<dyn Held>().unwrap().holder(), "ada");
}

#[tokio::test]
async fn test_snapshot_of_aggregate_without_capability_is_rejected() {
    // Arrange
    let harness = Harness::new();
    let uow = harness.unit_of_work();
    let order = harness
        .repository
        .add(&uow, Order::create("order-1").unwrap())
        .unwrap();

    // Act
    let result = harness.repository.take_snapshot(&order).await;

    // Assert
    assert!(matches!(
        result,
        Err(DomainError::MissingSnapshotCapability { .. })
    ));
    assert!(harness.snapshot_store.is_empty());
}

#[tokio::test]
async fn test_get_from_events_groups_by_aggregate_in_first_seen_order() {
    // Arrange
    let harness = Harness::new();
    let uow = harness.unit_of_work();
    let events = vec![
        persisted("acc-b", 1, AccountOpened { account_id: "acc-b".into(), owner: "bob".into() }),
        persisted("acc-a", 1, AccountOpened { account_id: "acc-a".into(), owner: "ada".into() }),
        persisted("acc-b", 2, Deposited { amount: 7 }),
        persisted("acc-a", 2, Deposited { amount: 3 }),
    ];

    // Act
    let accounts = harness
        .repository
        .get_from_events::<Account>(&uow, &events)
        .unwrap();

    // Assert
    assert_eq!(accounts.len(), 2);
    assert_eq!(accounts[0].id().as_deref(), Some("acc-b"));
    assert_eq!(accounts[0].lock().balance(), 7);
    assert_eq!(accounts[1].id().as_deref(), Some("acc-a"));
    assert_eq!(accounts[1].lock().original_version(), 2);
    assert_eq!(uow.tracked_count(), 2);
}

#[tokio::test]
async fn test_get_from_events_rejects_a_gap() {
    // Arrange
    let harness = Harness::new();
    let uow = harness.unit_of_work();
    let events = vec![
        persisted("acc-a", 1, AccountOpened { account_id: "acc-a".into(), owner: "ada".into() }),
        persisted("acc-a", 3, Deposited { amount: 3 }),
    ];

    // Act
    let result = harness.repository.get_from_events::<Account>(&uow, &events);

    // Assert
    let err = result.err().unwrap();
    assert!(matches!(err, DomainError::InvalidEventVersion { current: 1, actual: 3, .. }));
    assert!(err.is_fatal());
}

#[test]
fn test_build_for_view_replays_without_tracking() {
    // Arrange
    let harness = Harness::new();
    let events = vec![
        persisted("acc-a", 1, AccountOpened { account_id: "acc-a".into(), owner: "ada".into() }),
        persisted("acc-a", 2, Deposited { amount: 12 }),
    ];

    // Act
    let view = harness.repository.build_for_view::<Account>(&events).unwrap();
    let empty = harness.repository.build_for_view::<Account>(&[]).unwrap();

    // Assert
    let view = view.unwrap();
    assert_eq!(view.balance(), 12);
    assert_eq!(view.original_version(), 2);
    assert!(view.uncommitted_events().is_empty());
    assert!(empty.is_none());
}
