//! Integration tests for the unit-of-work cascade over the in-memory stores.

use std::sync::Arc;

use keel_core::error::DomainError;
use keel_core::event::downcast_message;
use keel_core::repository::Repository;
use keel_core::store::Outcome;
use keel_core::unit_of_work::{MAX_CASCADE_ITERATIONS, UnitOfWork, UnitOfWorkServices};
use keel_core::{AggregateRoot, DomainHandlerRegistry, Severity};
use keel_test_support::domain::bank::{Account, TransferredIn, TransferredOut};
use keel_test_support::domain::cycle::{Ping, Pong};
use keel_test_support::domain::orders::{Order, Product};
use keel_test_support::{FailingEventStore, FailingSnapshotStore, FixedClock, Harness, RecordingBus};

async fn open_accounts(harness: &Harness, accounts: &[(&str, &str, i64)]) {
    let uow = harness.unit_of_work();
    for (id, owner, opening) in accounts {
        let mut account = Account::open(id, owner).unwrap();
        if *opening > 0 {
            account.deposit(*opening).unwrap();
        }
        harness.repository.add(&uow, account).unwrap();
    }
    uow.submit_changes().await.unwrap();
    uow.dispose(Outcome::Committed).await.unwrap();
}

async fn balance_of(harness: &Harness, id: &str) -> i64 {
    let uow = harness.unit_of_work();
    let account = harness
        .repository
        .get_by_id::<Account>(&uow, id)
        .await
        .unwrap()
        .unwrap();
    let balance = account.lock().balance();
    uow.dispose(Outcome::Committed).await.unwrap();
    balance
}

#[tokio::test]
async fn test_transfer_credits_target_through_domain_handler() {
    // Arrange
    let harness = Harness::new();
    open_accounts(&harness, &[("acc-a", "ada", 100), ("acc-b", "bob", 0)]).await;
    let uow = harness.unit_of_work();
    let source = harness
        .repository
        .get_by_id_with_lock::<Account>(&uow, "acc-a")
        .await
        .unwrap()
        .unwrap();

    // Act
    source.lock().transfer_to("acc-b", 30).unwrap();
    let processed = uow.submit_changes().await.unwrap();
    uow.dispose(Outcome::Committed).await.unwrap();

    // Assert
    assert_eq!(processed.len(), 2);
    assert!(downcast_message::<TransferredOut>(&processed[0]).is_some());
    let credited = downcast_message::<TransferredIn>(&processed[1]).unwrap();
    assert_eq!(credited.from_account, "acc-a");
    assert_eq!(credited.amount, 30);
    assert_eq!(balance_of(&harness, "acc-a").await, 70);
    assert_eq!(balance_of(&harness, "acc-b").await, 30);
}

#[tokio::test]
async fn test_submit_publishes_processed_events_to_sync_bus_in_causal_order() {
    // Arrange
    let harness = Harness::new();
    open_accounts(&harness, &[("acc-a", "ada", 50), ("acc-b", "bob", 0)]).await;

    // Act
    let uow = harness.unit_of_work();
    let source = harness
        .repository
        .get_by_id::<Account>(&uow, "acc-a")
        .await
        .unwrap()
        .unwrap();
    source.lock().transfer_to("acc-b", 20).unwrap();
    uow.submit_changes().await.unwrap();
    uow.dispose(Outcome::Committed).await.unwrap();

    // Assert
    let names: Vec<&str> = harness
        .sync_bus
        .published_type_names()
        .into_iter()
        .map(|name| name.rsplit("::").next().unwrap_or(name))
        .collect();
    assert_eq!(
        names,
        vec![
            "AccountOpened",
            "Deposited",
            "AccountOpened",
            "TransferredOut",
            "TransferredIn"
        ]
    );
}

#[tokio::test]
async fn test_persisted_versions_are_contiguous_and_stamped_by_clock() {
    // Arrange
    let harness = Harness::new();
    open_accounts(&harness, &[("acc-a", "ada", 10)]).await;

    // Act
    let uow = harness.unit_of_work();
    let account = harness
        .repository
        .get_by_id::<Account>(&uow, "acc-a")
        .await
        .unwrap()
        .unwrap();
    {
        let mut account = account.lock();
        account.deposit(5).unwrap();
        account.withdraw(3).unwrap();
    }
    uow.submit_changes().await.unwrap();
    uow.dispose(Outcome::Committed).await.unwrap();

    // Assert
    let stream = harness.event_store.stream("bank.account", "acc-a");
    let versions: Vec<u64> = stream.iter().map(|event| event.version).collect();
    assert_eq!(versions, vec![1, 2, 3, 4]);
    assert!(stream.iter().all(|event| event.occurred_time == harness.clock.0));
    assert_eq!(stream[2].name, "bank.deposited");
    assert_eq!(account.lock().original_version(), 4);
}

#[tokio::test]
async fn test_replaying_stored_history_is_deterministic() {
    // Arrange
    let harness = Harness::new();
    open_accounts(&harness, &[("acc-a", "ada", 40)]).await;

    // Act
    let first = balance_of(&harness, "acc-a").await;
    let second = balance_of(&harness, "acc-a").await;

    // Assert
    assert_eq!(first, 40);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_order_lines_survive_reload() {
    // Arrange
    let harness = Harness::new();
    let uow = harness.unit_of_work();
    let widget = Product::create("prod-1", "widget", 250).unwrap();
    let gadget = Product::create("prod-2", "gadget", 1000).unwrap();
    let mut order = Order::create("order-1").unwrap();
    order.add_item(&widget, 2).unwrap();
    order.add_item(&gadget, 1).unwrap();
    order.update_item("prod-1", 3).unwrap();
    order.remove_item("prod-2").unwrap();
    harness.repository.add(&uow, widget).unwrap();
    harness.repository.add(&uow, gadget).unwrap();
    harness.repository.add(&uow, order).unwrap();

    // Act
    uow.submit_changes().await.unwrap();
    uow.dispose(Outcome::Committed).await.unwrap();

    // Assert
    let uow = harness.unit_of_work();
    let order = harness
        .repository
        .get_by_id::<Order>(&uow, "order-1")
        .await
        .unwrap()
        .unwrap();
    let order = order.lock();
    assert_eq!(order.items().len(), 1);
    assert_eq!(order.item("prod-1").map(|item| item.quantity), Some(3));
    assert_eq!(order.total_price(), 750);
    assert_eq!(order.original_version(), 5);
}

#[tokio::test]
async fn test_product_state_is_copied_from_its_creation_event() {
    // Arrange
    let harness = Harness::new();
    let uow = harness.unit_of_work();
    harness
        .repository
        .add(&uow, Product::create("prod-1", "widget", 250).unwrap())
        .unwrap();
    uow.submit_changes().await.unwrap();
    uow.dispose(Outcome::Committed).await.unwrap();

    // Act
    let uow = harness.unit_of_work();
    let product = harness
        .repository
        .get_by_id::<Product>(&uow, "prod-1")
        .await
        .unwrap()
        .unwrap();

    // Assert
    let product = product.lock();
    assert_eq!(product.name(), "widget");
    assert_eq!(product.price(), 250);
    assert_eq!(product.id(), Some("prod-1"));
}

#[tokio::test]
async fn test_causal_cycle_stops_after_iteration_cap() {
    // Arrange
    let harness = Harness::new();
    let setup = harness.unit_of_work();
    harness
        .repository
        .add(&setup, Ping::open("ping", "pong").unwrap())
        .unwrap();
    harness
        .repository
        .add(&setup, Pong::open("pong", "ping").unwrap())
        .unwrap();
    setup.submit_changes().await.unwrap();
    setup.dispose(Outcome::Committed).await.unwrap();
    let published_before = harness.sync_bus.published().len();

    let uow = harness.unit_of_work();
    let ping = harness
        .repository
        .get_by_id::<Ping>(&uow, "ping")
        .await
        .unwrap()
        .unwrap();
    ping.lock().serve().unwrap();

    // Act
    let result = uow.submit_changes().await;

    // Assert
    let err = result.unwrap_err();
    assert!(matches!(
        err,
        DomainError::CascadeCycle { max_iterations } if max_iterations == MAX_CASCADE_ITERATIONS
    ));
    assert_eq!(err.severity(), Severity::Fatal);
    let pong = harness
        .repository
        .get_by_id::<Pong>(&uow, "pong")
        .await
        .unwrap()
        .unwrap();
    let hits = ping.lock().volleys() + pong.lock().volleys();
    assert_eq!(hits as usize, MAX_CASCADE_ITERATIONS + 1);
    assert_eq!(harness.sync_bus.published().len(), published_before);

    uow.dispose(Outcome::Committed).await.unwrap();
    assert_eq!(harness.event_store.stream("rally.ping", "ping").len(), 1);
    assert_eq!(harness.event_store.stream("rally.pong", "pong").len(), 1);
}

#[tokio::test]
async fn test_transfer_to_unknown_account_skips_the_credit() {
    // Arrange
    let harness = Harness::new();
    open_accounts(&harness, &[("acc-a", "ada", 10)]).await;
    let uow = harness.unit_of_work();
    let account = harness
        .repository
        .get_by_id::<Account>(&uow, "acc-a")
        .await
        .unwrap()
        .unwrap();
    account.lock().transfer_to("acc-missing", 4).unwrap();

    // Act
    let processed = uow.submit_changes().await.unwrap();
    uow.dispose(Outcome::Committed).await.unwrap();

    // Assert
    assert_eq!(processed.len(), 1);
    assert!(harness.event_store.stream("bank.account", "acc-missing").is_empty());
    assert_eq!(balance_of(&harness, "acc-a").await, 6);
}

#[tokio::test]
async fn test_rolled_back_unit_of_work_discards_staged_events() {
    // Arrange
    let harness = Harness::new();
    let uow = harness.unit_of_work();
    harness
        .repository
        .add(&uow, Account::open("acc-a", "ada").unwrap())
        .unwrap();
    uow.submit_changes().await.unwrap();

    // Act
    uow.dispose(Outcome::RolledBack).await.unwrap();

    // Assert
    assert_eq!(harness.event_store.committed_count(), 0);
    assert!(!uow.is_active());
    assert_eq!(uow.tracked_count(), 0);
}

#[tokio::test]
async fn test_dispose_is_idempotent() {
    // Arrange
    let harness = Harness::new();
    let uow = harness.unit_of_work();
    harness
        .repository
        .add(&uow, Account::open("acc-a", "ada").unwrap())
        .unwrap();
    uow.submit_changes().await.unwrap();
    uow.dispose(Outcome::Committed).await.unwrap();

    // Act
    uow.dispose(Outcome::RolledBack).await.unwrap();

    // Assert
    assert_eq!(harness.event_store.committed_count(), 1);
}

#[tokio::test]
async fn test_submit_on_disposed_unit_of_work_is_rejected() {
    // Arrange
    let harness = Harness::new();
    let uow = harness.unit_of_work();
    uow.dispose(Outcome::Committed).await.unwrap();

    // Act
    let result = uow.submit_changes().await;

    // Assert
    assert!(matches!(result, Err(DomainError::NoActiveUnitOfWork)));
}

#[tokio::test]
async fn test_submit_without_changes_publishes_nothing() {
    // Arrange
    let harness = Harness::new();
    let uow = harness.unit_of_work();

    // Act
    let processed = uow.submit_changes().await.unwrap();

    // Assert
    assert!(processed.is_empty());
    assert!(harness.sync_bus.published().is_empty());
}

#[tokio::test]
async fn test_store_failure_propagates_for_rollback() {
    // Arrange
    let harness = Harness::new();
    let repository = Arc::new(Repository::new(
        Arc::clone(&harness.types),
        Arc::new(FailingEventStore),
        Arc::new(FailingSnapshotStore),
        Arc::new(FixedClock::default()),
    ));
    let sync_bus = Arc::new(RecordingBus::new());
    let uow = UnitOfWork::new(UnitOfWorkServices {
        repository: Arc::clone(&repository),
        domain_handlers: Arc::new(DomainHandlerRegistry::new(Arc::clone(&harness.types))),
        sync_bus: sync_bus.clone(),
    });
    repository
        .add(&uow, Account::open("acc-a", "ada").unwrap())
        .unwrap();

    // Act
    let result = uow.submit_changes().await;

    // Assert
    let err = result.unwrap_err();
    assert!(matches!(err, DomainError::Infrastructure(_)));
    assert_eq!(err.severity(), Severity::Propagate);
    assert!(sync_bus.published().is_empty());
}
