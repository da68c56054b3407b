//! Keel Core: event-sourced aggregate consistency engine.
//!
//! Aggregates change state only by raising events. A [`UnitOfWork`] tracks
//! the aggregates touched by one logical transaction, versions and persists
//! their events under stream locks, lets other aggregates react through
//! domain handlers until the cascade settles, and hands the result to the
//! message buses. Storage and transport are collaborators behind traits;
//! [`memory`] holds in-process implementations of all of them.

pub mod aggregate;
pub mod bus;
pub mod clock;
pub mod domain;
pub mod error;
pub mod event;
pub mod memory;
pub mod repository;
pub mod snapshot;
pub mod store;
pub mod transaction;
pub mod types;
pub mod unit_of_work;

pub use aggregate::{AggregateCore, AggregateRoot, Roles, Transitions};
pub use bus::{AsyncBus, AsyncBusConfig, MessageBus, Subscriber, SubscriberHandlers, SyncBus};
pub use clock::{Clock, SystemClock};
pub use domain::{DomainHandlerRegistry, DomainHandlers, NavigationPath};
pub use error::{DomainError, Severity};
pub use event::{AggregateRootEvent, DomainEvent, Message, StoredEvent};
pub use repository::Repository;
pub use snapshot::{Snapshot, Snapshotable, Snapshotter};
pub use store::{EventStore, Outcome, SnapshotStore};
pub use transaction::{Synchronization, Transaction};
pub use types::{TypeKind, TypeNameRegistry};
pub use unit_of_work::{
    MAX_CASCADE_ITERATIONS, ScopedUnitOfWork, Tracked, UnitOfWork, UnitOfWorkManager,
    UnitOfWorkServices, UnitOfWorkStore,
};
