//! Harness: an in-memory engine wired with the sample domain models.

use std::sync::Arc;

use keel_core::bus::MessageBus;
use keel_core::domain::DomainHandlerRegistry;
use keel_core::error::DomainError;
use keel_core::memory::{InMemoryEventStore, InMemorySnapshotStore};
use keel_core::repository::Repository;
use keel_core::types::TypeNameRegistry;
use keel_core::unit_of_work::{UnitOfWork, UnitOfWorkManager, UnitOfWorkServices, UnitOfWorkStore};

use crate::bus::RecordingBus;
use crate::clock::FixedClock;
use crate::domain::bank::Account;
use crate::domain::cycle::{Ping, Pong};
use crate::domain::{bank, cycle, orders};

/// Builds a registry holding every sample domain model.
///
/// # Errors
///
/// Returns a type-name error if two models claim the same name.
pub fn sample_types() -> Result<TypeNameRegistry, DomainError> {
    let mut types = TypeNameRegistry::new();
    bank::register(&mut types)?;
    orders::register(&mut types)?;
    cycle::register(&mut types)?;
    Ok(types)
}

/// In-memory stores, a recording sync bus and a fixed clock, shared by every
/// unit of work the harness hands out.
pub struct Harness {
    /// Registry of the sample models.
    pub types: Arc<TypeNameRegistry>,
    /// Committed and staged events.
    pub event_store: Arc<InMemoryEventStore>,
    /// Stored snapshots.
    pub snapshot_store: Arc<InMemorySnapshotStore>,
    /// Repository over the in-memory stores.
    pub repository: Arc<Repository>,
    /// Domain handlers of `Account`, `Ping` and `Pong`.
    pub domain_handlers: Arc<DomainHandlerRegistry>,
    /// Receives the events of every successful submit.
    pub sync_bus: Arc<RecordingBus>,
    /// Time stamped on persisted events and snapshots.
    pub clock: FixedClock,
}

impl Harness {
    /// Creates a harness.
    ///
    /// # Panics
    ///
    /// Panics if the sample models cannot be registered.
    #[must_use]
    pub fn new() -> Self {
        Self::try_new().expect("sample models register cleanly")
    }

    /// Creates a harness, reporting registration errors.
    ///
    /// # Errors
    ///
    /// Returns a type-name or program error from registration.
    pub fn try_new() -> Result<Self, DomainError> {
        let types = Arc::new(sample_types()?);
        let clock = FixedClock::default();
        let event_store = Arc::new(InMemoryEventStore::new());
        let snapshot_store = Arc::new(InMemorySnapshotStore::new());
        let repository = Arc::new(Repository::new(
            Arc::clone(&types),
            event_store.clone(),
            snapshot_store.clone(),
            Arc::new(clock),
        ));
        let mut domain_handlers = DomainHandlerRegistry::new(Arc::clone(&types));
        domain_handlers
            .register::<Account>()?
            .register::<Ping>()?
            .register::<Pong>()?;
        Ok(Self {
            types,
            event_store,
            snapshot_store,
            repository,
            domain_handlers: Arc::new(domain_handlers),
            sync_bus: Arc::new(RecordingBus::new()),
            clock,
        })
    }

    /// Collaborators for a new unit of work.
    #[must_use]
    pub fn services(&self) -> UnitOfWorkServices {
        UnitOfWorkServices {
            repository: Arc::clone(&self.repository),
            domain_handlers: Arc::clone(&self.domain_handlers),
            sync_bus: self.sync_bus.clone(),
        }
    }

    /// A fresh, unmanaged unit of work.
    #[must_use]
    pub fn unit_of_work(&self) -> UnitOfWork {
        UnitOfWork::new(self.services())
    }

    /// A manager over a fresh store, flushing to `async_bus` after commit.
    #[must_use]
    pub fn manager(&self, async_bus: Option<Arc<dyn MessageBus>>) -> UnitOfWorkManager {
        UnitOfWorkManager::new(self.services(), Arc::new(UnitOfWorkStore::new()), async_bus)
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
