//! Unit of work: tracks aggregates for one logical transaction and commits
//! their events through a cascade of domain handlers.

pub mod manager;
pub mod store;
pub mod tracked;

use std::any::TypeId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::aggregate::AggregateRoot;
use crate::bus::MessageBus;
use crate::domain::DomainHandlerRegistry;
use crate::error::DomainError;
use crate::event::{AggregateRootEvent, Message};
use crate::repository::Repository;
use crate::store::Outcome;

pub use manager::{DEFAULT_ALIAS, ScopedUnitOfWork, UnitOfWorkManager};
pub use store::UnitOfWorkStore;
pub use tracked::Tracked;

use tracked::TrackedAggregate;

/// Upper bound on cascade iterations before a causal cycle is assumed.
pub const MAX_CASCADE_ITERATIONS: usize = 100;

/// Collaborators shared by every unit of work of one engine.
#[derive(Clone)]
pub struct UnitOfWorkServices {
    /// Repository the unit of work loads and persists through.
    pub repository: Arc<Repository>,
    /// Domain handlers run during the cascade.
    pub domain_handlers: Arc<DomainHandlerRegistry>,
    /// Bus receiving the committed events inside the transaction.
    pub sync_bus: Arc<dyn MessageBus>,
}

struct Batch {
    aggregate: Arc<dyn TrackedAggregate>,
    events: Vec<AggregateRootEvent>,
}

/// Tracked aggregates of one logical transaction.
///
/// A unit of work is owned by one task at a time; handles to it are shared,
/// never used concurrently.
pub struct UnitOfWork {
    id: Uuid,
    services: UnitOfWorkServices,
    tracked: Mutex<Vec<Arc<dyn TrackedAggregate>>>,
    disposed: AtomicBool,
    failed: AtomicBool,
}

impl UnitOfWork {
    /// Creates an empty, active unit of work.
    #[must_use]
    pub fn new(services: UnitOfWorkServices) -> Self {
        Self {
            id: Uuid::now_v7(),
            services,
            tracked: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    /// Identifier of this unit of work. Event-store locks and staged writes
    /// are owned by it.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Repository bound to this unit of work's engine.
    #[must_use]
    pub fn repository(&self) -> &Arc<Repository> {
        &self.services.repository
    }

    /// Returns `true` until the unit of work is disposed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.disposed.load(Ordering::SeqCst)
    }

    /// Number of tracked aggregates.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.tracked().len()
    }

    fn tracked(&self) -> MutexGuard<'_, Vec<Arc<dyn TrackedAggregate>>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn ensure_active(&self) -> Result<(), DomainError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(DomainError::NoActiveUnitOfWork)
        }
    }

    pub(crate) fn find<A: AggregateRoot>(&self, id: &str) -> Option<Tracked<A>> {
        let found = self
            .tracked()
            .iter()
            .find(|entry| {
                entry.aggregate_type() == TypeId::of::<A>()
                    && entry.aggregate_id().as_deref() == Some(id)
            })
            .cloned();
        found.and_then(Tracked::from_erased)
    }

    /// Starts tracking `aggregate`, replacing a tracked aggregate with the
    /// same type and id.
    pub(crate) fn track<A: AggregateRoot>(&self, aggregate: A) -> Result<Tracked<A>, DomainError> {
        let Some(id) = aggregate.id().map(ToOwned::to_owned) else {
            return Err(DomainError::MissingAggregateId {
                aggregate_type: std::any::type_name::<A>(),
            });
        };
        let tracked = Tracked::new(aggregate);
        let mut entries = self.tracked();
        entries.retain(|entry| {
            entry.aggregate_type() != TypeId::of::<A>()
                || entry.aggregate_id().as_deref() != Some(id.as_str())
        });
        entries.push(tracked.erased());
        tracing::trace!(
            unit_of_work = %self.id,
            aggregate = std::any::type_name::<A>(),
            aggregate_id = %id,
            "aggregate tracked"
        );
        Ok(tracked)
    }

    /// Persists every pending event, runs the domain-handler cascade until
    /// no aggregate has pending events, then publishes all processed events
    /// to the sync bus. Returns the processed payloads in causal order.
    ///
    /// Guards from [`Tracked::lock`] must not be held across this call.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::CascadeCycle` after
    /// [`MAX_CASCADE_ITERATIONS`] iterations, or the first persistence,
    /// handler or bus error. Any error marks the unit of work as failed, so
    /// its disposal rolls back.
    #[tracing::instrument(skip(self), fields(unit_of_work = %self.id))]
    pub async fn submit_changes(&self) -> Result<Vec<Arc<dyn Message>>, DomainError> {
        self.ensure_active()?;
        let submitted = self.cascade().await;
        if let Err(error) = &submitted {
            self.failed.store(true, Ordering::SeqCst);
            tracing::warn!(%error, "submit failed");
        }
        submitted
    }

    async fn cascade(&self) -> Result<Vec<Arc<dyn Message>>, DomainError> {
        let mut batches = self.drain();
        if batches.is_empty() {
            return Ok(Vec::new());
        }

        let repository = &self.services.repository;
        let mut processed: Vec<Arc<dyn Message>> = Vec::new();
        let mut iterations = 0;
        while !batches.is_empty() {
            iterations += 1;
            if iterations > MAX_CASCADE_ITERATIONS {
                return Err(DomainError::CascadeCycle {
                    max_iterations: MAX_CASCADE_ITERATIONS,
                });
            }
            for batch in &mut batches {
                repository
                    .persist(self.id, batch.aggregate.as_ref(), &mut batch.events)
                    .await?;
            }
            for event in batches.into_iter().flat_map(|batch| batch.events) {
                self.services
                    .domain_handlers
                    .dispatch(repository, self, &event.payload)
                    .await?;
                processed.push(event.payload);
            }
            batches = self.drain();
        }
        tracing::debug!(iterations, events = processed.len(), "cascade complete");

        self.services.sync_bus.publish_all(&processed).await?;
        Ok(processed)
    }

    fn drain(&self) -> Vec<Batch> {
        let entries: Vec<Arc<dyn TrackedAggregate>> = self.tracked().clone();
        entries
            .into_iter()
            .filter_map(|aggregate| {
                let events = aggregate.pop_events();
                (!events.is_empty()).then_some(Batch { aggregate, events })
            })
            .collect()
    }

    /// Releases the unit of work: forgets tracked aggregates and ends its
    /// event-store session with `outcome`. A failed unit of work always
    /// rolls back. Later calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns the event-store error from ending the session.
    pub async fn dispose(&self, outcome: Outcome) -> Result<(), DomainError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let outcome = if self.failed.load(Ordering::SeqCst) {
            Outcome::RolledBack
        } else {
            outcome
        };
        self.tracked().clear();
        tracing::debug!(unit_of_work = %self.id, ?outcome, "unit of work disposed");
        self.services.repository.finish(self.id, outcome).await
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        // Undisposed: roll back so staged writes and stream locks are released.
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let id = self.id;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(unit_of_work = %id, "dropped outside a runtime; session not finished");
            return;
        };
        tracing::warn!(unit_of_work = %id, "unit of work dropped without dispose; rolling back");
        let repository = Arc::clone(&self.services.repository);
        runtime.spawn(async move {
            if let Err(error) = repository.finish(id, Outcome::RolledBack).await {
                tracing::error!(
                    unit_of_work = %id,
                    %error,
                    "rollback of dropped unit of work failed"
                );
            }
        });
    }
}
