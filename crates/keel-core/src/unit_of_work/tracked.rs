//! Shared handles to aggregates tracked by a unit of work.

use std::any::{Any, TypeId};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::aggregate::AggregateRoot;
use crate::error::DomainError;
use crate::event::AggregateRootEvent;
use crate::repository::Repository;
use crate::unit_of_work::UnitOfWork;

/// Type-erased operations the unit of work needs on a tracked aggregate.
pub(crate) trait TrackedAggregate: Send + Sync {
    fn aggregate_type(&self) -> TypeId;
    fn aggregate_type_name(&self) -> &'static str;
    fn aggregate_id(&self) -> Option<String>;
    fn original_version(&self) -> u64;
    fn pop_events(&self) -> Vec<AggregateRootEvent>;
    fn mark_persisted(&self, version: u64);
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<A: AggregateRoot> TrackedAggregate for Mutex<A> {
    fn aggregate_type(&self) -> TypeId {
        TypeId::of::<A>()
    }

    fn aggregate_type_name(&self) -> &'static str {
        std::any::type_name::<A>()
    }

    fn aggregate_id(&self) -> Option<String> {
        lock(self).id().map(ToOwned::to_owned)
    }

    fn original_version(&self) -> u64 {
        lock(self).original_version()
    }

    fn pop_events(&self) -> Vec<AggregateRootEvent> {
        lock(self).pop_events()
    }

    fn mark_persisted(&self, version: u64) {
        lock(self).core_mut().set_original_version(version);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn lock<A>(cell: &Mutex<A>) -> MutexGuard<'_, A> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to an aggregate tracked by a [`UnitOfWork`].
///
/// Every handle to the same tracked aggregate shares one instance, so
/// changes made through any of them are seen by the unit of work when it
/// submits. Guards returned by [`Tracked::lock`] must be released before
/// the unit of work submits its changes.
pub struct Tracked<A> {
    cell: Arc<Mutex<A>>,
}

impl<A> Clone for Tracked<A> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<A: AggregateRoot> Tracked<A> {
    pub(crate) fn new(aggregate: A) -> Self {
        Self {
            cell: Arc::new(Mutex::new(aggregate)),
        }
    }

    pub(crate) fn from_erased(erased: Arc<dyn TrackedAggregate>) -> Option<Self> {
        erased
            .into_any()
            .downcast::<Mutex<A>>()
            .ok()
            .map(|cell| Self { cell })
    }

    pub(crate) fn erased(&self) -> Arc<dyn TrackedAggregate> {
        Arc::clone(&self.cell) as Arc<dyn TrackedAggregate>
    }

    /// Locks the aggregate for reading or mutation.
    pub fn lock(&self) -> MutexGuard<'_, A> {
        lock(&self.cell)
    }

    /// Id of the aggregate.
    #[must_use]
    pub fn id(&self) -> Option<String> {
        self.lock().id().map(ToOwned::to_owned)
    }

    /// Returns `true` if both handles refer to the same tracked instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Navigates from this aggregate to the aggregate `T` with `id` through
    /// the repository.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::MissingAggregateId` for an empty id, or any
    /// repository error.
    pub async fn wakeup<T: AggregateRoot>(
        &self,
        repository: &Repository,
        unit_of_work: &UnitOfWork,
        id: &str,
    ) -> Result<Option<Tracked<T>>, DomainError> {
        Self::ensure_target_id::<T>(id)?;
        repository.get_by_id::<T>(unit_of_work, id).await
    }

    /// Like [`Tracked::wakeup`], locking the target's stream first.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::MissingAggregateId` for an empty id, or any
    /// repository error.
    pub async fn wakeup_with_lock<T: AggregateRoot>(
        &self,
        repository: &Repository,
        unit_of_work: &UnitOfWork,
        id: &str,
    ) -> Result<Option<Tracked<T>>, DomainError> {
        Self::ensure_target_id::<T>(id)?;
        repository.get_by_id_with_lock::<T>(unit_of_work, id).await
    }

    fn ensure_target_id<T>(id: &str) -> Result<(), DomainError> {
        if id.is_empty() {
            return Err(DomainError::MissingAggregateId {
                aggregate_type: std::any::type_name::<T>(),
            });
        }
        tracing::debug!(
            source = std::any::type_name::<A>(),
            target = std::any::type_name::<T>(),
            target_id = id,
            "waking up aggregate"
        );
        Ok(())
    }
}

impl<A: AggregateRoot + std::fmt::Debug> std::fmt::Debug for Tracked<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Tracked").field(&*self.lock()).finish()
    }
}
