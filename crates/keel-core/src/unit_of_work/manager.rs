//! Hands out units of work and ties their lifetime to an enclosing
//! [`Transaction`] when there is one.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;

use crate::bus::MessageBus;
use crate::error::DomainError;
use crate::event::Message;
use crate::store::Outcome;
use crate::transaction::{Synchronization, Transaction};
use crate::unit_of_work::store::UnitOfWorkStore;
use crate::unit_of_work::{UnitOfWork, UnitOfWorkServices};

/// Alias under which the manager stores its units of work.
pub const DEFAULT_ALIAS: &str = "default";

/// A unit of work registered in a [`UnitOfWorkStore`].
///
/// Without an enclosing transaction [`ScopedUnitOfWork::dispose`] releases
/// it at once. Inside one, `dispose` does nothing and the transaction's
/// completion releases it instead.
pub struct ScopedUnitOfWork {
    unit_of_work: UnitOfWork,
    alias: String,
    store: Weak<UnitOfWorkStore>,
    can_auto_dispose: AtomicBool,
    released: AtomicBool,
}

impl ScopedUnitOfWork {
    fn new(unit_of_work: UnitOfWork, alias: &str, store: &Arc<UnitOfWorkStore>) -> Self {
        Self {
            unit_of_work,
            alias: alias.to_owned(),
            store: Arc::downgrade(store),
            can_auto_dispose: AtomicBool::new(true),
            released: AtomicBool::new(false),
        }
    }

    /// Alias this unit of work is stored under.
    #[must_use]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Returns `true` if [`ScopedUnitOfWork::dispose`] releases immediately.
    #[must_use]
    pub fn can_auto_dispose(&self) -> bool {
        self.can_auto_dispose.load(Ordering::SeqCst)
    }

    fn update_can_auto_dispose(&self, can_auto_dispose: bool) {
        self.can_auto_dispose.store(can_auto_dispose, Ordering::SeqCst);
    }

    /// Releases the unit of work unless an enclosing transaction owns its
    /// lifetime.
    ///
    /// # Errors
    ///
    /// Returns the store or event-store error from releasing it.
    pub async fn dispose(&self) -> Result<(), DomainError> {
        if !self.can_auto_dispose() {
            tracing::trace!(unit_of_work = %self.id(), "dispose deferred to transaction");
            return Ok(());
        }
        self.release(Outcome::Committed).await
    }

    async fn release(&self, outcome: Outcome) -> Result<(), DomainError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let removed = match self.store.upgrade() {
            Some(store) => store.remove(self),
            None => Ok(()),
        };
        self.unit_of_work.dispose(outcome).await?;
        removed
    }
}

impl Deref for ScopedUnitOfWork {
    type Target = UnitOfWork;

    fn deref(&self) -> &UnitOfWork {
        &self.unit_of_work
    }
}

struct UnitOfWorkSynchronization {
    scoped: Arc<ScopedUnitOfWork>,
    async_bus: Option<Arc<dyn MessageBus>>,
    submitted: Mutex<Vec<Arc<dyn Message>>>,
}

#[async_trait]
impl Synchronization for UnitOfWorkSynchronization {
    async fn before_completion(&self, rollback_only: bool) -> Result<(), DomainError> {
        if rollback_only {
            tracing::debug!(unit_of_work = %self.scoped.id(), "rollback-only; submit skipped");
            return Ok(());
        }
        let events = self.scoped.submit_changes().await?;
        *self.submitted.lock().unwrap_or_else(PoisonError::into_inner) = events;
        Ok(())
    }

    async fn after_completion(&self, outcome: Outcome) -> Result<(), DomainError> {
        self.scoped.release(outcome).await?;
        let events = std::mem::take(
            &mut *self
                .submitted
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if outcome != Outcome::Committed || events.is_empty() {
            return Ok(());
        }
        if let Some(bus) = &self.async_bus {
            tracing::debug!(events = events.len(), "flushing events to async bus");
            bus.publish_all(&events).await?;
        }
        Ok(())
    }
}

/// Creates units of work and stores them in a session's
/// [`UnitOfWorkStore`].
pub struct UnitOfWorkManager {
    services: UnitOfWorkServices,
    store: Arc<UnitOfWorkStore>,
    async_bus: Option<Arc<dyn MessageBus>>,
}

impl UnitOfWorkManager {
    /// Creates a manager. Events are flushed to `async_bus`, when given,
    /// after an enclosing transaction commits.
    #[must_use]
    pub fn new(
        services: UnitOfWorkServices,
        store: Arc<UnitOfWorkStore>,
        async_bus: Option<Arc<dyn MessageBus>>,
    ) -> Self {
        Self {
            services,
            store,
            async_bus,
        }
    }

    /// The store units of work are kept in.
    #[must_use]
    pub fn store(&self) -> &Arc<UnitOfWorkStore> {
        &self.store
    }

    /// Returns the current unit of work, creating one if none is live.
    ///
    /// With a `transaction`, the unit of work is enlisted in it: changes are
    /// submitted before commit and the unit of work is released after
    /// completion. Without one, the caller releases it with
    /// [`ScopedUnitOfWork::dispose`].
    ///
    /// A live unit of work is reused as is. Reusing an enlisted one without
    /// a transaction does not make it auto-dispose again: its transaction
    /// still submits and releases it.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidProgram` if `transaction` already
    /// completed.
    pub fn get_unit_of_work(
        &self,
        transaction: Option<&Transaction>,
    ) -> Result<Arc<ScopedUnitOfWork>, DomainError> {
        if let Some(current) = self.store.find_compatible(DEFAULT_ALIAS) {
            if current.is_active() {
                match transaction {
                    Some(transaction) if current.can_auto_dispose() => {
                        self.enlist(&current, transaction)?;
                    }
                    // Already enlisted: its transaction keeps owning the release.
                    _ => {}
                }
                return Ok(current);
            }
        }

        let scoped = Arc::new(ScopedUnitOfWork::new(
            UnitOfWork::new(self.services.clone()),
            DEFAULT_ALIAS,
            &self.store,
        ));
        if let Some(transaction) = transaction {
            self.enlist(&scoped, transaction)?;
        }
        self.store.store(Arc::clone(&scoped));
        tracing::debug!(
            unit_of_work = %scoped.id(),
            auto_dispose = scoped.can_auto_dispose(),
            "unit of work created"
        );
        Ok(scoped)
    }

    fn enlist(
        &self,
        scoped: &Arc<ScopedUnitOfWork>,
        transaction: &Transaction,
    ) -> Result<(), DomainError> {
        transaction.register_synchronization(Arc::new(UnitOfWorkSynchronization {
            scoped: Arc::clone(scoped),
            async_bus: self.async_bus.clone(),
            submitted: Mutex::new(Vec::new()),
        }))?;
        scoped.update_can_auto_dispose(false);
        tracing::debug!(
            unit_of_work = %scoped.id(),
            transaction = %transaction.id(),
            "unit of work enlisted"
        );
        Ok(())
    }
}
