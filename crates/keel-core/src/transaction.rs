//! In-process transaction boundary with completion hooks.
//!
//! A [`Transaction`] does not own any resource itself. Participants enlist
//! a [`Synchronization`] and are told before and after the transaction
//! completes; the unit-of-work manager uses this to submit changes before
//! commit and to release the unit of work afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DomainError;
use crate::store::Outcome;

/// Participant notified around transaction completion.
#[async_trait]
pub trait Synchronization: Send + Sync {
    /// Runs before the outcome is decided. An error marks the transaction
    /// rollback-only.
    async fn before_completion(&self, rollback_only: bool) -> Result<(), DomainError>;

    /// Runs once the outcome is decided.
    async fn after_completion(&self, outcome: Outcome) -> Result<(), DomainError>;
}

/// A logical transaction.
#[derive(Default)]
pub struct Transaction {
    id: Uuid,
    rollback_only: AtomicBool,
    completed: AtomicBool,
    synchronizations: Mutex<Vec<Arc<dyn Synchronization>>>,
}

impl Transaction {
    /// Starts a new transaction.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::now_v7(),
            ..Self::default()
        }
    }

    /// Transaction identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Marks the transaction so that it can only roll back.
    pub fn set_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }

    /// Returns `true` if the transaction can only roll back.
    #[must_use]
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }

    /// Returns `true` once commit or rollback started.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Enlists a participant.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidProgram` if the transaction completed.
    pub fn register_synchronization(
        &self,
        synchronization: Arc<dyn Synchronization>,
    ) -> Result<(), DomainError> {
        if self.is_completed() {
            return Err(self.already_completed());
        }
        self.synchronizations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(synchronization);
        Ok(())
    }

    /// Runs the before-completion hooks, decides the outcome and runs the
    /// after-completion hooks. A failing before-completion hook turns the
    /// commit into a rollback and its error is returned.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidProgram` if the transaction already
    /// completed, otherwise the first hook error.
    #[tracing::instrument(skip(self), fields(transaction = %self.id))]
    pub async fn commit(&self) -> Result<Outcome, DomainError> {
        let participants = self.begin_completion()?;
        let mut failure = None;
        for participant in &participants {
            if let Err(error) = participant.before_completion(self.is_rollback_only()).await {
                tracing::warn!(%error, "before-completion hook failed; rolling back");
                self.set_rollback_only();
                failure = Some(error);
                break;
            }
        }
        let outcome = if self.is_rollback_only() {
            Outcome::RolledBack
        } else {
            Outcome::Committed
        };
        let completed = Self::after_completion(&participants, outcome).await;
        tracing::debug!(?outcome, "transaction completed");
        match failure {
            Some(error) => Err(error),
            None => completed.map(|()| outcome),
        }
    }

    /// Rolls the transaction back and runs the after-completion hooks.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidProgram` if the transaction already
    /// completed, otherwise the first hook error.
    #[tracing::instrument(skip(self), fields(transaction = %self.id))]
    pub async fn rollback(&self) -> Result<(), DomainError> {
        let participants = self.begin_completion()?;
        self.set_rollback_only();
        Self::after_completion(&participants, Outcome::RolledBack).await
    }

    fn begin_completion(&self) -> Result<Vec<Arc<dyn Synchronization>>, DomainError> {
        if self.completed.swap(true, Ordering::SeqCst) {
            return Err(self.already_completed());
        }
        Ok(self
            .synchronizations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect())
    }

    async fn after_completion(
        participants: &[Arc<dyn Synchronization>],
        outcome: Outcome,
    ) -> Result<(), DomainError> {
        let mut first_error = None;
        for participant in participants {
            if let Err(error) = participant.after_completion(outcome).await {
                tracing::error!(%error, "after-completion hook failed");
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn already_completed(&self) -> DomainError {
        DomainError::InvalidProgram(format!("transaction {} already completed", self.id))
    }
}
