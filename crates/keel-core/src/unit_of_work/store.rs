//! Per-session stack of units of work, keyed by alias.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::DomainError;
use crate::unit_of_work::manager::ScopedUnitOfWork;

/// Holds the live units of work of one session (a request, a job, a test).
/// Only the top of each alias's stack is visible.
#[derive(Default)]
pub struct UnitOfWorkStore {
    stacks: Mutex<HashMap<String, Vec<Arc<ScopedUnitOfWork>>>>,
}

impl UnitOfWorkStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn stacks(&self) -> MutexGuard<'_, HashMap<String, Vec<Arc<ScopedUnitOfWork>>>> {
        self.stacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current unit of work for `alias`, if any.
    #[must_use]
    pub fn find_compatible(&self, alias: &str) -> Option<Arc<ScopedUnitOfWork>> {
        self.stacks()
            .get(alias)
            .and_then(|stack| stack.last())
            .cloned()
    }

    /// Pushes `unit_of_work` as the current one for its alias.
    pub fn store(&self, unit_of_work: Arc<ScopedUnitOfWork>) {
        let alias = unit_of_work.alias().to_owned();
        self.stacks().entry(alias).or_default().push(unit_of_work);
    }

    /// Pops `unit_of_work` from its alias's stack.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidProgram` if it is not the current unit
    /// of work for its alias.
    pub fn remove(&self, unit_of_work: &ScopedUnitOfWork) -> Result<(), DomainError> {
        let mut stacks = self.stacks();
        let stack = stacks.entry(unit_of_work.alias().to_owned()).or_default();
        match stack.last() {
            Some(top) if std::ptr::eq(top.as_ref(), unit_of_work) => {
                stack.pop();
                Ok(())
            }
            _ => Err(DomainError::InvalidProgram(format!(
                "unit of work {} is not the current one for alias '{}'",
                unit_of_work.id(),
                unit_of_work.alias()
            ))),
        }
    }

    /// Returns `true` if no unit of work is live for `alias`.
    #[must_use]
    pub fn is_current_activity_empty_for(&self, alias: &str) -> bool {
        self.stacks().get(alias).is_none_or(Vec::is_empty)
    }
}
