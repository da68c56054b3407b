//! Failing stores: collaborators that always report an infrastructure
//! error, for testing error-handling paths.

use async_trait::async_trait;
use keel_core::error::DomainError;
use keel_core::event::StoredEvent;
use keel_core::snapshot::Snapshot;
use keel_core::store::{EventStore, Outcome, SnapshotStore};
use uuid::Uuid;

fn refused() -> DomainError {
    DomainError::Infrastructure("connection refused".into())
}

/// An event store whose reads, writes and locks all fail. Finishing a
/// session succeeds, since there is nothing to release.
#[derive(Debug)]
pub struct FailingEventStore;

#[async_trait]
impl EventStore for FailingEventStore {
    async fn get_events(
        &self,
        _owner: Uuid,
        _aggregate_root_name: &str,
        _aggregate_root_id: &str,
        _min_version: u64,
        _max_version: u64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Err(refused())
    }

    async fn store_events(&self, _owner: Uuid, _events: &[StoredEvent]) -> Result<(), DomainError> {
        Err(refused())
    }

    async fn lock_aggregate_root(
        &self,
        _owner: Uuid,
        _aggregate_root_name: &str,
        _aggregate_root_id: &str,
    ) -> Result<u64, DomainError> {
        Err(refused())
    }

    async fn finish(&self, _owner: Uuid, _outcome: Outcome) -> Result<(), DomainError> {
        Ok(())
    }
}

/// A snapshot store that always fails.
#[derive(Debug)]
pub struct FailingSnapshotStore;

#[async_trait]
impl SnapshotStore for FailingSnapshotStore {
    async fn store_snapshot(&self, _snapshot: &Snapshot) -> Result<(), DomainError> {
        Err(refused())
    }

    async fn get_last_snapshot(
        &self,
        _aggregate_root_name: &str,
        _aggregate_root_id: &str,
        _max_version: u64,
    ) -> Result<Option<Snapshot>, DomainError> {
        Err(refused())
    }

    async fn get_single_snapshot(
        &self,
        _aggregate_root_name: &str,
        _aggregate_root_id: &str,
        _version: u64,
    ) -> Result<Option<Snapshot>, DomainError> {
        Err(refused())
    }
}
