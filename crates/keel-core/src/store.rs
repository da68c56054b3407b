//! Persistence collaborators: event streams and snapshots.
//!
//! Every event-store call carries the id of the unit of work issuing it.
//! That id owns the stream locks taken by [`EventStore::lock_aggregate_root`]
//! and scopes the writes staged by [`EventStore::store_events`] until
//! [`EventStore::finish`] commits or discards them.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DomainError;
use crate::event::StoredEvent;
use crate::snapshot::Snapshot;

/// How the logical transaction owning a unit of work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Staged writes become durable.
    Committed,
    /// Staged writes are discarded.
    RolledBack,
}

/// Durable storage of per-aggregate event streams.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Loads the events of one aggregate with `min_version <= version <=
    /// max_version`, ordered by version.
    async fn get_events(
        &self,
        owner: Uuid,
        aggregate_root_name: &str,
        aggregate_root_id: &str,
        min_version: u64,
        max_version: u64,
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Appends events that all belong to one aggregate stream.
    async fn store_events(&self, owner: Uuid, events: &[StoredEvent]) -> Result<(), DomainError>;

    /// Takes the exclusive lock on a stream for `owner` and returns the
    /// stream's current maximum version, `0` for an empty stream. Blocks
    /// while another owner holds the lock; re-entrant for the same owner.
    async fn lock_aggregate_root(
        &self,
        owner: Uuid,
        aggregate_root_name: &str,
        aggregate_root_id: &str,
    ) -> Result<u64, DomainError>;

    /// Commits or discards `owner`'s staged writes and releases its locks.
    async fn finish(&self, owner: Uuid, outcome: Outcome) -> Result<(), DomainError>;
}

/// Durable storage of aggregate snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Stores a snapshot, replacing one taken at the same version.
    async fn store_snapshot(&self, snapshot: &Snapshot) -> Result<(), DomainError>;

    /// Returns the newest snapshot with `version <= max_version`.
    async fn get_last_snapshot(
        &self,
        aggregate_root_name: &str,
        aggregate_root_id: &str,
        max_version: u64,
    ) -> Result<Option<Snapshot>, DomainError>;

    /// Returns the snapshot taken at exactly `version`.
    async fn get_single_snapshot(
        &self,
        aggregate_root_name: &str,
        aggregate_root_id: &str,
        version: u64,
    ) -> Result<Option<Snapshot>, DomainError>;
}

/// Rejects a batch spanning more than one aggregate stream.
///
/// # Errors
///
/// Returns `DomainError::InvalidProgram` naming the first foreign event.
pub fn ensure_single_stream(events: &[StoredEvent]) -> Result<(), DomainError> {
    let Some(first) = events.first() else {
        return Ok(());
    };
    match events.iter().find(|event| event.stream() != first.stream()) {
        Some(foreign) => Err(DomainError::InvalidProgram(format!(
            "event batch mixes streams {}/{} and {}/{}",
            first.aggregate_root_name,
            first.aggregate_root_id,
            foreign.aggregate_root_name,
            foreign.aggregate_root_id
        ))),
        None => Ok(()),
    }
}
