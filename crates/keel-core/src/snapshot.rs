//! Snapshot creation and restore.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::aggregate::AggregateRoot;
use crate::clock::Clock;
use crate::error::DomainError;
use crate::types::{TypeKind, TypeNameRegistry};

/// Point-in-time materialization of an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Logical name of the aggregate type.
    pub aggregate_root_name: String,
    /// Id of the captured aggregate.
    pub aggregate_root_id: String,
    /// Aggregate version at capture time.
    pub version: u64,
    /// Logical name of the snapshot payload type.
    pub name: String,
    /// Serialized payload.
    pub data: serde_json::Value,
    /// When the snapshot was taken.
    pub created_time: DateTime<Utc>,
}

impl Snapshot {
    /// A snapshot is valid when it names a registered aggregate type, carries
    /// an id, a positive version and a payload.
    #[must_use]
    pub fn is_valid(&self, types: &TypeNameRegistry) -> bool {
        types.is_name_registered(TypeKind::AggregateRoot, &self.aggregate_root_name)
            && !self.aggregate_root_id.is_empty()
            && self.version > 0
            && !self.data.is_null()
    }

    /// Deserializes the typed payload.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the payload does not decode as
    /// `S`.
    pub fn payload<S: DeserializeOwned>(&self) -> Result<S, DomainError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Capability of an aggregate to be captured as a snapshot of type
/// [`Snapshotable::Snapshot`].
///
/// The capability only takes effect once declared with
/// [`TypeNameRegistry::register_snapshot`].
pub trait Snapshotable: AggregateRoot {
    /// Payload captured by the snapshot.
    type Snapshot: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Captures the aggregate's state.
    fn create_snapshot(&self) -> Self::Snapshot;

    /// Restores state captured by [`Snapshotable::create_snapshot`].
    fn restore_from_snapshot(&mut self, snapshot: Self::Snapshot);
}

/// Type-erased snapshot hooks of aggregate `A`, held by the type registry.
pub struct SnapshotCapability<A> {
    name: String,
    create: fn(&A) -> Result<serde_json::Value, DomainError>,
    restore: fn(&mut A, serde_json::Value) -> Result<(), DomainError>,
}

impl<A: Snapshotable> SnapshotCapability<A> {
    pub(crate) fn declare(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            create: |aggregate| Ok(serde_json::to_value(aggregate.create_snapshot())?),
            restore: |aggregate, data| {
                let snapshot: A::Snapshot = serde_json::from_value(data)?;
                aggregate.restore_from_snapshot(snapshot);
                Ok(())
            },
        }
    }
}

impl<A> SnapshotCapability<A> {
    /// Logical name of the snapshot payload type.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Creates snapshots from aggregates and aggregates from snapshots.
#[derive(Clone)]
pub struct Snapshotter {
    types: Arc<TypeNameRegistry>,
    clock: Arc<dyn Clock>,
}

impl Snapshotter {
    /// Creates a new `Snapshotter`.
    #[must_use]
    pub fn new(types: Arc<TypeNameRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self { types, clock }
    }

    /// Captures `aggregate` at its original version.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::MissingSnapshotCapability` if `A` declared no
    /// snapshot capability, `DomainError::MissingAggregateId` if the aggregate
    /// has no id, or a type-name error if `A` is not registered.
    pub fn create_snapshot<A: AggregateRoot>(
        &self,
        aggregate: &A,
    ) -> Result<Snapshot, DomainError> {
        let capability = self.capability::<A>()?;
        let id = aggregate.id().ok_or(DomainError::MissingAggregateId {
            aggregate_type: std::any::type_name::<A>(),
        })?;
        Ok(Snapshot {
            aggregate_root_name: self.types.aggregate_name::<A>()?.to_owned(),
            aggregate_root_id: id.to_owned(),
            version: aggregate.original_version(),
            name: capability.name.clone(),
            data: (capability.create)(aggregate)?,
            created_time: self.clock.now(),
        })
    }

    /// Builds an aggregate from `snapshot`. Events newer than the snapshot
    /// still have to be replayed by the caller.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidSnapshot` if the snapshot fails
    /// validation, `DomainError::SnapshotTypeMismatch` if it was taken from
    /// another aggregate type or with another payload type, and
    /// `DomainError::MissingSnapshotCapability` if `A` declares none.
    pub fn restore_from_snapshot<A: AggregateRoot>(
        &self,
        snapshot: &Snapshot,
    ) -> Result<A, DomainError> {
        if !snapshot.is_valid(&self.types) {
            return Err(DomainError::InvalidSnapshot {
                aggregate_root_name: snapshot.aggregate_root_name.clone(),
                aggregate_root_id: snapshot.aggregate_root_id.clone(),
            });
        }
        let expected = self.types.aggregate_name::<A>()?;
        if expected != snapshot.aggregate_root_name {
            return Err(DomainError::SnapshotTypeMismatch {
                expected: expected.to_owned(),
                actual: snapshot.aggregate_root_name.clone(),
            });
        }
        let capability = self.capability::<A>()?;
        if capability.name != snapshot.name {
            return Err(DomainError::SnapshotTypeMismatch {
                expected: capability.name.clone(),
                actual: snapshot.name.clone(),
            });
        }

        let mut aggregate = A::default();
        aggregate.initialize_from_snapshot(&snapshot.aggregate_root_id, snapshot.version);
        (capability.restore)(&mut aggregate, snapshot.data.clone())?;
        tracing::debug!(
            aggregate = %snapshot.aggregate_root_name,
            aggregate_id = %snapshot.aggregate_root_id,
            version = snapshot.version,
            "aggregate restored from snapshot"
        );
        Ok(aggregate)
    }

    /// Returns `true` if `A` declared a snapshot capability.
    #[must_use]
    pub fn supports<A: AggregateRoot>(&self) -> bool {
        self.types.snapshot_capability::<A>().is_some()
    }

    fn capability<A: AggregateRoot>(&self) -> Result<&SnapshotCapability<A>, DomainError> {
        self.types
            .snapshot_capability::<A>()
            .ok_or(DomainError::MissingSnapshotCapability {
                aggregate_type: std::any::type_name::<A>(),
            })
    }
}
