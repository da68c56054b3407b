//! Loading, reconstructing and tracking aggregates.
//!
//! Every operation runs against a [`UnitOfWork`]: aggregates already tracked
//! by it are returned as they are, so a transaction always reads its own
//! writes. Anything loaded from storage becomes tracked.

use std::sync::Arc;

use uuid::Uuid;

use crate::aggregate::AggregateRoot;
use crate::clock::Clock;
use crate::error::DomainError;
use crate::event::{AggregateRootEvent, StoredEvent};
use crate::snapshot::{Snapshot, Snapshotter};
use crate::store::{EventStore, Outcome, SnapshotStore};
use crate::types::{TypeKind, TypeNameRegistry};
use crate::unit_of_work::UnitOfWork;
use crate::unit_of_work::tracked::{Tracked, TrackedAggregate};

/// Repository over an event store and a snapshot store.
pub struct Repository {
    types: Arc<TypeNameRegistry>,
    event_store: Arc<dyn EventStore>,
    snapshot_store: Arc<dyn SnapshotStore>,
    snapshotter: Snapshotter,
    clock: Arc<dyn Clock>,
}

impl Repository {
    /// Creates a repository.
    #[must_use]
    pub fn new(
        types: Arc<TypeNameRegistry>,
        event_store: Arc<dyn EventStore>,
        snapshot_store: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            snapshotter: Snapshotter::new(Arc::clone(&types), Arc::clone(&clock)),
            types,
            event_store,
            snapshot_store,
            clock,
        }
    }

    /// Type registry used to name aggregates and events.
    #[must_use]
    pub fn types(&self) -> &Arc<TypeNameRegistry> {
        &self.types
    }

    /// Snapshotter bound to this repository's registry and clock.
    #[must_use]
    pub fn snapshotter(&self) -> &Snapshotter {
        &self.snapshotter
    }

    /// Starts tracking a newly created aggregate. It is persisted when the
    /// unit of work submits its changes.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NoActiveUnitOfWork` if the unit of work was
    /// disposed, `DomainError::MissingAggregateId` if the aggregate has no id
    /// and `DomainError::UnregisteredType` if its type has no logical name.
    pub fn add<A: AggregateRoot>(
        &self,
        unit_of_work: &UnitOfWork,
        aggregate: A,
    ) -> Result<Tracked<A>, DomainError> {
        unit_of_work.ensure_active()?;
        self.types.aggregate_name::<A>()?;
        unit_of_work.track(aggregate)
    }

    /// Returns the aggregate with `id`, from the unit of work if tracked,
    /// otherwise rebuilt from its latest snapshot and event tail.
    /// `Ok(None)` means the aggregate has no history.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NoActiveUnitOfWork`, a store error, or a fatal
    /// error if the stored history cannot be replayed.
    #[tracing::instrument(skip(self, unit_of_work), fields(aggregate = std::any::type_name::<A>()))]
    pub async fn get_by_id<A: AggregateRoot>(
        &self,
        unit_of_work: &UnitOfWork,
        id: &str,
    ) -> Result<Option<Tracked<A>>, DomainError> {
        unit_of_work.ensure_active()?;
        ensure_id::<A>(id)?;
        if let Some(tracked) = unit_of_work.find::<A>(id) {
            tracing::trace!("aggregate already tracked");
            return Ok(Some(tracked));
        }
        match self.load::<A>(unit_of_work.id(), id).await? {
            Some(aggregate) => unit_of_work.track(aggregate).map(Some),
            None => Ok(None),
        }
    }

    /// Locks the aggregate's stream for the unit of work, then behaves like
    /// [`Repository::get_by_id`]. Waits while another unit of work holds the
    /// lock.
    ///
    /// # Errors
    ///
    /// Same as [`Repository::get_by_id`], plus lock failures of the event
    /// store.
    pub async fn get_by_id_with_lock<A: AggregateRoot>(
        &self,
        unit_of_work: &UnitOfWork,
        id: &str,
    ) -> Result<Option<Tracked<A>>, DomainError> {
        unit_of_work.ensure_active()?;
        ensure_id::<A>(id)?;
        let name = self.types.aggregate_name::<A>()?;
        let current = self
            .event_store
            .lock_aggregate_root(unit_of_work.id(), name, id)
            .await?;
        tracing::debug!(aggregate = name, aggregate_id = id, current, "stream locked");
        self.get_by_id::<A>(unit_of_work, id).await
    }

    /// Rebuilds aggregates straight from caller-supplied events, one per
    /// distinct aggregate id in first-seen order, and tracks them. Storage
    /// is not read.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NoActiveUnitOfWork`, or a fatal error if a
    /// group of events cannot be replayed.
    pub fn get_from_events<A: AggregateRoot>(
        &self,
        unit_of_work: &UnitOfWork,
        events: &[AggregateRootEvent],
    ) -> Result<Vec<Tracked<A>>, DomainError> {
        unit_of_work.ensure_active()?;
        group_by_id(events)
            .into_iter()
            .map(|group| {
                let mut aggregate = A::default();
                aggregate.replay_events(&group)?;
                unit_of_work.track(aggregate)
            })
            .collect()
    }

    /// Replays `events` into a fresh aggregate without tracking it, for read
    /// models. `Ok(None)` for an empty history.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if the events cannot be replayed.
    pub fn build_for_view<A: AggregateRoot>(
        &self,
        events: &[AggregateRootEvent],
    ) -> Result<Option<A>, DomainError> {
        if events.is_empty() {
            return Ok(None);
        }
        let mut aggregate = A::default();
        aggregate.replay_events(events)?;
        Ok(Some(aggregate))
    }

    /// Snapshots a tracked aggregate at its original version and stores the
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::MissingSnapshotCapability` if `A` declares none,
    /// or the snapshot-store error.
    pub async fn take_snapshot<A: AggregateRoot>(
        &self,
        aggregate: &Tracked<A>,
    ) -> Result<Snapshot, DomainError> {
        let snapshot = {
            let guard = aggregate.lock();
            self.snapshotter.create_snapshot(&*guard)?
        };
        self.snapshot_store.store_snapshot(&snapshot).await?;
        tracing::debug!(
            aggregate = %snapshot.aggregate_root_name,
            aggregate_id = %snapshot.aggregate_root_id,
            version = snapshot.version,
            "snapshot stored"
        );
        Ok(snapshot)
    }

    async fn load<A: AggregateRoot>(
        &self,
        owner: Uuid,
        id: &str,
    ) -> Result<Option<A>, DomainError> {
        let name = self.types.aggregate_name::<A>()?;
        let mut restored = None;
        let last_snapshot = if self.snapshotter.supports::<A>() {
            self.snapshot_store
                .get_last_snapshot(name, id, u64::MAX)
                .await?
        } else {
            None
        };
        if let Some(snapshot) = last_snapshot {
            if snapshot.is_valid(&self.types) {
                let aggregate: A = self.snapshotter.restore_from_snapshot(&snapshot)?;
                if aggregate.id() != Some(id) {
                    return Err(DomainError::InvalidSnapshot {
                        aggregate_root_name: snapshot.aggregate_root_name,
                        aggregate_root_id: snapshot.aggregate_root_id,
                    });
                }
                restored = Some(aggregate);
            } else {
                tracing::warn!(aggregate = name, aggregate_id = id, "ignoring invalid snapshot");
            }
        }

        let from = restored.as_ref().map_or(1, |aggregate| aggregate.original_version() + 1);
        let stored = self.event_store.get_events(owner, name, id, from, u64::MAX).await?;
        let events = self.decode::<A>(&stored)?;
        tracing::debug!(
            aggregate = name,
            aggregate_id = id,
            from_snapshot = restored.is_some(),
            replayed = events.len(),
            "aggregate loaded"
        );

        let mut aggregate = match restored {
            Some(aggregate) => aggregate,
            None if events.is_empty() => return Ok(None),
            None => A::default(),
        };
        aggregate.replay_events(&events)?;
        Ok(Some(aggregate))
    }

    fn decode<A: AggregateRoot>(
        &self,
        stored: &[StoredEvent],
    ) -> Result<Vec<AggregateRootEvent>, DomainError> {
        stored
            .iter()
            .map(|event| {
                let payload = self.types.decode_event(&event.name, event.data.clone())?;
                Ok(AggregateRootEvent::persisted::<A>(
                    event.aggregate_root_id.clone(),
                    event.version,
                    payload,
                    event.occurred_time,
                ))
            })
            .collect()
    }

    /// Versions and stores one aggregate's drained events under the stream
    /// lock. Versions continue from the locked stream's current maximum.
    pub(crate) async fn persist(
        &self,
        owner: Uuid,
        aggregate: &dyn TrackedAggregate,
        events: &mut [AggregateRootEvent],
    ) -> Result<(), DomainError> {
        let Some(first) = events.first() else {
            return Ok(());
        };
        let id = first.aggregate_root_id.clone();
        let name = self.types.get_name(
            TypeKind::AggregateRoot,
            aggregate.aggregate_type(),
            aggregate.aggregate_type_name(),
        )?;
        let current = self.event_store.lock_aggregate_root(owner, name, &id).await?;
        let original = aggregate.original_version();
        if current != original {
            tracing::warn!(
                aggregate = name,
                aggregate_id = %id,
                current,
                original,
                "stream moved since the aggregate was loaded"
            );
        }

        let occurred_time = self.clock.now();
        let mut version = current;
        let mut stored = Vec::with_capacity(events.len());
        for event in events.iter_mut() {
            version += 1;
            event.version = version;
            event.occurred_time = Some(occurred_time);
            let (event_name, data) = self.types.encode_event(event.payload.as_ref())?;
            stored.push(StoredEvent {
                aggregate_root_name: name.to_owned(),
                aggregate_root_id: id.clone(),
                version,
                name: event_name,
                data,
                occurred_time,
            });
        }
        self.event_store.store_events(owner, &stored).await?;
        aggregate.mark_persisted(version);
        tracing::debug!(
            aggregate = name,
            aggregate_id = %id,
            from = current + 1,
            to = version,
            "events persisted"
        );
        Ok(())
    }

    pub(crate) async fn finish(&self, owner: Uuid, outcome: Outcome) -> Result<(), DomainError> {
        self.event_store.finish(owner, outcome).await
    }
}

fn ensure_id<A>(id: &str) -> Result<(), DomainError> {
    if id.is_empty() {
        return Err(DomainError::MissingAggregateId {
            aggregate_type: std::any::type_name::<A>(),
        });
    }
    Ok(())
}

fn group_by_id(events: &[AggregateRootEvent]) -> Vec<Vec<AggregateRootEvent>> {
    let mut groups: Vec<Vec<AggregateRootEvent>> = Vec::new();
    for event in events {
        match groups
            .iter_mut()
            .find(|group| group[0].aggregate_root_id == event.aggregate_root_id)
        {
            Some(group) => group.push(event.clone()),
            None => groups.push(vec![event.clone()]),
        }
    }
    groups
}
