//! In-memory `EventStore` with per-owner staged writes and exclusive locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::error::DomainError;
use crate::event::StoredEvent;
use crate::store::{EventStore, Outcome, ensure_single_stream};

type StreamKey = (String, String);

fn key(aggregate_root_name: &str, aggregate_root_id: &str) -> StreamKey {
    (aggregate_root_name.to_owned(), aggregate_root_id.to_owned())
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Event store kept in process memory.
///
/// Writes are staged per owner and become visible to other owners only when
/// [`EventStore::finish`] commits them. Stream locks are real: a second
/// owner calling [`EventStore::lock_aggregate_root`] on a locked stream waits
/// until the first owner finishes.
#[derive(Default)]
pub struct InMemoryEventStore {
    committed: Mutex<HashMap<StreamKey, Vec<StoredEvent>>>,
    staged: Mutex<HashMap<Uuid, Vec<StoredEvent>>>,
    stream_locks: Mutex<HashMap<StreamKey, Arc<tokio::sync::Mutex<()>>>>,
    held: Mutex<HashMap<Uuid, HashMap<StreamKey, OwnedMutexGuard<()>>>>,
}

impl InMemoryEventStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed events of one stream, ordered by version.
    #[must_use]
    pub fn stream(&self, aggregate_root_name: &str, aggregate_root_id: &str) -> Vec<StoredEvent> {
        guard(&self.committed)
            .get(&key(aggregate_root_name, aggregate_root_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of committed events.
    #[must_use]
    pub fn committed_count(&self) -> usize {
        guard(&self.committed).values().map(Vec::len).sum()
    }

    /// Returns `true` if `owner` holds the lock on the stream.
    #[must_use]
    pub fn is_locked_by(
        &self,
        owner: Uuid,
        aggregate_root_name: &str,
        aggregate_root_id: &str,
    ) -> bool {
        guard(&self.held)
            .get(&owner)
            .is_some_and(|held| held.contains_key(&key(aggregate_root_name, aggregate_root_id)))
    }

    fn visible(&self, owner: Uuid, stream: &StreamKey) -> Vec<StoredEvent> {
        let mut events = guard(&self.committed)
            .get(stream)
            .cloned()
            .unwrap_or_default();
        if let Some(staged) = guard(&self.staged).get(&owner) {
            events.extend(
                staged
                    .iter()
                    .filter(|event| {
                        event.aggregate_root_name == stream.0 && event.aggregate_root_id == stream.1
                    })
                    .cloned(),
            );
        }
        events.sort_by_key(|event| event.version);
        events
    }

    fn current_version(&self, owner: Uuid, stream: &StreamKey) -> u64 {
        self.visible(owner, stream)
            .last()
            .map_or(0, |event| event.version)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn get_events(
        &self,
        owner: Uuid,
        aggregate_root_name: &str,
        aggregate_root_id: &str,
        min_version: u64,
        max_version: u64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let stream = key(aggregate_root_name, aggregate_root_id);
        Ok(self
            .visible(owner, &stream)
            .into_iter()
            .filter(|event| (min_version..=max_version).contains(&event.version))
            .collect())
    }

    async fn store_events(&self, owner: Uuid, events: &[StoredEvent]) -> Result<(), DomainError> {
        ensure_single_stream(events)?;
        let Some(first) = events.first() else {
            return Ok(());
        };
        let stream = key(&first.aggregate_root_name, &first.aggregate_root_id);
        let mut expected = self.current_version(owner, &stream) + 1;
        for event in events {
            if event.version != expected {
                return Err(DomainError::Infrastructure(format!(
                    "version conflict on {}/{}: expected {expected}, got {}",
                    stream.0, stream.1, event.version
                )));
            }
            expected += 1;
        }
        guard(&self.staged)
            .entry(owner)
            .or_default()
            .extend(events.iter().cloned());
        Ok(())
    }

    async fn lock_aggregate_root(
        &self,
        owner: Uuid,
        aggregate_root_name: &str,
        aggregate_root_id: &str,
    ) -> Result<u64, DomainError> {
        let stream = key(aggregate_root_name, aggregate_root_id);
        let already_held = guard(&self.held)
            .get(&owner)
            .is_some_and(|held| held.contains_key(&stream));
        if !already_held {
            let lock = Arc::clone(guard(&self.stream_locks).entry(stream.clone()).or_default());
            let acquired = lock.lock_owned().await;
            guard(&self.held)
                .entry(owner)
                .or_default()
                .insert(stream.clone(), acquired);
        }
        Ok(self.current_version(owner, &stream))
    }

    async fn finish(&self, owner: Uuid, outcome: Outcome) -> Result<(), DomainError> {
        let staged = guard(&self.staged).remove(&owner).unwrap_or_default();
        if outcome == Outcome::Committed {
            let mut committed = guard(&self.committed);
            for event in staged {
                let stream = key(&event.aggregate_root_name, &event.aggregate_root_id);
                committed.entry(stream).or_default().push(event);
            }
        }
        let released = guard(&self.held).remove(&owner);
        drop(released);
        Ok(())
    }
}
