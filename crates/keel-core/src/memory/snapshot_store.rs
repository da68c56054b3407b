use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::DomainError;
use crate::snapshot::Snapshot;
use crate::store::SnapshotStore;

/// Snapshot store kept in process memory, indexed by stream and version.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<HashMap<(String, String), BTreeMap<u64, Snapshot>>>,
}

impl InMemorySnapshotStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    /// Returns `true` if no snapshot is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find(
        &self,
        aggregate_root_name: &str,
        aggregate_root_id: &str,
        select: impl FnOnce(&BTreeMap<u64, Snapshot>) -> Option<&Snapshot>,
    ) -> Option<Snapshot> {
        let snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        snapshots
            .get(&(aggregate_root_name.to_owned(), aggregate_root_id.to_owned()))
            .and_then(select)
            .cloned()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn store_snapshot(&self, snapshot: &Snapshot) -> Result<(), DomainError> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((
                snapshot.aggregate_root_name.clone(),
                snapshot.aggregate_root_id.clone(),
            ))
            .or_default()
            .insert(snapshot.version, snapshot.clone());
        Ok(())
    }

    async fn get_last_snapshot(
        &self,
        aggregate_root_name: &str,
        aggregate_root_id: &str,
        max_version: u64,
    ) -> Result<Option<Snapshot>, DomainError> {
        Ok(self.find(aggregate_root_name, aggregate_root_id, |by_version| {
            by_version
                .range(..=max_version)
                .next_back()
                .map(|(_, snapshot)| snapshot)
        }))
    }

    async fn get_single_snapshot(
        &self,
        aggregate_root_name: &str,
        aggregate_root_id: &str,
        version: u64,
    ) -> Result<Option<Snapshot>, DomainError> {
        Ok(self.find(aggregate_root_name, aggregate_root_id, |by_version| {
            by_version.get(&version)
        }))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn snapshot(version: u64) -> Snapshot {
        Snapshot {
            aggregate_root_name: "account".into(),
            aggregate_root_id: "a-1".into(),
            version,
            name: "account.snapshot".into(),
            data: serde_json::json!({ "balance": version * 10 }),
            created_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_get_last_snapshot_respects_version_ceiling() {
        // Arrange
        let store = InMemorySnapshotStore::new();
        for version in [3, 7, 12] {
            store.store_snapshot(&snapshot(version)).await.unwrap();
        }

        // Act
        let latest = store.get_last_snapshot("account", "a-1", u64::MAX).await.unwrap();
        let capped = store.get_last_snapshot("account", "a-1", 10).await.unwrap();
        let below_all = store.get_last_snapshot("account", "a-1", 2).await.unwrap();

        // Assert
        assert_eq!(latest.map(|s| s.version), Some(12));
        assert_eq!(capped.map(|s| s.version), Some(7));
        assert!(below_all.is_none());
    }

    #[tokio::test]
    async fn test_get_single_snapshot_matches_exact_version() {
        let store = InMemorySnapshotStore::new();
        store.store_snapshot(&snapshot(3)).await.unwrap();

        let exact = store.get_single_snapshot("account", "a-1", 3).await.unwrap();
        let missing = store.get_single_snapshot("account", "a-1", 4).await.unwrap();

        assert_eq!(exact.map(|s| s.version), Some(3));
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_storing_same_version_replaces_snapshot() {
        let store = InMemorySnapshotStore::new();
        store.store_snapshot(&snapshot(3)).await.unwrap();
        let mut replacement = snapshot(3);
        replacement.data = serde_json::json!({ "balance": 99 });

        store.store_snapshot(&replacement).await.unwrap();

        assert_eq!(store.len(), 1);
        let stored = store.get_single_snapshot("account", "a-1", 3).await.unwrap().unwrap();
        assert_eq!(stored.data["balance"], 99);
    }
}
