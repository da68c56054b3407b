//! `PostgreSQL` implementation of the `SnapshotStore` trait.

use async_trait::async_trait;
use keel_core::error::DomainError;
use keel_core::snapshot::Snapshot;
use keel_core::store::SnapshotStore;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::{database_error, from_db_version, to_db_version};

/// PostgreSQL-backed snapshot store.
#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    /// Creates a new `PgSnapshotStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn read_snapshot(row: &PgRow) -> Result<Snapshot, DomainError> {
    Ok(Snapshot {
        aggregate_root_name: row.try_get("aggregate_root_name").map_err(database_error)?,
        aggregate_root_id: row.try_get("aggregate_root_id").map_err(database_error)?,
        version: from_db_version(row.try_get("version").map_err(database_error)?)?,
        name: row.try_get("name").map_err(database_error)?,
        data: row.try_get("data").map_err(database_error)?,
        created_time: row.try_get("created_time").map_err(database_error)?,
    })
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    #[tracing::instrument(
        skip(self, snapshot),
        fields(
            aggregate = %snapshot.aggregate_root_name,
            aggregate_id = %snapshot.aggregate_root_id,
            version = snapshot.version
        )
    )]
    async fn store_snapshot(&self, snapshot: &Snapshot) -> Result<(), DomainError> {
        sqlx::query(
            r"
            INSERT INTO keel_snapshots
                (aggregate_root_name, aggregate_root_id, version, name, data, created_time)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (aggregate_root_name, aggregate_root_id, version)
            DO UPDATE SET
                name = EXCLUDED.name,
                data = EXCLUDED.data,
                created_time = EXCLUDED.created_time
            ",
        )
        .bind(&snapshot.aggregate_root_name)
        .bind(&snapshot.aggregate_root_id)
        .bind(to_db_version(snapshot.version))
        .bind(&snapshot.name)
        .bind(&snapshot.data)
        .bind(snapshot.created_time)
        .execute(&self.pool)
        .await
        .map_err(database_error)?;
        Ok(())
    }

    async fn get_last_snapshot(
        &self,
        aggregate_root_name: &str,
        aggregate_root_id: &str,
        max_version: u64,
    ) -> Result<Option<Snapshot>, DomainError> {
        let row = sqlx::query(
            r"
            SELECT aggregate_root_name, aggregate_root_id, version, name, data, created_time
            FROM keel_snapshots
            WHERE aggregate_root_name = $1 AND aggregate_root_id = $2 AND version <= $3
            ORDER BY version DESC
            LIMIT 1
            ",
        )
        .bind(aggregate_root_name)
        .bind(aggregate_root_id)
        .bind(to_db_version(max_version))
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error)?;
        row.as_ref().map(read_snapshot).transpose()
    }

    async fn get_single_snapshot(
        &self,
        aggregate_root_name: &str,
        aggregate_root_id: &str,
        version: u64,
    ) -> Result<Option<Snapshot>, DomainError> {
        let row = sqlx::query(
            r"
            SELECT aggregate_root_name, aggregate_root_id, version, name, data, created_time
            FROM keel_snapshots
            WHERE aggregate_root_name = $1 AND aggregate_root_id = $2 AND version = $3
            ",
        )
        .bind(aggregate_root_name)
        .bind(aggregate_root_id)
        .bind(to_db_version(version))
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error)?;
        row.as_ref().map(read_snapshot).transpose()
    }
}
