//! `PostgreSQL` implementation of the `EventStore` trait.
//!
//! Each owner gets its own database transaction, opened on first use and
//! ended by [`EventStore::finish`]. Locking a stream takes a row lock on its
//! `keel_streams` row, so a second owner blocks until the first commits or
//! rolls back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use keel_core::error::DomainError;
use keel_core::event::StoredEvent;
use keel_core::store::{EventStore, Outcome, ensure_single_stream};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::{database_error, from_db_version, to_db_version};

type Session = Arc<tokio::sync::Mutex<sqlx::Transaction<'static, Postgres>>>;

const SELECT_EVENTS: &str = r"
SELECT aggregate_root_name, aggregate_root_id, version, name, data, occurred_time
FROM keel_events
WHERE aggregate_root_name = $1 AND aggregate_root_id = $2 AND version BETWEEN $3 AND $4
ORDER BY version
";

/// PostgreSQL-backed event store.
pub struct PgEventStore {
    pool: PgPool,
    sessions: Mutex<HashMap<Uuid, Session>>,
}

impl PgEventStore {
    /// Creates a new `PgEventStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Number of owners with an open transaction.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.sessions().len()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<Uuid, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find_session(&self, owner: Uuid) -> Option<Session> {
        self.sessions().get(&owner).cloned()
    }

    async fn session(&self, owner: Uuid) -> Result<Session, DomainError> {
        if let Some(session) = self.find_session(owner) {
            return Ok(session);
        }
        let transaction = self.pool.begin().await.map_err(database_error)?;
        tracing::debug!(%owner, "event store session opened");
        let session = Arc::new(tokio::sync::Mutex::new(transaction));
        Ok(Arc::clone(self.sessions().entry(owner).or_insert(session)))
    }
}

impl std::fmt::Debug for PgEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgEventStore")
            .field("open_sessions", &self.open_sessions())
            .finish_non_exhaustive()
    }
}

fn read_event(row: &PgRow) -> Result<StoredEvent, DomainError> {
    Ok(StoredEvent {
        aggregate_root_name: row.try_get("aggregate_root_name").map_err(database_error)?,
        aggregate_root_id: row.try_get("aggregate_root_id").map_err(database_error)?,
        version: from_db_version(row.try_get("version").map_err(database_error)?)?,
        name: row.try_get("name").map_err(database_error)?,
        data: row.try_get("data").map_err(database_error)?,
        occurred_time: row.try_get("occurred_time").map_err(database_error)?,
    })
}

#[async_trait]
impl EventStore for PgEventStore {
    #[tracing::instrument(skip(self), fields(%owner))]
    async fn get_events(
        &self,
        owner: Uuid,
        aggregate_root_name: &str,
        aggregate_root_id: &str,
        min_version: u64,
        max_version: u64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let query = sqlx::query(SELECT_EVENTS)
            .bind(aggregate_root_name)
            .bind(aggregate_root_id)
            .bind(to_db_version(min_version))
            .bind(to_db_version(max_version));
        // Reads inside an open session see the owner's uncommitted writes.
        let rows = match self.find_session(owner) {
            Some(session) => {
                let mut transaction = session.lock().await;
                query.fetch_all(&mut **transaction).await
            }
            None => query.fetch_all(&self.pool).await,
        }
        .map_err(database_error)?;
        rows.iter().map(read_event).collect()
    }

    #[tracing::instrument(skip(self, events), fields(%owner, events = events.len()))]
    async fn store_events(&self, owner: Uuid, events: &[StoredEvent]) -> Result<(), DomainError> {
        ensure_single_stream(events)?;
        let (Some(first), Some(last)) = (events.first(), events.last()) else {
            return Ok(());
        };
        let session = self.session(owner).await?;
        let mut transaction = session.lock().await;

        let mut insert = QueryBuilder::<Postgres>::new(
            "INSERT INTO keel_events \
             (aggregate_root_name, aggregate_root_id, version, name, data, occurred_time) ",
        );
        insert.push_values(events, |mut row, event| {
            row.push_bind(&event.aggregate_root_name)
                .push_bind(&event.aggregate_root_id)
                .push_bind(to_db_version(event.version))
                .push_bind(&event.name)
                .push_bind(&event.data)
                .push_bind(event.occurred_time);
        });
        insert
            .build()
            .execute(&mut **transaction)
            .await
            .map_err(|error| match &error {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    DomainError::Infrastructure(format!(
                        "version conflict on {}/{}",
                        first.aggregate_root_name, first.aggregate_root_id
                    ))
                }
                _ => database_error(error),
            })?;

        sqlx::query(
            r"
            INSERT INTO keel_streams (aggregate_root_name, aggregate_root_id, current_version)
            VALUES ($1, $2, $3)
            ON CONFLICT (aggregate_root_name, aggregate_root_id)
            DO UPDATE SET current_version =
                GREATEST(keel_streams.current_version, EXCLUDED.current_version)
            ",
        )
        .bind(&first.aggregate_root_name)
        .bind(&first.aggregate_root_id)
        .bind(to_db_version(last.version))
        .execute(&mut **transaction)
        .await
        .map_err(database_error)?;

        tracing::debug!(
            aggregate = %first.aggregate_root_name,
            aggregate_id = %first.aggregate_root_id,
            last_version = last.version,
            "events staged"
        );
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(%owner))]
    async fn lock_aggregate_root(
        &self,
        owner: Uuid,
        aggregate_root_name: &str,
        aggregate_root_id: &str,
    ) -> Result<u64, DomainError> {
        let session = self.session(owner).await?;
        let mut transaction = session.lock().await;
        sqlx::query(
            r"
            INSERT INTO keel_streams (aggregate_root_name, aggregate_root_id, current_version)
            VALUES ($1, $2, 0)
            ON CONFLICT (aggregate_root_name, aggregate_root_id) DO NOTHING
            ",
        )
        .bind(aggregate_root_name)
        .bind(aggregate_root_id)
        .execute(&mut **transaction)
        .await
        .map_err(database_error)?;

        let current: i64 = sqlx::query_scalar(
            r"
            SELECT current_version FROM keel_streams
            WHERE aggregate_root_name = $1 AND aggregate_root_id = $2
            FOR UPDATE
            ",
        )
        .bind(aggregate_root_name)
        .bind(aggregate_root_id)
        .fetch_one(&mut **transaction)
        .await
        .map_err(database_error)?;
        from_db_version(current)
    }

    #[tracing::instrument(skip(self), fields(%owner))]
    async fn finish(&self, owner: Uuid, outcome: Outcome) -> Result<(), DomainError> {
        let Some(session) = self.sessions().remove(&owner) else {
            return Ok(());
        };
        let transaction = Arc::try_unwrap(session)
            .map_err(|_| {
                DomainError::InvalidProgram(format!("event store session {owner} is still in use"))
            })?
            .into_inner();
        match outcome {
            Outcome::Committed => transaction.commit().await,
            Outcome::RolledBack => transaction.rollback().await,
        }
        .map_err(database_error)?;
        tracing::debug!(?outcome, "event store session finished");
        Ok(())
    }
}
