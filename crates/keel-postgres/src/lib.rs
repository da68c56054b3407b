//! `PostgreSQL` collaborators for keel: event store, snapshot store,
//! subscription storage and a table-backed message transport.
//!
//! Call [`migrate`] once at startup to create the tables.

pub mod event_store;
pub mod schema;
pub mod snapshot_store;
pub mod subscription;
pub mod transport;

use keel_core::error::DomainError;
use sqlx::PgPool;

pub use event_store::PgEventStore;
pub use snapshot_store::PgSnapshotStore;
pub use subscription::PgSubscriptionStorage;
pub use transport::PgMessageTransport;

/// Creates every keel table that does not exist yet.
///
/// # Errors
///
/// Returns `DomainError::Infrastructure` if a statement fails.
#[tracing::instrument(skip(pool))]
pub async fn migrate(pool: &PgPool) -> Result<(), DomainError> {
    for statement in schema::ALL {
        sqlx::raw_sql(statement)
            .execute(pool)
            .await
            .map_err(database_error)?;
    }
    tracing::info!(statements = schema::ALL.len(), "schema ready");
    Ok(())
}

pub(crate) fn database_error(error: sqlx::Error) -> DomainError {
    DomainError::Infrastructure(format!("database error: {error}"))
}

/// Versions are `u64` in the engine and `BIGINT` in the database. Bounds
/// beyond `i64::MAX` are clamped, since no stored version can exceed it.
pub(crate) fn to_db_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

pub(crate) fn from_db_version(version: i64) -> Result<u64, DomainError> {
    u64::try_from(version)
        .map_err(|_| DomainError::Infrastructure(format!("negative version {version} in database")))
}
