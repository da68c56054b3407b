//! `PostgreSQL` implementation of the `SubscriptionStorage` trait.

use async_trait::async_trait;
use keel_core::bus::subscription::SubscriptionStorage;
use keel_core::bus::transport::Address;
use keel_core::error::DomainError;
use sqlx::PgPool;

use crate::database_error;

/// PostgreSQL-backed subscription storage.
#[derive(Debug, Clone)]
pub struct PgSubscriptionStorage {
    pool: PgPool,
}

impl PgSubscriptionStorage {
    /// Creates a new `PgSubscriptionStorage`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStorage for PgSubscriptionStorage {
    #[tracing::instrument(
        skip(self, message_types),
        fields(%address, types = message_types.len())
    )]
    async fn subscribe(
        &self,
        address: &Address,
        message_types: &[String],
    ) -> Result<(), DomainError> {
        let mut transaction = self.pool.begin().await.map_err(database_error)?;
        for message_type in message_types {
            sqlx::query(
                r"
                INSERT INTO keel_subscriptions (message_type, queue, machine)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                ",
            )
            .bind(message_type)
            .bind(&address.queue)
            .bind(&address.machine)
            .execute(&mut *transaction)
            .await
            .map_err(database_error)?;
        }
        transaction.commit().await.map_err(database_error)?;
        tracing::info!("subscribed");
        Ok(())
    }

    #[tracing::instrument(skip(self, message_types), fields(%address, types = message_types.len()))]
    async fn unsubscribe(
        &self,
        address: &Address,
        message_types: &[String],
    ) -> Result<(), DomainError> {
        sqlx::query(
            r"
            DELETE FROM keel_subscriptions
            WHERE queue = $1 AND machine = $2 AND message_type = ANY($3)
            ",
        )
        .bind(&address.queue)
        .bind(&address.machine)
        .bind(message_types)
        .execute(&self.pool)
        .await
        .map_err(database_error)?;
        tracing::info!("unsubscribed");
        Ok(())
    }

    async fn get_subscriber_addresses_for_message(
        &self,
        message_types: &[String],
    ) -> Result<Vec<Address>, DomainError> {
        if message_types.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<(String, String)> = sqlx::query_as(
            r"
            SELECT DISTINCT queue, machine FROM keel_subscriptions
            WHERE message_type = ANY($1)
            ORDER BY queue, machine
            ",
        )
        .bind(message_types)
        .fetch_all(&self.pool)
        .await
        .map_err(database_error)?;
        Ok(rows
            .into_iter()
            .map(|(queue, machine)| Address::new(queue, machine))
            .collect())
    }
}
