//! Message transport over `PostgreSQL` tables.
//!
//! Every input queue is registered in `keel_queues`; messages wait in
//! `keel_messages`. A receive claims the oldest message with
//! `FOR UPDATE SKIP LOCKED` and deletes it in the same statement, so
//! competing workers never see the same message.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use keel_core::bus::async_bus::DEFAULT_RECEIVE_TIMEOUT;
use keel_core::bus::transport::{Address, MessageTransport, TransportError, TransportMessage};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tokio::time::Instant;
use uuid::Uuid;

/// Pause between polls while waiting for a message.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Table-backed transport bound to one input queue.
pub struct PgMessageTransport {
    pool: PgPool,
    input: Mutex<Option<Address>>,
    receive_timeout: Duration,
    poll_interval: Duration,
}

impl PgMessageTransport {
    /// Creates a transport with the default receive timeout and poll
    /// interval.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self::with_timeouts(pool, DEFAULT_RECEIVE_TIMEOUT, DEFAULT_POLL_INTERVAL)
    }

    /// Creates a transport whose receive waits at most `receive_timeout`,
    /// polling every `poll_interval`.
    #[must_use]
    pub fn with_timeouts(pool: PgPool, receive_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            pool,
            input: Mutex::new(None),
            receive_timeout,
            poll_interval,
        }
    }

    fn input(&self) -> Result<Address, TransportError> {
        self.input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::NotInitialized)
    }

    async fn try_receive(
        &self,
        input: &Address,
    ) -> Result<Option<TransportMessage>, TransportError> {
        let row = sqlx::query(
            r"
            DELETE FROM keel_messages
            WHERE seq = (
                SELECT seq FROM keel_messages
                WHERE queue = $1 AND machine = $2
                ORDER BY seq
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, headers, body, reply_to, recoverable
            ",
        )
        .bind(&input.queue)
        .bind(&input.machine)
        .fetch_optional(&self.pool)
        .await
        .map_err(io_error)?;
        let Some(row) = row else {
            return Ok(None);
        };

        let reply_to: Option<String> = row.try_get("reply_to").map_err(io_error)?;
        let Json(headers): Json<BTreeMap<String, String>> =
            row.try_get("headers").map_err(io_error)?;
        Ok(Some(TransportMessage {
            id: row.try_get::<Uuid, _>("id").map_err(io_error)?,
            headers,
            body: row.try_get("body").map_err(io_error)?,
            reply_to: reply_to.map(|address| address.parse()).transpose()?,
            recoverable: row.try_get("recoverable").map_err(io_error)?,
        }))
    }
}

impl std::fmt::Debug for PgMessageTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgMessageTransport")
            .field("input", &self.input.lock().unwrap_or_else(PoisonError::into_inner))
            .field("receive_timeout", &self.receive_timeout)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

fn io_error(error: sqlx::Error) -> TransportError {
    TransportError::Io(error.to_string())
}

#[async_trait]
impl MessageTransport for PgMessageTransport {
    #[tracing::instrument(skip(self), fields(%address))]
    async fn init(&self, address: &Address) -> Result<(), TransportError> {
        sqlx::query(
            "INSERT INTO keel_queues (queue, machine) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
            .bind(&address.queue)
            .bind(&address.machine)
            .execute(&self.pool)
            .await
            .map_err(io_error)?;
        *self.input.lock().unwrap_or_else(PoisonError::into_inner) = Some(address.clone());
        tracing::info!("queue ready");
        Ok(())
    }

    #[tracing::instrument(skip(self, message), fields(message_id = %message.id, %target))]
    async fn send_message(
        &self,
        message: &TransportMessage,
        target: &Address,
    ) -> Result<(), TransportError> {
        let inserted = sqlx::query(
            r"
            INSERT INTO keel_messages (id, queue, machine, headers, body, reply_to, recoverable)
            SELECT $1, $2, $3, $4, $5, $6, $7
            WHERE EXISTS (SELECT 1 FROM keel_queues WHERE queue = $2 AND machine = $3)
            ",
        )
        .bind(message.id)
        .bind(&target.queue)
        .bind(&target.machine)
        .bind(Json(&message.headers))
        .bind(&message.body)
        .bind(message.reply_to.as_ref().map(ToString::to_string))
        .bind(message.recoverable)
        .execute(&self.pool)
        .await
        .map_err(io_error)?;
        if inserted.rows_affected() == 0 {
            return Err(TransportError::DestinationNotFound(target.clone()));
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Option<TransportMessage>, TransportError> {
        let input = self.input()?;
        let deadline = Instant::now() + self.receive_timeout;
        loop {
            if let Some(message) = self.try_receive(&input).await? {
                tracing::debug!(message_id = %message.id, queue = %input, "message received");
                return Ok(Some(message));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}
