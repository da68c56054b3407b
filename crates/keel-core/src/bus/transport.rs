//! Transport collaborator of the async bus.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Header carrying the logical type name of the message body.
pub const MESSAGE_TYPE_HEADER: &str = "keel.message-type";

/// Machine name used by [`Address::local`].
pub const LOCAL_MACHINE: &str = "localhost";

/// Logical endpoint identity: `queue@machine`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    /// Queue name.
    pub queue: String,
    /// Machine hosting the queue.
    pub machine: String,
}

impl Address {
    /// Creates an address.
    #[must_use]
    pub fn new(queue: impl Into<String>, machine: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            machine: machine.into(),
        }
    }

    /// Address of a queue on the local machine.
    #[must_use]
    pub fn local(queue: impl Into<String>) -> Self {
        Self::new(queue, LOCAL_MACHINE)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.queue, self.machine)
    }
}

impl FromStr for Address {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (queue, machine) = s.split_once('@').unwrap_or((s, LOCAL_MACHINE));
        if queue.is_empty() || machine.is_empty() {
            return Err(TransportError::InvalidAddress(s.to_owned()));
        }
        Ok(Self::new(queue, machine))
    }
}

/// Envelope handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    /// Unique message id.
    pub id: Uuid,
    /// Message headers, including [`MESSAGE_TYPE_HEADER`].
    pub headers: BTreeMap<String, String>,
    /// Serialized body.
    pub body: Vec<u8>,
    /// Where replies should go.
    pub reply_to: Option<Address>,
    /// Whether the transport should persist the message.
    pub recoverable: bool,
}

impl TransportMessage {
    /// Logical type name of the body, if the header is present.
    #[must_use]
    pub fn message_type(&self) -> Option<&str> {
        self.headers.get(MESSAGE_TYPE_HEADER).map(String::as_str)
    }
}

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The target queue does not exist.
    #[error("destination not found: {0}")]
    DestinationNotFound(Address),

    /// The caller may not use the queue.
    #[error("access denied to queue {0}")]
    AccessDenied(Address),

    /// The transport was used before `init`.
    #[error("transport is not initialized")]
    NotInitialized,

    /// An address string could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Underlying I/O failed.
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Moves serialized messages between endpoints.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Binds the transport to the endpoint's own input queue.
    async fn init(&self, address: &Address) -> Result<(), TransportError>;

    /// Sends `message` to `target` without waiting for delivery.
    async fn send_message(
        &self,
        message: &TransportMessage,
        target: &Address,
    ) -> Result<(), TransportError>;

    /// Receives the next message from the input queue, waiting a bounded
    /// time. `Ok(None)` means no message arrived within the wait.
    async fn receive(&self) -> Result<Option<TransportMessage>, TransportError>;
}
