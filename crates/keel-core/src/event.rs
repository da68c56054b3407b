//! Domain event abstractions.
//!
//! A payload type opts in by implementing [`DomainEvent`]. Inside the engine
//! payloads travel type-erased as `Arc<dyn Message>`, wrapped in an
//! [`AggregateRootEvent`] while they belong to an aggregate and converted to
//! a [`StoredEvent`] once they are versioned for persistence.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marker trait that all event payloads implement.
pub trait DomainEvent: fmt::Debug + Send + Sync + 'static {}

/// Object-safe view of a payload, used wherever the concrete type is erased.
pub trait Message: Any + fmt::Debug + Send + Sync {
    /// Borrows the payload as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Converts the shared payload into a shared `Any`.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Rust type name of the payload.
    fn type_name(&self) -> &'static str;
}

impl<T: DomainEvent> Message for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

impl dyn Message {
    /// Returns the `TypeId` of the concrete payload.
    #[must_use]
    pub fn payload_type_id(&self) -> TypeId {
        self.as_any().type_id()
    }

    /// Attempts to borrow the payload as `E`.
    #[must_use]
    pub fn downcast_ref<E: DomainEvent>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }
}

/// Attempts to recover the concrete payload from a shared message.
#[must_use]
pub fn downcast_message<E: DomainEvent>(message: &Arc<dyn Message>) -> Option<Arc<E>> {
    Arc::clone(message).into_any().downcast::<E>().ok()
}

/// In-process envelope of an event raised by, or replayed onto, an aggregate.
///
/// `version` is `0` and `occurred_time` is `None` until the unit of work
/// versions the event at persistence time.
#[derive(Debug, Clone)]
pub struct AggregateRootEvent {
    /// Id of the aggregate that raised the event.
    pub aggregate_root_id: String,
    /// `TypeId` of the aggregate that raised the event.
    pub aggregate_root_type: TypeId,
    /// Rust type name of the aggregate, for diagnostics.
    pub aggregate_root_type_name: &'static str,
    /// Position in the aggregate's stream, starting at 1.
    pub version: u64,
    /// Raw payload.
    pub payload: Arc<dyn Message>,
    /// When the event was persisted.
    pub occurred_time: Option<DateTime<Utc>>,
}

impl AggregateRootEvent {
    /// Wraps a freshly raised payload in an unversioned envelope.
    #[must_use]
    pub fn raised<A: 'static>(aggregate_root_id: String, payload: Arc<dyn Message>) -> Self {
        Self {
            aggregate_root_id,
            aggregate_root_type: TypeId::of::<A>(),
            aggregate_root_type_name: std::any::type_name::<A>(),
            version: 0,
            payload,
            occurred_time: None,
        }
    }

    /// Builds an envelope for a payload that was already persisted.
    #[must_use]
    pub fn persisted<A: 'static>(
        aggregate_root_id: String,
        version: u64,
        payload: Arc<dyn Message>,
        occurred_time: DateTime<Utc>,
    ) -> Self {
        Self {
            version,
            occurred_time: Some(occurred_time),
            ..Self::raised::<A>(aggregate_root_id, payload)
        }
    }

    /// Returns `true` once the event carries a persisted version.
    #[must_use]
    pub fn is_versioned(&self) -> bool {
        self.version > 0
    }
}

impl PartialEq for AggregateRootEvent {
    fn eq(&self, other: &Self) -> bool {
        self.aggregate_root_type == other.aggregate_root_type
            && self.aggregate_root_id == other.aggregate_root_id
            && self.version == other.version
    }
}

impl Eq for AggregateRootEvent {}

/// Persisted representation of a domain event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Logical name of the aggregate type.
    pub aggregate_root_name: String,
    /// Aggregate this event belongs to.
    pub aggregate_root_id: String,
    /// Position in the aggregate's stream, starting at 1.
    pub version: u64,
    /// Logical name of the event type, for deserialization routing.
    pub name: String,
    /// Serialized payload.
    pub data: serde_json::Value,
    /// When the event was persisted.
    pub occurred_time: DateTime<Utc>,
}

impl StoredEvent {
    /// Returns the `(aggregate name, aggregate id)` stream key.
    #[must_use]
    pub fn stream(&self) -> (&str, &str) {
        (&self.aggregate_root_name, &self.aggregate_root_id)
    }
}

impl PartialEq for StoredEvent {
    fn eq(&self, other: &Self) -> bool {
        self.aggregate_root_name == other.aggregate_root_name
            && self.aggregate_root_id == other.aggregate_root_id
            && self.version == other.version
    }
}

impl Eq for StoredEvent {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Debug, PartialEq)]
    struct Deposited {
        amount: i64,
    }

    impl DomainEvent for Deposited {}

    struct Account;

    #[test]
    fn test_downcast_message_recovers_concrete_payload() {
        // Arrange
        let message: Arc<dyn Message> = Arc::new(Deposited { amount: 5 });

        // Act
        let recovered = downcast_message::<Deposited>(&message);

        // Assert
        assert_eq!(recovered.as_deref(), Some(&Deposited { amount: 5 }));
        assert_eq!(message.payload_type_id(), TypeId::of::<Deposited>());
    }

    #[test]
    fn test_raised_envelope_is_unversioned() {
        let event =
            AggregateRootEvent::raised::<Account>("a-1".into(), Arc::new(Deposited { amount: 1 }));

        assert_eq!(event.version, 0);
        assert!(!event.is_versioned());
        assert!(event.occurred_time.is_none());
    }

    #[test]
    fn test_envelope_identity_ignores_payload() {
        let at = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        let first = AggregateRootEvent::persisted::<Account>(
            "a-1".into(),
            3,
            Arc::new(Deposited { amount: 1 }),
            at,
        );
        let second = AggregateRootEvent::persisted::<Account>(
            "a-1".into(),
            3,
            Arc::new(Deposited { amount: 2 }),
            at,
        );

        assert_eq!(first, second);
    }
}
