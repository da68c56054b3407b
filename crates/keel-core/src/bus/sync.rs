//! Immediate in-process dispatch.

use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::registry::HandlerRegistry;
use crate::bus::{HandlerMetaData, MessageBus, Subscriber, register_subscriber};
use crate::error::DomainError;
use crate::event::Message;
use crate::types::TypeNameRegistry;

/// Bus that runs every matching handler in the publishing task, inside the
/// caller's transaction. The first failing handler fails the publish.
pub struct SyncBus {
    registry: HandlerRegistry<HandlerMetaData>,
}

impl SyncBus {
    /// Creates a bus with no subscribers.
    #[must_use]
    pub fn new(types: Arc<TypeNameRegistry>) -> Self {
        Self {
            registry: HandlerRegistry::new(types),
        }
    }

    /// Registers the handlers declared by `subscriber`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidProgram` if the subscriber declares no
    /// handler.
    pub fn register_subscriber<S: Subscriber>(
        &mut self,
        subscriber: Arc<S>,
    ) -> Result<&mut Self, DomainError> {
        register_subscriber(&mut self.registry, subscriber)?;
        Ok(self)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.registry.len()
    }
}

#[async_trait]
impl MessageBus for SyncBus {
    async fn publish(&self, message: Arc<dyn Message>) -> Result<(), DomainError> {
        for (metadata, view) in self.registry.handlers_for(&message) {
            tracing::debug!(
                subscriber = metadata.subscriber_type,
                message_type = metadata.message_type,
                "dispatching message synchronously"
            );
            (metadata.handler)(view).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::bus::SubscriberHandlers;
    use crate::event::DomainEvent;

    #[derive(Debug)]
    struct Credited(i64);
    impl DomainEvent for Credited {}

    #[derive(Debug)]
    struct Debited(i64);
    impl DomainEvent for Debited {}

    trait Movement: Send + Sync {
        fn amount(&self) -> i64;
    }
    impl Movement for Credited {
        fn amount(&self) -> i64 {
            self.0
        }
    }
    impl Movement for Debited {
        fn amount(&self) -> i64 {
            -self.0
        }
    }

    #[derive(Default)]
    struct Ledger {
        credits: Mutex<Vec<i64>>,
        movements: Mutex<Vec<i64>>,
    }

    impl Subscriber for Ledger {
        fn subscribe(handlers: &mut SubscriberHandlers<'_, Self>) {
            handlers
                .on(|ledger: Arc<Self>, event: Arc<Credited>| async move {
                    ledger.credits.lock().unwrap().push(event.0);
                    Ok(())
                })
                .on_any(|ledger: Arc<Self>, event: Arc<dyn Movement>| async move {
                    ledger.movements.lock().unwrap().push(event.amount());
                    Ok(())
                });
        }
    }

    struct Silent;

    impl Subscriber for Silent {
        fn subscribe(_handlers: &mut SubscriberHandlers<'_, Self>) {}
    }

    struct Rejecting;

    impl Subscriber for Rejecting {
        fn subscribe(handlers: &mut SubscriberHandlers<'_, Self>) {
            handlers.on(|_: Arc<Self>, _: Arc<Debited>| async {
                Err(DomainError::Validation("overdrawn".into()))
            });
        }
    }

    fn types() -> Arc<TypeNameRegistry> {
        let mut types = TypeNameRegistry::new();
        types
            .register_supertype::<Credited, dyn Movement>(|e| e)
            .register_supertype::<Debited, dyn Movement>(|e| e);
        Arc::new(types)
    }

    #[tokio::test]
    async fn test_publish_invokes_concrete_and_supertype_handlers_immediately() {
        // Arrange
        let ledger = Arc::new(Ledger::default());
        let mut bus = SyncBus::new(types());
        bus.register_subscriber(Arc::clone(&ledger)).unwrap();

        // Act
        bus.publish(Arc::new(Credited(10))).await.unwrap();
        bus.publish(Arc::new(Debited(4))).await.unwrap();

        // Assert
        assert_eq!(*ledger.credits.lock().unwrap(), vec![10]);
        assert_eq!(*ledger.movements.lock().unwrap(), vec![10, -4]);
    }

    #[tokio::test]
    async fn test_publish_surfaces_handler_failure() {
        let mut bus = SyncBus::new(types());
        bus.register_subscriber(Arc::new(Rejecting)).unwrap();

        let result = bus.publish(Arc::new(Debited(4))).await;

        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[test]
    fn test_subscriber_without_handlers_is_rejected() {
        let mut bus = SyncBus::new(types());

        let result = bus.register_subscriber(Arc::new(Silent));

        assert!(matches!(result, Err(DomainError::InvalidProgram(_))));
        assert_eq!(bus.handler_count(), 0);
    }
}
