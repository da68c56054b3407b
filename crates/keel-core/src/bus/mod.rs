//! Message buses.
//!
//! Subscribers declare their handlers by implementing [`Subscriber`]. The
//! [`SyncBus`] runs them immediately in the publishing task; the
//! [`AsyncBus`] routes messages through a transport to worker loops.

pub mod async_bus;
pub mod registry;
pub mod subscription;
pub mod sync;
pub mod transport;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DomainError;
use crate::event::{DomainEvent, Message};

pub use async_bus::{AsyncBus, AsyncBusConfig};
pub use registry::{HandledType, HandlerRegistry, MessageView};
pub use sync::SyncBus;

/// Future returned by an erased message handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), DomainError>> + Send>>;

/// Erased message handler.
pub type HandlerFn = Arc<dyn Fn(MessageView) -> HandlerFuture + Send + Sync>;

/// Publishes messages to subscribers.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes one message.
    async fn publish(&self, message: Arc<dyn Message>) -> Result<(), DomainError>;

    /// Publishes messages in order, stopping at the first failure.
    async fn publish_all(&self, messages: &[Arc<dyn Message>]) -> Result<(), DomainError> {
        for message in messages {
            self.publish(Arc::clone(message)).await?;
        }
        Ok(())
    }
}

/// A registered bus handler.
pub struct HandlerMetaData {
    /// Rust type name of the subscriber.
    pub subscriber_type: &'static str,
    /// Rust type name of the handled message type.
    pub message_type: &'static str,
    /// The handler.
    pub handler: HandlerFn,
}

/// A type whose instances handle bus messages.
pub trait Subscriber: Send + Sync + Sized + 'static {
    /// Declares the subscriber's handlers.
    fn subscribe(handlers: &mut SubscriberHandlers<'_, Self>);
}

/// Collects the handlers of one subscriber instance.
pub struct SubscriberHandlers<'r, S> {
    subscriber: Arc<S>,
    registry: &'r mut HandlerRegistry<HandlerMetaData>,
    registered: usize,
}

impl<S: Subscriber> SubscriberHandlers<'_, S> {
    /// Handles messages of the concrete type `E`.
    pub fn on<E, F, Fut>(&mut self, handler: F) -> &mut Self
    where
        E: DomainEvent,
        F: Fn(Arc<S>, Arc<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DomainError>> + Send + 'static,
    {
        let subscriber = Arc::clone(&self.subscriber);
        let erased: HandlerFn = Arc::new(move |view: MessageView| -> HandlerFuture {
            match view.into_concrete::<E>() {
                Some(message) => Box::pin(handler(Arc::clone(&subscriber), message)),
                None => mismatched_view::<E>(),
            }
        });
        self.push(HandledType::of::<E>(), erased);
        self
    }

    /// Handles every message declared as a `K`, or every message at all when
    /// `K` is `dyn Message`.
    pub fn on_any<K, F, Fut>(&mut self, handler: F) -> &mut Self
    where
        K: ?Sized + Send + Sync + 'static,
        F: Fn(Arc<S>, Arc<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DomainError>> + Send + 'static,
    {
        let subscriber = Arc::clone(&self.subscriber);
        let erased: HandlerFn = Arc::new(move |view: MessageView| -> HandlerFuture {
            match view.into_interface::<K>() {
                Some(message) => Box::pin(handler(Arc::clone(&subscriber), message)),
                None => mismatched_view::<K>(),
            }
        });
        self.push(HandledType::of::<K>(), erased);
        self
    }

    fn push(&mut self, handled: HandledType, handler: HandlerFn) {
        self.registry.register(
            handled,
            HandlerMetaData {
                subscriber_type: std::any::type_name::<S>(),
                message_type: handled.type_name,
                handler,
            },
        );
        self.registered += 1;
    }
}

fn mismatched_view<K: ?Sized>() -> HandlerFuture {
    let error = DomainError::InvalidProgram(format!(
        "message view does not hold a {}",
        std::any::type_name::<K>()
    ));
    Box::pin(std::future::ready(Err(error)))
}

/// Registers every handler `subscriber` declares.
///
/// # Errors
///
/// Returns `DomainError::InvalidProgram` if the subscriber declares no
/// handler.
pub(crate) fn register_subscriber<S: Subscriber>(
    registry: &mut HandlerRegistry<HandlerMetaData>,
    subscriber: Arc<S>,
) -> Result<usize, DomainError> {
    let mut handlers = SubscriberHandlers {
        subscriber,
        registry,
        registered: 0,
    };
    S::subscribe(&mut handlers);
    if handlers.registered == 0 {
        return Err(DomainError::InvalidProgram(format!(
            "{} is not a valid subscriber: it declares no handler",
            std::any::type_name::<S>()
        )));
    }
    tracing::debug!(
        subscriber = std::any::type_name::<S>(),
        handlers = handlers.registered,
        "subscriber registered"
    );
    Ok(handlers.registered)
}
