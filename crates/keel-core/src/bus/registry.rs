//! Handler registry shared by the sync bus, the async bus and the domain
//! cascade dispatcher.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::event::{DomainEvent, Message};
use crate::types::TypeNameRegistry;

/// A message viewed as one of the types it can be dispatched as.
#[derive(Clone)]
pub struct MessageView(Arc<dyn Any + Send + Sync>);

impl MessageView {
    pub(crate) fn concrete(message: Arc<dyn Message>) -> Self {
        Self(Arc::new(message.into_any()))
    }

    pub(crate) fn interface<K: ?Sized + Send + Sync + 'static>(value: Arc<K>) -> Self {
        Self(Arc::new(value))
    }

    /// Recovers the concrete payload from a view of the concrete type.
    #[must_use]
    pub fn into_concrete<M: DomainEvent>(self) -> Option<Arc<M>> {
        let any = self.0.downcast_ref::<Arc<dyn Any + Send + Sync>>()?;
        Arc::clone(any).downcast::<M>().ok()
    }

    /// Recovers the payload from a view of a declared supertype.
    #[must_use]
    pub fn into_interface<K: ?Sized + 'static>(self) -> Option<Arc<K>> {
        self.0.downcast_ref::<Arc<K>>().cloned()
    }
}

/// Type a handler is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandledType {
    /// `TypeId` of the handled type.
    pub type_id: TypeId,
    /// Rust type name of the handled type.
    pub type_name: &'static str,
}

impl HandledType {
    /// Describes `K`, which may be a concrete event or a trait object.
    #[must_use]
    pub fn of<K: ?Sized + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<K>(),
            type_name: std::any::type_name::<K>(),
        }
    }
}

/// Maps handled message types to handler metadata of type `M`.
///
/// Lookup is polymorphic: a message matches the handlers of its concrete
/// type, of every supertype declared in the [`TypeNameRegistry`], and of
/// `dyn Message`.
pub struct HandlerRegistry<M> {
    types: Arc<TypeNameRegistry>,
    handlers: HashMap<TypeId, Vec<Arc<M>>>,
    message_types: Vec<String>,
}

impl<M> HandlerRegistry<M> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(types: Arc<TypeNameRegistry>) -> Self {
        Self {
            types,
            handlers: HashMap::new(),
            message_types: Vec::new(),
        }
    }

    /// Adds a handler for `handled`.
    pub fn register(&mut self, handled: HandledType, metadata: M) {
        let key = self.types.message_key(handled.type_id, handled.type_name);
        if !self.message_types.contains(&key) {
            self.message_types.push(key);
        }
        self.handlers
            .entry(handled.type_id)
            .or_default()
            .push(Arc::new(metadata));
    }

    /// Returns every handler matching `message`, each paired with a view of
    /// the message as the type the handler was registered for.
    #[must_use]
    pub fn handlers_for(&self, message: &Arc<dyn Message>) -> Vec<(Arc<M>, MessageView)> {
        let mut matches = Vec::new();
        for entry in self.types.lineage(message) {
            let Some(handlers) = self.handlers.get(&entry.type_id) else {
                continue;
            };
            for handler in handlers {
                matches.push((Arc::clone(handler), entry.view.clone()));
            }
        }
        matches
    }

    /// Subscription keys of every handled message type, in registration
    /// order.
    #[must_use]
    pub fn message_types(&self) -> &[String] {
        &self.message_types
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    /// Returns `true` if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// The type registry used to resolve message lineage.
    #[must_use]
    pub fn types(&self) -> &Arc<TypeNameRegistry> {
        &self.types
    }
}
