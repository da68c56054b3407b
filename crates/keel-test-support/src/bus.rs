//! Recording bus: captures published messages instead of dispatching them.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use keel_core::bus::MessageBus;
use keel_core::error::DomainError;
use keel_core::event::Message;

/// A message bus that records every published message in order.
#[derive(Debug, Default)]
pub struct RecordingBus {
    published: Mutex<Vec<Arc<dyn Message>>>,
}

impl RecordingBus {
    /// Creates an empty recording bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every published message.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn published(&self) -> Vec<Arc<dyn Message>> {
        self.published.lock().unwrap().clone()
    }

    /// Returns the Rust type names of the published messages, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn published_type_names(&self) -> Vec<&'static str> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|message| message.type_name())
            .collect()
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(&self, message: Arc<dyn Message>) -> Result<(), DomainError> {
        self.published.lock().unwrap().push(message);
        Ok(())
    }
}
