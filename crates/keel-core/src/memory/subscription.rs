use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::bus::subscription::SubscriptionStorage;
use crate::bus::transport::Address;
use crate::error::DomainError;

/// Subscription storage kept in process memory.
#[derive(Debug, Default)]
pub struct InMemorySubscriptionStorage {
    by_message_type: Mutex<HashMap<String, Vec<Address>>>,
}

impl InMemorySubscriptionStorage {
    /// Creates an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStorage for InMemorySubscriptionStorage {
    async fn subscribe(
        &self,
        address: &Address,
        message_types: &[String],
    ) -> Result<(), DomainError> {
        let mut subscriptions = self
            .by_message_type
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for message_type in message_types {
            let addresses = subscriptions.entry(message_type.clone()).or_default();
            if !addresses.contains(address) {
                addresses.push(address.clone());
            }
        }
        tracing::debug!(%address, count = message_types.len(), "subscribed");
        Ok(())
    }

    async fn unsubscribe(
        &self,
        address: &Address,
        message_types: &[String],
    ) -> Result<(), DomainError> {
        let mut subscriptions = self
            .by_message_type
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for message_type in message_types {
            if let Some(addresses) = subscriptions.get_mut(message_type) {
                addresses.retain(|subscribed| subscribed != address);
            }
        }
        Ok(())
    }

    async fn get_subscriber_addresses_for_message(
        &self,
        message_types: &[String],
    ) -> Result<Vec<Address>, DomainError> {
        let subscriptions = self
            .by_message_type
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<Address> = Vec::new();
        for address in message_types
            .iter()
            .filter_map(|message_type| subscriptions.get(message_type))
            .flatten()
        {
            if !found.contains(address) {
                found.push(address.clone());
            }
        }
        Ok(found)
    }
}
