//! Subscription-storage collaborator of the async bus.

use async_trait::async_trait;

use crate::bus::transport::Address;
use crate::error::DomainError;

/// Records which endpoints want which message types.
#[async_trait]
pub trait SubscriptionStorage: Send + Sync {
    /// Subscribes `address` to each of `message_types`. Existing
    /// subscriptions are left as they are.
    async fn subscribe(&self, address: &Address, message_types: &[String])
    -> Result<(), DomainError>;

    /// Removes the subscriptions of `address` to each of `message_types`.
    async fn unsubscribe(
        &self,
        address: &Address,
        message_types: &[String],
    ) -> Result<(), DomainError>;

    /// Addresses subscribed to any of `message_types`, without duplicates.
    async fn get_subscriber_addresses_for_message(
        &self,
        message_types: &[String],
    ) -> Result<Vec<Address>, DomainError>;
}
