//! Transport between endpoints sharing one in-process network.
//!
//! Delivery is at-most-once: messages live only in memory and are lost with
//! the process, whatever their `recoverable` flag says.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::bus::async_bus::DEFAULT_RECEIVE_TIMEOUT;
use crate::bus::transport::{Address, MessageTransport, TransportError, TransportMessage};

#[derive(Default)]
struct Queue {
    messages: Mutex<VecDeque<TransportMessage>>,
    arrived: Notify,
}

impl Queue {
    fn push(&self, message: TransportMessage) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(message);
        self.arrived.notify_one();
    }

    fn pop(&self) -> Option<TransportMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn len(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Set of named queues shared by every [`InMemoryTransport`] created from it.
#[derive(Default)]
pub struct InMemoryNetwork {
    queues: Mutex<HashMap<Address, Arc<Queue>>>,
}

impl InMemoryNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a transport attached to this network.
    #[must_use]
    pub fn transport(self: &Arc<Self>) -> InMemoryTransport {
        InMemoryTransport::new(Arc::clone(self), DEFAULT_RECEIVE_TIMEOUT)
    }

    /// Number of messages waiting in the queue at `address`.
    #[must_use]
    pub fn pending(&self, address: &Address) -> usize {
        self.find(address).map_or(0, |queue| queue.len())
    }

    fn find(&self, address: &Address) -> Option<Arc<Queue>> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }

    fn open(&self, address: &Address) -> Arc<Queue> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(queues.entry(address.clone()).or_default())
    }
}

/// One endpoint's view of an [`InMemoryNetwork`].
pub struct InMemoryTransport {
    network: Arc<InMemoryNetwork>,
    input: Mutex<Option<Arc<Queue>>>,
    receive_timeout: Duration,
}

impl InMemoryTransport {
    /// Creates a transport whose receive waits at most `receive_timeout`.
    #[must_use]
    pub fn new(network: Arc<InMemoryNetwork>, receive_timeout: Duration) -> Self {
        Self {
            network,
            input: Mutex::new(None),
            receive_timeout,
        }
    }

    fn input(&self) -> Result<Arc<Queue>, TransportError> {
        self.input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::NotInitialized)
    }
}

#[async_trait]
impl MessageTransport for InMemoryTransport {
    async fn init(&self, address: &Address) -> Result<(), TransportError> {
        let queue = self.network.open(address);
        *self.input.lock().unwrap_or_else(PoisonError::into_inner) = Some(queue);
        Ok(())
    }

    async fn send_message(
        &self,
        message: &TransportMessage,
        target: &Address,
    ) -> Result<(), TransportError> {
        let queue = self
            .network
            .find(target)
            .ok_or_else(|| TransportError::DestinationNotFound(target.clone()))?;
        queue.push(message.clone());
        Ok(())
    }

    async fn receive(&self) -> Result<Option<TransportMessage>, TransportError> {
        let queue = self.input()?;
        let deadline = tokio::time::Instant::now() + self.receive_timeout;
        loop {
            let arrived = queue.arrived.notified();
            if let Some(message) = queue.pop() {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                return Ok(queue.pop());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use uuid::Uuid;

    use super::*;

    fn message(body: &str) -> TransportMessage {
        TransportMessage {
            id: Uuid::new_v4(),
            headers: BTreeMap::new(),
            body: body.as_bytes().to_vec(),
            reply_to: None,
            recoverable: false,
        }
    }

    #[tokio::test]
    async fn test_message_sent_to_initialized_queue_is_received() {
        // Arrange
        let network = InMemoryNetwork::new();
        let sender = network.transport();
        let receiver = network.transport();
        let billing = Address::local("billing");
        receiver.init(&billing).await.unwrap();

        // Act
        sender.send_message(&message("hello"), &billing).await.unwrap();
        let received = receiver.receive().await.unwrap();

        // Assert
        assert_eq!(received.map(|m| m.body), Some(b"hello".to_vec()));
        assert_eq!(network.pending(&billing), 0);
    }

    #[tokio::test]
    async fn test_send_to_unknown_queue_fails() {
        let network = InMemoryNetwork::new();
        let sender = network.transport();

        let result = sender.send_message(&message("x"), &Address::local("nowhere")).await;

        assert!(matches!(result, Err(TransportError::DestinationNotFound(_))));
    }

    #[tokio::test]
    async fn test_receive_before_init_fails() {
        let network = InMemoryNetwork::new();

        let result = network.transport().receive().await;

        assert!(matches!(result, Err(TransportError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_receive_times_out_with_no_message() {
        let network = InMemoryNetwork::new();
        let receiver = InMemoryTransport::new(Arc::clone(&network), Duration::from_millis(20));
        receiver.init(&Address::local("idle")).await.unwrap();

        let received = receiver.receive().await.unwrap();

        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_waiting_receiver_wakes_on_send() {
        let network = InMemoryNetwork::new();
        let receiver = Arc::new(network.transport());
        let billing = Address::local("billing");
        receiver.init(&billing).await.unwrap();

        let waiting = {
            let receiver = Arc::clone(&receiver);
            tokio::spawn(async move { receiver.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        network.transport().send_message(&message("late"), &billing).await.unwrap();

        let received = waiting.await.unwrap().unwrap();
        assert_eq!(received.map(|m| m.body), Some(b"late".to_vec()));
    }
}
