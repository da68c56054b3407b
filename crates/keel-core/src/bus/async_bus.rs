//! Subscription-based dispatch through a transport and a worker pool.
//!
//! Publishing looks up the endpoints subscribed to the message's type (or
//! to any type it can be viewed as) and sends each a serialized copy.
//! Worker loops on the receiving side pull messages from the endpoint's
//! input queue and run the matching local handlers, one message at a time
//! per loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::registry::HandlerRegistry;
use crate::bus::subscription::SubscriptionStorage;
use crate::bus::transport::{Address, MESSAGE_TYPE_HEADER, MessageTransport, TransportMessage};
use crate::bus::{HandlerMetaData, MessageBus, Subscriber, register_subscriber};
use crate::error::DomainError;
use crate::event::Message;
use crate::types::TypeNameRegistry;

/// Number of worker loops started by default.
pub const DEFAULT_WORKER_COUNT: usize = 2;

/// Default bounded wait of a transport receive.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Settings of one async-bus endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncBusConfig {
    /// The endpoint's own input queue.
    pub input_address: Address,
    /// Number of worker loops.
    pub worker_count: usize,
}

impl Default for AsyncBusConfig {
    fn default() -> Self {
        Self {
            input_address: Address::local("keel"),
            worker_count: DEFAULT_WORKER_COUNT,
        }
    }
}

struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

struct Endpoint {
    config: AsyncBusConfig,
    types: Arc<TypeNameRegistry>,
    registry: HandlerRegistry<HandlerMetaData>,
    subscriptions: Arc<dyn SubscriptionStorage>,
    transport: Arc<dyn MessageTransport>,
    workers: Mutex<Vec<Worker>>,
    next_worker_id: AtomicUsize,
    shutdown: watch::Sender<bool>,
}

impl Endpoint {
    fn workers(&self) -> MutexGuard<'_, Vec<Worker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_message(&self, payload: &dyn Message) -> Result<TransportMessage, DomainError> {
        let (name, data) = self.types.encode_event(payload)?;
        Ok(TransportMessage {
            id: Uuid::now_v7(),
            headers: [(MESSAGE_TYPE_HEADER.to_owned(), name)].into_iter().collect(),
            body: serde_json::to_vec(&data)?,
            reply_to: Some(self.config.input_address.clone()),
            recoverable: true,
        })
    }

    fn read_message(
        &self,
        message: &TransportMessage,
    ) -> Result<Option<Arc<dyn Message>>, DomainError> {
        let Some(name) = message.message_type() else {
            tracing::warn!(message_id = %message.id, "message has no type header; dropped");
            return Ok(None);
        };
        if message.body.is_empty() {
            tracing::warn!(message_id = %message.id, "message has an empty body; dropped");
            return Ok(None);
        }
        let data: serde_json::Value = serde_json::from_slice(&message.body)?;
        self.types.decode_event(name, data).map(Some)
    }

    #[tracing::instrument(skip(self, message), fields(message_id = %message.id))]
    async fn handle_message(&self, message: TransportMessage) -> Result<(), DomainError> {
        let Some(payload) = self.read_message(&message)? else {
            return Ok(());
        };
        for (metadata, view) in self.registry.handlers_for(&payload) {
            tracing::debug!(
                subscriber = metadata.subscriber_type,
                message_type = metadata.message_type,
                "dispatching message"
            );
            (metadata.handler)(view).await?;
        }
        Ok(())
    }
}

async fn run_worker(
    endpoint: Arc<Endpoint>,
    worker_id: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(worker_id, "worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let received = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            received = endpoint.transport.receive() => received,
        };
        match received {
            Ok(Some(message)) => {
                let message_id = message.id;
                if let Err(error) = endpoint.handle_message(message).await {
                    tracing::error!(worker_id, %message_id, %error, "message handling failed");
                }
            }
            Ok(None) => {}
            Err(error) => {
                tracing::error!(worker_id, %error, "receive failed; worker stopping");
                break;
            }
        }
    }
    endpoint.workers().retain(|worker| worker.id != worker_id);
    tracing::info!(worker_id, "worker stopped");
}

/// Bus that delivers messages to subscribed endpoints through a
/// [`MessageTransport`].
pub struct AsyncBus {
    endpoint: Arc<Endpoint>,
}

impl AsyncBus {
    /// Creates an endpoint with no subscribers.
    #[must_use]
    pub fn new(
        config: AsyncBusConfig,
        types: Arc<TypeNameRegistry>,
        subscriptions: Arc<dyn SubscriptionStorage>,
        transport: Arc<dyn MessageTransport>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            endpoint: Arc::new(Endpoint {
                config,
                registry: HandlerRegistry::new(Arc::clone(&types)),
                types,
                subscriptions,
                transport,
                workers: Mutex::new(Vec::new()),
                next_worker_id: AtomicUsize::new(1),
                shutdown,
            }),
        }
    }

    /// Registers the handlers declared by `subscriber`. Only possible before
    /// [`AsyncBus::start`].
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidProgram` if the bus already started or
    /// the subscriber declares no handler.
    pub fn register_subscriber<S: Subscriber>(
        &mut self,
        subscriber: Arc<S>,
    ) -> Result<&mut Self, DomainError> {
        let endpoint = Arc::get_mut(&mut self.endpoint).ok_or_else(|| {
            DomainError::InvalidProgram("subscribers must be registered before start".into())
        })?;
        register_subscriber(&mut endpoint.registry, subscriber)?;
        Ok(self)
    }

    /// Binds the transport to this endpoint's input address.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Transport` if the transport rejects the address.
    pub async fn initialize(&self) -> Result<(), DomainError> {
        let address = &self.endpoint.config.input_address;
        self.endpoint.transport.init(address).await?;
        tracing::info!(%address, "async bus initialized");
        Ok(())
    }

    /// Starts the worker loops and subscribes the input address to every
    /// handled message type.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidProgram` if workers are already running,
    /// or the subscription-storage error, in which case the workers are
    /// stopped again.
    pub async fn start(&self) -> Result<(), DomainError> {
        let endpoint = &self.endpoint;
        let started = {
            let mut workers = endpoint.workers();
            if !workers.is_empty() {
                return Err(DomainError::InvalidProgram("async bus already started".into()));
            }
            for _ in 0..endpoint.config.worker_count {
                let id = endpoint.next_worker_id.fetch_add(1, Ordering::Relaxed);
                let handle = tokio::spawn(run_worker(
                    Arc::clone(endpoint),
                    id,
                    endpoint.shutdown.subscribe(),
                ));
                workers.push(Worker { id, handle });
            }
            workers.len()
        };

        let message_types = endpoint.registry.message_types();
        if !message_types.is_empty() {
            let subscribed = endpoint
                .subscriptions
                .subscribe(&endpoint.config.input_address, message_types)
                .await;
            if let Err(error) = subscribed {
                tracing::error!(%error, "subscription failed; stopping workers");
                self.stop().await;
                return Err(error);
            }
        }
        tracing::info!(
            address = %endpoint.config.input_address,
            workers = started,
            subscriptions = message_types.len(),
            "async bus started"
        );
        Ok(())
    }

    /// Signals every worker to stop and waits for them to finish.
    pub async fn stop(&self) {
        self.endpoint.shutdown.send_replace(true);
        let workers: Vec<Worker> = self.endpoint.workers().drain(..).collect();
        for worker in workers {
            if let Err(error) = worker.handle.await {
                tracing::warn!(worker_id = worker.id, %error, "worker ended abnormally");
            }
        }
        self.endpoint.shutdown.send_replace(false);
        tracing::info!(address = %self.endpoint.config.input_address, "async bus stopped");
    }

    /// Removes this endpoint's subscriptions to `message_types`.
    ///
    /// # Errors
    ///
    /// Returns the subscription-storage error.
    pub async fn unsubscribe(&self, message_types: &[String]) -> Result<(), DomainError> {
        self.endpoint
            .subscriptions
            .unsubscribe(&self.endpoint.config.input_address, message_types)
            .await
    }

    /// Number of worker loops currently running.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.endpoint.workers().len()
    }

    /// This endpoint's input address.
    #[must_use]
    pub fn input_address(&self) -> &Address {
        &self.endpoint.config.input_address
    }

    /// Subscription keys of every message type this endpoint handles.
    #[must_use]
    pub fn message_types(&self) -> &[String] {
        self.endpoint.registry.message_types()
    }
}

#[async_trait]
impl MessageBus for AsyncBus {
    #[tracing::instrument(skip(self, message), fields(message_type = message.type_name()))]
    async fn publish(&self, message: Arc<dyn Message>) -> Result<(), DomainError> {
        let endpoint = &self.endpoint;
        let keys: Vec<String> = endpoint
            .types
            .lineage(&message)
            .into_iter()
            .map(|entry| entry.key)
            .collect();
        let addresses = endpoint
            .subscriptions
            .get_subscriber_addresses_for_message(&keys)
            .await?;
        if addresses.is_empty() {
            tracing::debug!("no subscribers");
            return Ok(());
        }
        for address in &addresses {
            let outgoing = endpoint.create_message(message.as_ref())?;
            endpoint.transport.send_message(&outgoing, address).await?;
            tracing::debug!(message_id = %outgoing.id, %address, "message sent");
        }
        Ok(())
    }
}
