//! Domain handlers: aggregates reacting to events raised by other
//! aggregates during a unit-of-work cascade.
//!
//! An aggregate declares, per event type, a [`NavigationPath`] leading from
//! the event to the id of the aggregate instance that should react, and the
//! handler to run on it. The path may hop through intermediate aggregates;
//! only the final target is optionally loaded under a stream lock.
//!
//! Handlers may also be declared for a supertype registered with
//! [`TypeNameRegistry::register_supertype`]; they then react to every event
//! declared as that supertype.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use crate::aggregate::AggregateRoot;
use crate::bus::{HandledType, HandlerRegistry, MessageView};
use crate::error::DomainError;
use crate::event::{DomainEvent, Message};
use crate::repository::Repository;
use crate::types::TypeNameRegistry;
use crate::unit_of_work::UnitOfWork;

type ResolveFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<String>, DomainError>> + Send + 'a>>;

type Resolve<E> = Arc<
    dyn for<'a> Fn(&'a Repository, &'a UnitOfWork, &'a E) -> ResolveFuture<'a> + Send + Sync,
>;

/// Future returned by an erased domain handler.
pub type DomainHandlerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(), DomainError>> + Send + 'a>>;

type DomainHandlerFn = Arc<
    dyn for<'a> Fn(&'a Repository, &'a UnitOfWork, MessageView) -> DomainHandlerFuture<'a>
        + Send
        + Sync,
>;

/// How to get from an event `E` to the id of an aggregate `T`.
///
/// Every step returns `Option<String>`; `None` at any step means the event
/// does not concern any `T` and the handler is skipped.
pub struct NavigationPath<E: ?Sized, T> {
    resolve: Resolve<E>,
    _target: PhantomData<fn() -> T>,
}

impl<E: ?Sized + Send + Sync + 'static, T> NavigationPath<E, T> {
    /// Reads the target id directly from the event.
    pub fn from_event<F>(extract: F) -> Self
    where
        F: Fn(&E) -> Option<String> + Send + Sync + 'static,
    {
        Self::with_resolver(move |_, _, event| {
            let id = extract(event);
            Box::pin(async move { Ok(id) })
        })
    }

    fn with_resolver<F>(resolve: F) -> Self
    where
        F: for<'a> Fn(&'a Repository, &'a UnitOfWork, &'a E) -> ResolveFuture<'a>
            + Send
            + Sync
            + 'static,
    {
        Self {
            resolve: Arc::new(resolve),
            _target: PhantomData,
        }
    }
}

impl<E: ?Sized + Send + Sync + 'static, T: AggregateRoot> NavigationPath<E, T> {
    /// Loads the `T` this path leads to and reads the id of the next
    /// aggregate `U` from it.
    #[must_use]
    pub fn then<U, F>(self, extract: F) -> NavigationPath<E, U>
    where
        F: Fn(&T) -> Option<String> + Send + Sync + 'static,
    {
        let previous = self.resolve;
        let extract = Arc::new(extract);
        NavigationPath::with_resolver(move |repository, unit_of_work, event| {
            let previous = Arc::clone(&previous);
            let extract = Arc::clone(&extract);
            Box::pin(async move {
                let Some(id) = previous(repository, unit_of_work, event).await? else {
                    return Ok(None);
                };
                let Some(hop) = repository.get_by_id::<T>(unit_of_work, &id).await? else {
                    tracing::trace!(
                        aggregate = std::any::type_name::<T>(),
                        aggregate_id = %id,
                        "navigation hop not found"
                    );
                    return Ok(None);
                };
                let next = extract(&*hop.lock());
                Ok(next)
            })
        })
    }
}

/// A registered domain handler.
pub struct DomainHandlerMetaData {
    /// Rust type name of the reacting aggregate.
    pub subscriber_type: &'static str,
    /// Rust type name of the handled event.
    pub message_type: &'static str,
    /// Whether the target aggregate is loaded under a stream lock.
    pub get_with_lock: bool,
    handler: DomainHandlerFn,
}

/// Collects the domain handlers declared by aggregate type `A`.
pub struct DomainHandlers<A> {
    declared: Vec<(HandledType, DomainHandlerMetaData)>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: AggregateRoot> DomainHandlers<A> {
    fn new() -> Self {
        Self {
            declared: Vec::new(),
            _aggregate: PhantomData,
        }
    }

    /// Runs `handler` on the aggregate `path` leads to whenever an `E` is
    /// raised during a cascade.
    pub fn on<E, F>(&mut self, path: NavigationPath<E, A>, handler: F) -> &mut Self
    where
        E: DomainEvent,
        F: Fn(&mut A, &E) -> Result<(), DomainError> + Send + Sync + 'static,
    {
        self.declare(path, handler, false, MessageView::into_concrete::<E>)
    }

    /// Like [`DomainHandlers::on`], loading the target under a stream lock.
    pub fn on_with_lock<E, F>(&mut self, path: NavigationPath<E, A>, handler: F) -> &mut Self
    where
        E: DomainEvent,
        F: Fn(&mut A, &E) -> Result<(), DomainError> + Send + Sync + 'static,
    {
        self.declare(path, handler, true, MessageView::into_concrete::<E>)
    }

    /// Runs `handler` whenever an event declared as a `K` is raised.
    pub fn on_any<K, F>(&mut self, path: NavigationPath<K, A>, handler: F) -> &mut Self
    where
        K: ?Sized + Send + Sync + 'static,
        F: Fn(&mut A, &K) -> Result<(), DomainError> + Send + Sync + 'static,
    {
        self.declare(path, handler, false, MessageView::into_interface::<K>)
    }

    /// Like [`DomainHandlers::on_any`], loading the target under a stream
    /// lock.
    pub fn on_any_with_lock<K, F>(&mut self, path: NavigationPath<K, A>, handler: F) -> &mut Self
    where
        K: ?Sized + Send + Sync + 'static,
        F: Fn(&mut A, &K) -> Result<(), DomainError> + Send + Sync + 'static,
    {
        self.declare(path, handler, true, MessageView::into_interface::<K>)
    }

    fn declare<E, F>(
        &mut self,
        path: NavigationPath<E, A>,
        handler: F,
        get_with_lock: bool,
        extract: fn(MessageView) -> Option<Arc<E>>,
    ) -> &mut Self
    where
        E: ?Sized + Send + Sync + 'static,
        F: Fn(&mut A, &E) -> Result<(), DomainError> + Send + Sync + 'static,
    {
        let resolve = path.resolve;
        let handler = Arc::new(handler);
        let erased = erase(move |repository, unit_of_work, view| {
            Box::pin(run_handler::<A, E, F>(
                repository,
                unit_of_work,
                view,
                extract,
                Arc::clone(&resolve),
                Arc::clone(&handler),
                get_with_lock,
            ))
        });
        self.declared.push((
            HandledType::of::<E>(),
            DomainHandlerMetaData {
                subscriber_type: std::any::type_name::<A>(),
                message_type: std::any::type_name::<E>(),
                get_with_lock,
                handler: erased,
            },
        ));
        self
    }
}

fn erase<F>(handler: F) -> DomainHandlerFn
where
    F: for<'a> Fn(&'a Repository, &'a UnitOfWork, MessageView) -> DomainHandlerFuture<'a>
        + Send
        + Sync
        + 'static,
{
    Arc::new(handler)
}

async fn run_handler<A, E, F>(
    repository: &Repository,
    unit_of_work: &UnitOfWork,
    view: MessageView,
    extract: fn(MessageView) -> Option<Arc<E>>,
    resolve: Resolve<E>,
    handler: Arc<F>,
    get_with_lock: bool,
) -> Result<(), DomainError>
where
    A: AggregateRoot,
    E: ?Sized + Send + Sync + 'static,
    F: Fn(&mut A, &E) -> Result<(), DomainError> + Send + Sync,
{
    let event = extract(view).ok_or_else(|| {
        DomainError::InvalidProgram(format!(
            "domain handler view does not hold a {}",
            std::any::type_name::<E>()
        ))
    })?;
    let Some(id) = resolve(repository, unit_of_work, &*event).await? else {
        tracing::trace!(
            aggregate = std::any::type_name::<A>(),
            event = std::any::type_name::<E>(),
            "event does not concern any aggregate"
        );
        return Ok(());
    };
    let target = if get_with_lock {
        repository.get_by_id_with_lock::<A>(unit_of_work, &id).await?
    } else {
        repository.get_by_id::<A>(unit_of_work, &id).await?
    };
    let Some(target) = target else {
        tracing::error!(
            aggregate = std::any::type_name::<A>(),
            aggregate_id = %id,
            event = std::any::type_name::<E>(),
            "domain handler target not found; skipped"
        );
        return Ok(());
    };
    let mut aggregate = target.lock();
    handler(&mut *aggregate, &*event)
}

/// Domain handlers of every registered aggregate type, looked up
/// polymorphically like bus handlers.
pub struct DomainHandlerRegistry {
    registry: HandlerRegistry<DomainHandlerMetaData>,
}

impl DomainHandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(types: Arc<TypeNameRegistry>) -> Self {
        Self {
            registry: HandlerRegistry::new(types),
        }
    }

    /// Registers the domain handlers declared by aggregate `A`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidProgram` if `A` declares none.
    pub fn register<A: AggregateRoot>(&mut self) -> Result<&mut Self, DomainError> {
        let mut handlers = DomainHandlers::<A>::new();
        A::register_domain_handlers(&mut handlers);
        if handlers.declared.is_empty() {
            return Err(DomainError::InvalidProgram(format!(
                "{} declares no domain handler",
                std::any::type_name::<A>()
            )));
        }
        let count = handlers.declared.len();
        for (handled, metadata) in handlers.declared {
            self.registry.register(handled, metadata);
        }
        tracing::debug!(
            aggregate = std::any::type_name::<A>(),
            handlers = count,
            "domain handlers registered"
        );
        Ok(self)
    }

    /// Number of registered domain handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Returns `true` if no domain handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Runs every domain handler matching `message`, in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first handler or repository error.
    pub(crate) async fn dispatch(
        &self,
        repository: &Repository,
        unit_of_work: &UnitOfWork,
        message: &Arc<dyn Message>,
    ) -> Result<(), DomainError> {
        for (metadata, view) in self.registry.handlers_for(message) {
            tracing::trace!(
                aggregate = metadata.subscriber_type,
                event = metadata.message_type,
                locked = metadata.get_with_lock,
                "running domain handler"
            );
            (metadata.handler)(repository, unit_of_work, view).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::aggregate::{AggregateCore, Transitions};
    use crate::bus::SyncBus;
    use crate::clock::SystemClock;
    use crate::memory::{InMemoryEventStore, InMemorySnapshotStore};
    use crate::store::Outcome;
    use crate::unit_of_work::UnitOfWorkServices;

    trait Measured: Send + Sync {
        fn value(&self) -> i64;
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Metered {
        value: i64,
    }
    impl DomainEvent for Metered {}

    impl Measured for Metered {
        fn value(&self) -> i64 {
            self.value
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Totalled {
        value: i64,
    }
    impl DomainEvent for Totalled {}

    #[derive(Debug, Default)]
    struct Meter {
        core: AggregateCore,
    }

    impl AggregateRoot for Meter {
        fn core(&self) -> &AggregateCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut AggregateCore {
            &mut self.core
        }

        fn register_transitions(_transitions: &mut Transitions<Self>) {}
    }

    #[derive(Debug, Default)]
    struct Board {
        core: AggregateCore,
        total: i64,
    }

    impl AggregateRoot for Board {
        fn core(&self) -> &AggregateCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut AggregateCore {
            &mut self.core
        }

        fn register_transitions(transitions: &mut Transitions<Self>) {
            transitions.on(|board: &mut Self, event: &Totalled| board.total += event.value);
        }

        fn register_domain_handlers(handlers: &mut DomainHandlers<Self>) {
            handlers.on_any(
                NavigationPath::<dyn Measured, Self>::from_event(|_| Some("board".to_owned())),
                |board, measured| {
                    board.on_event(Totalled {
                        value: measured.value(),
                    })
                },
            );
        }
    }

    fn unit_of_work() -> UnitOfWork {
        let mut types = TypeNameRegistry::new();
        types
            .register_aggregate::<Meter>("meter")
            .unwrap()
            .register_aggregate::<Board>("board")
            .unwrap()
            .register_event::<Metered>("meter.metered")
            .unwrap()
            .register_event::<Totalled>("board.totalled")
            .unwrap()
            .register_supertype::<Metered, dyn Measured>(|event| event);
        let types = Arc::new(types);
        let mut domain_handlers = DomainHandlerRegistry::new(Arc::clone(&types));
        domain_handlers.register::<Board>().unwrap();
        UnitOfWork::new(UnitOfWorkServices {
            repository: Arc::new(Repository::new(
                Arc::clone(&types),
                Arc::new(InMemoryEventStore::new()),
                Arc::new(InMemorySnapshotStore::new()),
                Arc::new(SystemClock),
            )),
            domain_handlers: Arc::new(domain_handlers),
            sync_bus: Arc::new(SyncBus::new(types)),
        })
    }

    #[tokio::test]
    async fn test_handler_for_a_supertype_reacts_to_its_subtypes() {
        // Arrange
        let uow = unit_of_work();
        let repository = Arc::clone(uow.repository());
        let meter = repository
            .add(
                &uow,
                Meter {
                    core: AggregateCore::new("m-1"),
                },
            )
            .unwrap();
        let board = repository
            .add(
                &uow,
                Board {
                    core: AggregateCore::new("board"),
                    ..Board::default()
                },
            )
            .unwrap();
        meter.lock().on_event(Metered { value: 3 }).unwrap();
        meter.lock().on_event(Metered { value: 4 }).unwrap();

        // Act
        let processed = uow.submit_changes().await.unwrap();

        // Assert
        assert_eq!(board.lock().total, 7);
        assert_eq!(board.lock().original_version(), 2);
        assert_eq!(processed.len(), 4);
        uow.dispose(Outcome::Committed).await.unwrap();
    }

    #[test]
    fn test_aggregate_without_domain_handlers_is_rejected() {
        let mut registry = DomainHandlerRegistry::new(Arc::new(TypeNameRegistry::new()));

        let result = registry.register::<Meter>().map(|_| ());

        assert!(matches!(result, Err(DomainError::InvalidProgram(_))));
        assert!(registry.is_empty());
    }
}
