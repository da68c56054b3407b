//! Aggregate root abstraction.
//!
//! An aggregate's state changes only by applying events. Each aggregate type
//! declares an explicit transition table mapping event types to handler
//! closures; the table is built once per type and cached for the life of
//! the process.

use std::any::{Any, TypeId};
use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::DomainHandlers;
use crate::error::DomainError;
use crate::event::{AggregateRootEvent, DomainEvent, Message};

/// Identity, version and pending events shared by every aggregate root.
#[derive(Debug, Clone, Default)]
pub struct AggregateCore {
    id: Option<String>,
    original_version: u64,
    pending: VecDeque<AggregateRootEvent>,
}

impl AggregateCore {
    /// Creates the core of a new aggregate with the given id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Returns the aggregate id, if assigned.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Returns the version as of the last load or commit.
    #[must_use]
    pub fn original_version(&self) -> u64 {
        self.original_version
    }

    /// Returns the events raised since the last drain.
    #[must_use]
    pub fn pending_events(&self) -> &VecDeque<AggregateRootEvent> {
        &self.pending
    }

    pub(crate) fn set_original_version(&mut self, version: u64) {
        self.original_version = version;
    }
}

type TransitionFn<A> = Box<dyn Fn(&mut A, &dyn Any) -> Result<(), DomainError> + Send + Sync>;

/// Per-aggregate table of event-application handlers.
pub struct Transitions<A> {
    handlers: HashMap<TypeId, TransitionFn<A>>,
}

impl<A: AggregateRoot> Transitions<A> {
    fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Applies events of type `E` with `handler`.
    pub fn on<E, F>(&mut self, handler: F) -> &mut Self
    where
        E: DomainEvent,
        F: Fn(&mut A, &E) + Send + Sync + 'static,
    {
        let transition: TransitionFn<A> = Box::new(move |aggregate: &mut A, event: &dyn Any| {
            if let Some(event) = event.downcast_ref::<E>() {
                handler(aggregate, event);
            }
            Ok(())
        });
        self.handlers.insert(TypeId::of::<E>(), transition);
        self
    }

    /// Applies events of type `E` by copying every field of the event onto
    /// the field of the aggregate with the same name.
    ///
    /// Fields present only on the aggregate keep their values.
    pub fn copy_fields<E>(&mut self) -> &mut Self
    where
        E: DomainEvent + Serialize,
        A: Serialize + DeserializeOwned,
    {
        let transition: TransitionFn<A> = Box::new(|aggregate: &mut A, event: &dyn Any| {
            let Some(event) = event.downcast_ref::<E>() else {
                return Ok(());
            };
            let serde_json::Value::Object(fields) = serde_json::to_value(event)? else {
                return Ok(());
            };
            let mut state = serde_json::to_value(&*aggregate)?;
            if let serde_json::Value::Object(target) = &mut state {
                for (name, value) in fields {
                    if target.contains_key(&name) {
                        target.insert(name, value);
                    }
                }
            }
            let mut next: A = serde_json::from_value(state)?;
            std::mem::swap(next.core_mut(), aggregate.core_mut());
            *aggregate = next;
            Ok(())
        });
        self.handlers.insert(TypeId::of::<E>(), transition);
        self
    }

    fn apply(&self, aggregate: &mut A, event: &dyn Message) -> Result<(), DomainError> {
        match self.handlers.get(&event.payload_type_id()) {
            Some(handler) => handler(aggregate, event.as_any()),
            None => {
                tracing::trace!(
                    aggregate = std::any::type_name::<A>(),
                    event = event.type_name(),
                    "no transition registered; state unchanged"
                );
                Ok(())
            }
        }
    }
}

/// Per-aggregate table of roles the aggregate can act as.
pub struct Roles<A> {
    casts: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: AggregateRoot> Roles<A> {
    fn new() -> Self {
        Self {
            casts: HashMap::new(),
            _aggregate: PhantomData,
        }
    }

    /// Declares that the aggregate can act as `R`.
    ///
    /// ```ignore
    /// roles.play::<dyn Payer>(|a| a, |a| a);
    /// ```
    pub fn play<R: ?Sized + 'static>(
        &mut self,
        cast: fn(&A) -> &R,
        cast_mut: fn(&mut A) -> &mut R,
    ) -> &mut Self {
        self.casts
            .insert(TypeId::of::<R>(), Box::new(RoleCast { cast, cast_mut }));
        self
    }

    fn get<R: ?Sized + 'static>(&self) -> Option<&RoleCast<A, R>> {
        self.casts
            .get(&TypeId::of::<R>())
            .and_then(|cast| cast.downcast_ref::<RoleCast<A, R>>())
    }
}

struct RoleCast<A, R: ?Sized> {
    cast: fn(&A) -> &R,
    cast_mut: fn(&mut A) -> &mut R,
}

struct Behavior<A> {
    transitions: Transitions<A>,
    roles: Roles<A>,
}

fn behavior<A: AggregateRoot>() -> Arc<Behavior<A>> {
    static CACHE: OnceLock<RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>> =
        OnceLock::new();
    let cache = CACHE.get_or_init(|| RwLock::new(HashMap::new()));
    let key = TypeId::of::<A>();

    let cached = cache
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .get(&key)
        .cloned();
    if let Some(found) = cached.and_then(|entry| entry.downcast::<Behavior<A>>().ok()) {
        return found;
    }

    let mut transitions = Transitions::new();
    A::register_transitions(&mut transitions);
    let mut roles = Roles::new();
    A::register_roles(&mut roles);
    let built = Arc::new(Behavior { transitions, roles });

    let mut cache = cache
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let entry = cache
        .entry(key)
        .or_insert_with(|| Arc::clone(&built) as Arc<dyn Any + Send + Sync>);
    Arc::clone(entry).downcast::<Behavior<A>>().unwrap_or(built)
}

/// Trait for aggregate roots that reconstitute from event history.
///
/// `Default` is the parameterless factory used when rebuilding from events or
/// snapshots; domain constructors assign an id with [`AggregateCore::new`]
/// and raise a creation event.
pub trait AggregateRoot: Default + Send + Sync + 'static {
    /// Returns the shared aggregate state.
    fn core(&self) -> &AggregateCore;

    /// Returns the shared aggregate state mutably.
    fn core_mut(&mut self) -> &mut AggregateCore;

    /// Declares how each event type changes the aggregate's state.
    fn register_transitions(transitions: &mut Transitions<Self>);

    /// Declares the roles the aggregate can act as.
    fn register_roles(_roles: &mut Roles<Self>) {}

    /// Declares handlers this aggregate runs when other aggregates raise
    /// events during a cascade.
    fn register_domain_handlers(_handlers: &mut DomainHandlers<Self>) {}

    /// Returns the aggregate identifier.
    fn id(&self) -> Option<&str> {
        self.core().id()
    }

    /// Returns the version as of the last load or commit.
    fn original_version(&self) -> u64 {
        self.core().original_version()
    }

    /// Returns events raised but not yet drained by a unit of work.
    fn uncommitted_events(&self) -> &VecDeque<AggregateRootEvent> {
        self.core().pending_events()
    }

    /// Applies `event` to the aggregate and queues it for persistence.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::MissingAggregateId` if the id is unset, or any
    /// error raised by the transition handler.
    fn on_event<E: DomainEvent>(&mut self, event: E) -> Result<(), DomainError> {
        let Some(id) = self.id().map(ToOwned::to_owned) else {
            return Err(DomainError::MissingAggregateId {
                aggregate_type: std::any::type_name::<Self>(),
            });
        };
        let payload: Arc<dyn Message> = Arc::new(event);
        behavior::<Self>().transitions.apply(self, payload.as_ref())?;
        tracing::trace!(
            aggregate = std::any::type_name::<Self>(),
            aggregate_id = %id,
            event = payload.type_name(),
            "event raised"
        );
        self.core_mut()
            .pending
            .push_back(AggregateRootEvent::raised::<Self>(id, payload));
        Ok(())
    }

    /// Rebuilds state from persisted events without queueing them again.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidEventVersion` on a version gap and
    /// `DomainError::ForeignEvent` for an event raised by another aggregate.
    fn replay_events(&mut self, events: &[AggregateRootEvent]) -> Result<(), DomainError> {
        self.core_mut().pending.clear();
        let behavior = behavior::<Self>();
        for event in events {
            verify_continuity::<Self>(self.core(), event)?;
            if self.core().original_version == 0 {
                self.core_mut().id = Some(event.aggregate_root_id.clone());
            }
            behavior.transitions.apply(self, event.payload.as_ref())?;
            self.core_mut().original_version = event.version;
        }
        Ok(())
    }

    /// Sets id and version from a snapshot envelope and resets the pending
    /// queue. The payload itself is applied by the snapshot restore hook.
    fn initialize_from_snapshot(&mut self, id: &str, version: u64) {
        let core = self.core_mut();
        core.id = Some(id.to_owned());
        core.original_version = version;
        core.pending = VecDeque::new();
    }

    /// Drains the pending events, preserving their order.
    fn pop_events(&mut self) -> Vec<AggregateRootEvent> {
        self.core_mut().pending.drain(..).collect()
    }

    /// Views the aggregate as role `R`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::RoleMismatch` if the aggregate never declared
    /// the role.
    fn act_as<R: ?Sized + 'static>(&self) -> Result<&R, DomainError> {
        let behavior = behavior::<Self>();
        let cast = behavior.roles.get::<R>().ok_or_else(role_mismatch::<Self, R>)?.cast;
        Ok(cast(self))
    }

    /// Views the aggregate mutably as role `R`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::RoleMismatch` if the aggregate never declared
    /// the role.
    fn act_as_mut<R: ?Sized + 'static>(&mut self) -> Result<&mut R, DomainError> {
        let behavior = behavior::<Self>();
        let cast = behavior
            .roles
            .get::<R>()
            .ok_or_else(role_mismatch::<Self, R>)?
            .cast_mut;
        Ok(cast(self))
    }
}

fn role_mismatch<A, R: ?Sized>() -> DomainError {
    DomainError::RoleMismatch {
        aggregate_type: std::any::type_name::<A>(),
        role: std::any::type_name::<R>(),
    }
}

fn verify_continuity<A: 'static>(
    core: &AggregateCore,
    event: &AggregateRootEvent,
) -> Result<(), DomainError> {
    let current = core.original_version;
    let aggregate_id = core.id.clone().unwrap_or_default();
    if event.aggregate_root_type != TypeId::of::<A>() {
        return Err(DomainError::ForeignEvent {
            aggregate_id,
            event_aggregate: format!(
                "{}/{}",
                event.aggregate_root_type_name, event.aggregate_root_id
            ),
        });
    }
    if current > 0 && core.id.as_deref() != Some(event.aggregate_root_id.as_str()) {
        return Err(DomainError::ForeignEvent {
            aggregate_id,
            event_aggregate: event.aggregate_root_id.clone(),
        });
    }
    if event.version == 0 || event.version != current + 1 {
        return Err(DomainError::InvalidEventVersion {
            aggregate_id,
            current,
            actual: event.version,
        });
    }
    Ok(())
}
