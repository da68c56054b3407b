//! Logical type names.
//!
//! Persisted records and transport messages refer to aggregates, events and
//! snapshots by a stable logical name rather than by in-process type
//! identity. The [`TypeNameRegistry`] is populated once at startup and then
//! shared read-only behind an `Arc`.
//!
//! The registry also records the supertypes an event can be viewed as, which
//! is what makes handler lookup polymorphic: a handler registered for
//! `dyn AccountEvent` matches every event declared as an `AccountEvent`.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::aggregate::AggregateRoot;
use crate::bus::registry::MessageView;
use crate::error::DomainError;
use crate::event::{DomainEvent, Message};
use crate::snapshot::{SnapshotCapability, Snapshotable};

/// Which name mapping a type belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// Aggregate root types.
    AggregateRoot,
    /// Event payload types.
    Event,
    /// Snapshot payload types.
    Snapshot,
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::AggregateRoot => "aggregate root",
            Self::Event => "event",
            Self::Snapshot => "snapshot",
        };
        f.write_str(kind)
    }
}

#[derive(Debug, Default)]
struct NameMapping {
    by_name: HashMap<String, (TypeId, &'static str)>,
    by_type: HashMap<TypeId, String>,
}

type EncodeFn = fn(&dyn Message) -> Result<serde_json::Value, DomainError>;
type DecodeFn = fn(serde_json::Value) -> Result<Arc<dyn Message>, DomainError>;
type UpcastFn = Arc<dyn Fn(Arc<dyn Any + Send + Sync>) -> Option<MessageView> + Send + Sync>;

#[derive(Clone, Copy)]
struct EventCodec {
    encode: EncodeFn,
    decode: DecodeFn,
}

#[derive(Clone)]
struct Upcast {
    target: TypeId,
    key: &'static str,
    cast: UpcastFn,
}

/// One way of viewing a message, as produced by [`TypeNameRegistry::lineage`].
pub struct LineageEntry {
    /// Type the message is viewed as.
    pub type_id: TypeId,
    /// Subscription key of that type.
    pub key: String,
    /// The message, viewed as that type.
    pub view: MessageView,
}

/// Bidirectional mapping between logical names and concrete types.
#[derive(Default)]
pub struct TypeNameRegistry {
    mappings: HashMap<TypeKind, NameMapping>,
    codecs: HashMap<TypeId, EventCodec>,
    snapshot_capabilities: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    supertypes: HashMap<TypeId, Vec<Upcast>>,
}

impl fmt::Debug for TypeNameRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeNameRegistry")
            .field("mappings", &self.mappings)
            .field("snapshot_capabilities", &self.snapshot_capabilities.len())
            .finish_non_exhaustive()
    }
}

impl TypeNameRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a raw name/type pair in the given mapping.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::EmptyTypeName` for an empty name,
    /// `DomainError::DuplicateTypeName` if the name is taken and
    /// `DomainError::DuplicateType` if the type already has a name.
    pub fn register_mapping(
        &mut self,
        kind: TypeKind,
        name: &str,
        type_id: TypeId,
        type_name: &'static str,
    ) -> Result<(), DomainError> {
        if name.trim().is_empty() {
            return Err(DomainError::EmptyTypeName { kind });
        }
        let mapping = self.mappings.entry(kind).or_default();
        if mapping.by_name.contains_key(name) {
            return Err(DomainError::DuplicateTypeName {
                kind,
                name: name.to_owned(),
            });
        }
        if mapping.by_type.contains_key(&type_id) {
            return Err(DomainError::DuplicateType { kind, type_name });
        }
        mapping
            .by_name
            .insert(name.to_owned(), (type_id, type_name));
        mapping.by_type.insert(type_id, name.to_owned());
        tracing::debug!(%kind, name, type_name, "registered type name");
        Ok(())
    }

    /// Registers an aggregate root type.
    ///
    /// # Errors
    ///
    /// See [`TypeNameRegistry::register_mapping`].
    pub fn register_aggregate<A: AggregateRoot>(
        &mut self,
        name: &str,
    ) -> Result<&mut Self, DomainError> {
        self.register_mapping(
            TypeKind::AggregateRoot,
            name,
            TypeId::of::<A>(),
            std::any::type_name::<A>(),
        )?;
        Ok(self)
    }

    /// Registers a serializable event type together with its JSON codec.
    ///
    /// # Errors
    ///
    /// See [`TypeNameRegistry::register_mapping`].
    pub fn register_event<E>(&mut self, name: &str) -> Result<&mut Self, DomainError>
    where
        E: DomainEvent + Serialize + DeserializeOwned,
    {
        self.register_mapping(
            TypeKind::Event,
            name,
            TypeId::of::<E>(),
            std::any::type_name::<E>(),
        )?;
        self.codecs.insert(
            TypeId::of::<E>(),
            EventCodec {
                encode: encode_payload::<E>,
                decode: decode_payload::<E>,
            },
        );
        Ok(self)
    }

    /// Declares the snapshot capability of aggregate `A`, registering its
    /// snapshot payload type under `name`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::DuplicateSnapshotCapability` if `A` already
    /// declares one, otherwise see [`TypeNameRegistry::register_mapping`].
    pub fn register_snapshot<A: Snapshotable>(
        &mut self,
        name: &str,
    ) -> Result<&mut Self, DomainError> {
        if self.snapshot_capabilities.contains_key(&TypeId::of::<A>()) {
            return Err(DomainError::DuplicateSnapshotCapability {
                aggregate_type: std::any::type_name::<A>(),
            });
        }
        self.register_mapping(
            TypeKind::Snapshot,
            name,
            TypeId::of::<A::Snapshot>(),
            std::any::type_name::<A::Snapshot>(),
        )?;
        self.snapshot_capabilities.insert(
            TypeId::of::<A>(),
            Box::new(SnapshotCapability::<A>::declare(name)),
        );
        Ok(self)
    }

    /// Declares that event `M` can be viewed as `K`, usually a trait object
    /// such as `dyn AccountEvent`.
    ///
    /// ```ignore
    /// types.register_supertype::<Deposited, dyn AccountEvent>(|e| e);
    /// ```
    pub fn register_supertype<M, K>(&mut self, cast: fn(Arc<M>) -> Arc<K>) -> &mut Self
    where
        M: DomainEvent,
        K: ?Sized + Send + Sync + 'static,
    {
        let upcast = Upcast {
            target: TypeId::of::<K>(),
            key: std::any::type_name::<K>(),
            cast: Arc::new(move |any: Arc<dyn Any + Send + Sync>| {
                any.downcast::<M>()
                    .ok()
                    .map(|concrete| MessageView::interface::<K>(cast(concrete)))
            }),
        };
        let entries = self.supertypes.entry(TypeId::of::<M>()).or_default();
        entries.retain(|existing| existing.target != upcast.target);
        entries.push(upcast);
        self
    }

    /// Looks up the type registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::UnknownTypeName` if nothing is registered.
    pub fn get_type(&self, kind: TypeKind, name: &str) -> Result<TypeId, DomainError> {
        self.mappings
            .get(&kind)
            .and_then(|mapping| mapping.by_name.get(name))
            .map(|(type_id, _)| *type_id)
            .ok_or_else(|| DomainError::UnknownTypeName {
                kind,
                name: name.to_owned(),
            })
    }

    /// Looks up the name registered for `type_id`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::UnregisteredType` if the type has no name.
    pub fn get_name(
        &self,
        kind: TypeKind,
        type_id: TypeId,
        type_name: &'static str,
    ) -> Result<&str, DomainError> {
        self.find_name(kind, type_id)
            .ok_or(DomainError::UnregisteredType { kind, type_name })
    }

    /// Returns `true` if `type_id` has a name in the given mapping.
    #[must_use]
    pub fn is_type_registered(&self, kind: TypeKind, type_id: TypeId) -> bool {
        self.find_name(kind, type_id).is_some()
    }

    /// Returns `true` if `name` is taken in the given mapping.
    #[must_use]
    pub fn is_name_registered(&self, kind: TypeKind, name: &str) -> bool {
        self.mappings
            .get(&kind)
            .is_some_and(|mapping| mapping.by_name.contains_key(name))
    }

    /// Logical name of aggregate type `A`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::UnregisteredType` if `A` was never registered.
    pub fn aggregate_name<A: 'static>(&self) -> Result<&str, DomainError> {
        self.get_name(
            TypeKind::AggregateRoot,
            TypeId::of::<A>(),
            std::any::type_name::<A>(),
        )
    }

    /// Serializes a payload into its logical event name and JSON data.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::UnregisteredType` if the payload type has no
    /// codec, or `DomainError::Serialization` if encoding fails.
    pub fn encode_event(
        &self,
        payload: &dyn Message,
    ) -> Result<(String, serde_json::Value), DomainError> {
        let type_id = payload.as_any().type_id();
        let name = self.get_name(TypeKind::Event, type_id, payload.type_name())?;
        let codec = self.codecs.get(&type_id).ok_or(DomainError::UnregisteredType {
            kind: TypeKind::Event,
            type_name: payload.type_name(),
        })?;
        Ok((name.to_owned(), (codec.encode)(payload)?))
    }

    /// Deserializes JSON data registered under the logical event `name`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::UnknownTypeName` for an unknown name, or
    /// `DomainError::Serialization` if decoding fails.
    pub fn decode_event(
        &self,
        name: &str,
        data: serde_json::Value,
    ) -> Result<Arc<dyn Message>, DomainError> {
        let type_id = self.get_type(TypeKind::Event, name)?;
        let codec = self
            .codecs
            .get(&type_id)
            .ok_or_else(|| DomainError::UnknownTypeName {
                kind: TypeKind::Event,
                name: name.to_owned(),
            })?;
        (codec.decode)(data)
    }

    /// Snapshot capability declared by aggregate `A`, if any.
    #[must_use]
    pub fn snapshot_capability<A: AggregateRoot>(&self) -> Option<&SnapshotCapability<A>> {
        self.snapshot_capabilities
            .get(&TypeId::of::<A>())
            .and_then(|capability| capability.downcast_ref::<SnapshotCapability<A>>())
    }

    /// Subscription key of a handled message type: the logical event name
    /// when one is registered, the Rust type name otherwise.
    #[must_use]
    pub fn message_key(&self, type_id: TypeId, type_name: &'static str) -> String {
        self.find_name(TypeKind::Event, type_id)
            .map_or_else(|| type_name.to_owned(), ToOwned::to_owned)
    }

    /// Every type `message` can be dispatched as: its concrete type, each
    /// declared supertype, and finally `dyn Message`.
    #[must_use]
    pub fn lineage(&self, message: &Arc<dyn Message>) -> Vec<LineageEntry> {
        let concrete = message.payload_type_id();
        let mut entries = vec![LineageEntry {
            type_id: concrete,
            key: self.message_key(concrete, message.type_name()),
            view: MessageView::concrete(Arc::clone(message)),
        }];
        for upcast in self.supertypes.get(&concrete).into_iter().flatten() {
            if let Some(view) = (upcast.cast)(Arc::clone(message).into_any()) {
                entries.push(LineageEntry {
                    type_id: upcast.target,
                    key: upcast.key.to_owned(),
                    view,
                });
            }
        }
        entries.push(LineageEntry {
            type_id: TypeId::of::<dyn Message>(),
            key: std::any::type_name::<dyn Message>().to_owned(),
            view: MessageView::interface::<dyn Message>(Arc::clone(message)),
        });
        entries
    }

    fn find_name(&self, kind: TypeKind, type_id: TypeId) -> Option<&str> {
        self.mappings
            .get(&kind)
            .and_then(|mapping| mapping.by_type.get(&type_id))
            .map(String::as_str)
    }
}

fn encode_payload<E: DomainEvent + Serialize>(
    payload: &dyn Message,
) -> Result<serde_json::Value, DomainError> {
    let event = payload.as_any().downcast_ref::<E>().ok_or_else(|| {
        DomainError::InvalidProgram(format!(
            "codec for {} received a {}",
            std::any::type_name::<E>(),
            payload.type_name()
        ))
    })?;
    Ok(serde_json::to_value(event)?)
}

fn decode_payload<E: DomainEvent + DeserializeOwned>(
    data: serde_json::Value,
) -> Result<Arc<dyn Message>, DomainError> {
    let event: E = serde_json::from_value(data)?;
    Ok(Arc::new(event))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Opened {
        owner: String,
    }
    impl DomainEvent for Opened {}

    #[derive(Debug, Serialize, Deserialize)]
    struct Closed;
    impl DomainEvent for Closed {}

    trait Lifecycle: Send + Sync {
        fn label(&self) -> &'static str;
    }
    impl Lifecycle for Opened {
        fn label(&self) -> &'static str {
            "opened"
        }
    }

    #[test]
    fn test_register_mapping_rejects_empty_name() {
        let mut types = TypeNameRegistry::new();

        let result = types.register_event::<Opened>("  ");

        assert!(matches!(
            result,
            Err(DomainError::EmptyTypeName {
                kind: TypeKind::Event
            })
        ));
    }

    #[test]
    fn test_register_mapping_rejects_duplicate_name_and_duplicate_type() {
        // Arrange
        let mut types = TypeNameRegistry::new();
        types.register_event::<Opened>("account.opened").unwrap();

        // Act
        let same_name = types
            .register_event::<Closed>("account.opened")
            .map(|_| ());
        let same_type = types
            .register_event::<Opened>("account.reopened")
            .map(|_| ());

        // Assert
        assert!(matches!(same_name, Err(DomainError::DuplicateTypeName { .. })));
        assert!(matches!(same_type, Err(DomainError::DuplicateType { .. })));
    }

    #[test]
    fn test_the_same_name_may_be_used_in_different_kinds() {
        let mut types = TypeNameRegistry::new();
        types
            .register_mapping(TypeKind::Event, "account", TypeId::of::<Opened>(), "Opened")
            .unwrap();

        let result = types.register_mapping(
            TypeKind::Snapshot,
            "account",
            TypeId::of::<Closed>(),
            "Closed",
        );

        assert!(result.is_ok());
        assert!(types.is_name_registered(TypeKind::Snapshot, "account"));
    }

    #[test]
    fn test_lookups_fail_for_unknown_names_and_types() {
        let types = TypeNameRegistry::new();

        assert!(matches!(
            types.get_type(TypeKind::Event, "nope"),
            Err(DomainError::UnknownTypeName { .. })
        ));
        assert!(matches!(
            types.get_name(TypeKind::Event, TypeId::of::<Opened>(), "Opened"),
            Err(DomainError::UnregisteredType { .. })
        ));
    }

    #[test]
    fn test_encode_then_decode_event_through_its_logical_name() {
        // Arrange
        let mut types = TypeNameRegistry::new();
        types.register_event::<Opened>("account.opened").unwrap();
        let payload = Opened {
            owner: "ada".into(),
        };

        // Act
        let (name, data) = types.encode_event(&payload).unwrap();
        let decoded = types.decode_event(&name, data).unwrap();

        // Assert
        assert_eq!(name, "account.opened");
        assert_eq!(decoded.downcast_ref::<Opened>(), Some(&payload));
    }

    #[test]
    fn test_lineage_lists_concrete_type_then_supertypes_then_catch_all() {
        // Arrange
        let mut types = TypeNameRegistry::new();
        types.register_event::<Opened>("account.opened").unwrap();
        types.register_supertype::<Opened, dyn Lifecycle>(|e| e);
        let message: Arc<dyn Message> = Arc::new(Opened {
            owner: "ada".into(),
        });

        // Act
        let lineage = types.lineage(&message);

        // Assert
        let ids: Vec<TypeId> = lineage.iter().map(|entry| entry.type_id).collect();
        assert_eq!(
            ids,
            vec![
                TypeId::of::<Opened>(),
                TypeId::of::<dyn Lifecycle>(),
                TypeId::of::<dyn Message>()
            ]
        );
        assert_eq!(lineage[0].key, "account.opened");
        let as_lifecycle = lineage
            .into_iter()
            .nth(1)
            .and_then(|entry| entry.view.into_interface::<dyn Lifecycle>())
            .unwrap();
        assert_eq!(as_lifecycle.label(), "opened");
    }
}
