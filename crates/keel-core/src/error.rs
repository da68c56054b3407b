//! Domain error types.

use thiserror::Error;

use crate::bus::transport::TransportError;
use crate::types::TypeKind;

/// How the engine expects callers to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// A data or programming invariant was violated. Never retried.
    Fatal,
    /// A collaborator or domain rule failed. Propagated to the enclosing
    /// transaction so it can roll back.
    Propagate,
}

/// Top-level domain error type.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An event was raised, or an aggregate tracked, before its id was set.
    #[error("aggregate {aggregate_type} has no id")]
    MissingAggregateId {
        /// Rust type name of the aggregate.
        aggregate_type: &'static str,
    },

    /// A replayed event does not continue the aggregate's version sequence.
    #[error(
        "event version {actual} cannot follow version {current} on aggregate {aggregate_id}"
    )]
    InvalidEventVersion {
        /// Aggregate being replayed.
        aggregate_id: String,
        /// Version of the aggregate before the event.
        current: u64,
        /// Version carried by the event.
        actual: u64,
    },

    /// A replayed event belongs to another aggregate.
    #[error("event for aggregate {event_aggregate} cannot be replayed on aggregate {aggregate_id}")]
    ForeignEvent {
        /// Aggregate being replayed.
        aggregate_id: String,
        /// Aggregate the event was raised by.
        event_aggregate: String,
    },

    /// A repository operation ran without a live unit of work.
    #[error("no active unit of work")]
    NoActiveUnitOfWork,

    /// A snapshot failed its validity check.
    #[error("invalid snapshot for aggregate {aggregate_root_name}/{aggregate_root_id}")]
    InvalidSnapshot {
        /// Aggregate name recorded in the snapshot.
        aggregate_root_name: String,
        /// Aggregate id recorded in the snapshot.
        aggregate_root_id: String,
    },

    /// A snapshot does not fit the aggregate it is restored into.
    #[error("snapshot type mismatch: expected {expected}, found {actual}")]
    SnapshotTypeMismatch {
        /// Name the aggregate declares.
        expected: String,
        /// Name recorded in the snapshot.
        actual: String,
    },

    /// The aggregate declares no snapshot capability.
    #[error("aggregate {aggregate_type} has no snapshot capability")]
    MissingSnapshotCapability {
        /// Rust type name of the aggregate.
        aggregate_type: &'static str,
    },

    /// The aggregate declares more than one snapshot capability.
    #[error("aggregate {aggregate_type} declares more than one snapshot capability")]
    DuplicateSnapshotCapability {
        /// Rust type name of the aggregate.
        aggregate_type: &'static str,
    },

    /// `act_as` asked for a role the aggregate does not play.
    #[error("aggregate {aggregate_type} cannot act as {role}")]
    RoleMismatch {
        /// Rust type name of the aggregate.
        aggregate_type: &'static str,
        /// Rust type name of the requested role.
        role: &'static str,
    },

    /// A logical name was registered twice.
    #[error("{kind} name '{name}' is already registered")]
    DuplicateTypeName {
        /// Mapping the name was registered in.
        kind: TypeKind,
        /// The duplicated name.
        name: String,
    },

    /// A type was registered twice under different names.
    #[error("{kind} type {type_name} is already registered")]
    DuplicateType {
        /// Mapping the type was registered in.
        kind: TypeKind,
        /// Rust type name.
        type_name: &'static str,
    },

    /// A logical name was empty.
    #[error("{kind} name cannot be empty")]
    EmptyTypeName {
        /// Mapping the name was registered in.
        kind: TypeKind,
    },

    /// A logical name has no registered type.
    #[error("no {kind} type is registered under '{name}'")]
    UnknownTypeName {
        /// Mapping that was searched.
        kind: TypeKind,
        /// The unknown name.
        name: String,
    },

    /// A type has no registered logical name.
    #[error("{kind} type {type_name} has no registered name")]
    UnregisteredType {
        /// Mapping that was searched.
        kind: TypeKind,
        /// Rust type name.
        type_name: &'static str,
    },

    /// Domain handlers kept raising events past the cascade cap.
    #[error("causal cycle detected: cascade exceeded {max_iterations} iterations")]
    CascadeCycle {
        /// The iteration cap that was exceeded.
        max_iterations: usize,
    },

    /// The engine was driven through an impossible sequence of calls.
    #[error("invalid program state: {0}")]
    InvalidProgram(String),

    /// A validation error in domain logic.
    #[error("validation error: {0}")]
    Validation(String),

    /// A payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// The message transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl DomainError {
    /// Classifies the error as fatal or propagate-for-rollback.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::Validation(_)
            | Self::Serialization(_)
            | Self::Infrastructure(_)
            | Self::Transport(_) => Severity::Propagate,
            _ => Severity::Fatal,
        }
    }

    /// Returns `true` for invariant violations that must never be retried.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}
