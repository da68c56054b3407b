//! In-process implementations of every collaborator the engine consumes.

pub mod event_store;
pub mod snapshot_store;
pub mod subscription;
pub mod transport;

pub use event_store::InMemoryEventStore;
pub use snapshot_store::InMemorySnapshotStore;
pub use subscription::InMemorySubscriptionStorage;
pub use transport::{InMemoryNetwork, InMemoryTransport};
