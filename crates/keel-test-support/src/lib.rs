//! Shared test doubles, sample domain models and a wired-up in-memory
//! engine for the keel crates.

mod bus;
mod clock;
pub mod domain;
mod harness;
mod store;

pub use bus::RecordingBus;
pub use clock::FixedClock;
pub use harness::{Harness, sample_types};
pub use store::{FailingEventStore, FailingSnapshotStore};
