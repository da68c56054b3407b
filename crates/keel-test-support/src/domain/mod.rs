//! Sample domain models used by the engine's scenario tests.

pub mod bank;
pub mod cycle;
pub mod orders;
