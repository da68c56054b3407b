//! Keel host: runs an async-bus endpoint against `PostgreSQL`.
//!
//! Reads [`HostConfig`] from the environment, installs JSON tracing, starts
//! the endpoint's workers and serves `GET /health` until shutdown.

pub mod config;
pub mod error;
pub mod health;
pub mod host;
pub mod telemetry;

pub use config::HostConfig;
pub use error::HostError;
pub use host::{Host, app, connect};
pub use telemetry::init_tracing;
