//! Keel host: startup and runtime errors.

use keel_core::error::DomainError;
use thiserror::Error;

/// Errors raised while starting, running or stopping a host.
#[derive(Debug, Error)]
pub enum HostError {
    /// A required environment variable is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database connection or pool error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Network binding or I/O error.
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),

    /// The engine refused to start or stop the endpoint.
    #[error("engine error: {0}")]
    Engine(#[from] DomainError),

    /// The tracing subscriber could not be installed.
    #[error("telemetry error: {0}")]
    Telemetry(String),
}
