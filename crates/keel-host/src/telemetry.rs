//! Tracing subscriber installation.

use tracing_subscriber::EnvFilter;

use crate::error::HostError;

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info";

/// Builds the log filter from `RUST_LOG`, falling back to
/// [`DEFAULT_FILTER`].
#[must_use]
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs a JSON formatting subscriber as the global default.
///
/// # Errors
///
/// Returns `HostError::Telemetry` if a global subscriber is already set.
pub fn init_tracing() -> Result<(), HostError> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .json()
        .try_init()
        .map_err(|e| HostError::Telemetry(e.to_string()))
}
