//! Host configuration read from the environment.

use std::net::SocketAddr;
use std::time::Duration;

use keel_core::bus::AsyncBusConfig;
use keel_core::bus::async_bus::{DEFAULT_RECEIVE_TIMEOUT, DEFAULT_WORKER_COUNT};
use keel_core::bus::transport::Address;

use crate::error::HostError;

/// Settings of one hosted endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// `PostgreSQL` connection string.
    pub database_url: String,
    /// Input queue of the endpoint, `queue` or `queue@machine`.
    pub endpoint: Address,
    /// Number of async-bus worker loops.
    pub workers: usize,
    /// Bounded wait of each transport receive.
    pub receive_timeout: Duration,
    /// Size of the database pool.
    pub db_max_connections: u32,
    /// Interface the health server binds to.
    pub host: String,
    /// Port the health server binds to.
    pub port: u16,
}

impl HostConfig {
    /// Reads the configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns `HostError::Config` if `DATABASE_URL` is missing or any
    /// variable cannot be parsed.
    pub fn from_env() -> Result<Self, HostError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name
    /// to its value.
    ///
    /// # Errors
    ///
    /// Same as [`HostConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, HostError> {
        let database_url = lookup("DATABASE_URL").ok_or_else(|| {
            HostError::Config("DATABASE_URL environment variable must be set".into())
        })?;
        let endpoint = lookup("KEEL_ENDPOINT")
            .unwrap_or_else(|| "keel".to_string())
            .parse()
            .map_err(|e| HostError::Config(format!("KEEL_ENDPOINT is not a valid address: {e}")))?;
        let workers = parse(&lookup, "KEEL_WORKERS", DEFAULT_WORKER_COUNT)?;
        if workers == 0 {
            return Err(HostError::Config("KEEL_WORKERS must be at least 1".into()));
        }
        let default_timeout_ms =
            u64::try_from(DEFAULT_RECEIVE_TIMEOUT.as_millis()).unwrap_or(u64::MAX);
        let receive_timeout =
            Duration::from_millis(parse(&lookup, "KEEL_RECEIVE_TIMEOUT_MS", default_timeout_ms)?);

        Ok(Self {
            database_url,
            endpoint,
            workers,
            receive_timeout,
            db_max_connections: parse(&lookup, "KEEL_DB_MAX_CONNECTIONS", 10)?,
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse(&lookup, "PORT", 3000)?,
        })
    }

    /// Async-bus settings for the endpoint.
    #[must_use]
    pub fn bus_config(&self) -> AsyncBusConfig {
        AsyncBusConfig {
            input_address: self.endpoint.clone(),
            worker_count: self.workers,
        }
    }

    /// Address the health server listens on.
    ///
    /// # Errors
    ///
    /// Returns `HostError::Config` if `HOST:PORT` is not a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, HostError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| HostError::Config(format!("invalid HOST:PORT combination: {e}")))
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, HostError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| HostError::Config(format!("{key} is invalid: {e}"))),
        None => Ok(default),
    }
}
