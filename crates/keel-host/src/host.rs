//! Lifecycle of a hosted async-bus endpoint.
//!
//! A [`Host`] owns a started [`AsyncBus`] and an HTTP server exposing its
//! health. [`Host::shutdown`] stops the workers first, then drains the
//! server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use keel_core::bus::AsyncBus;
use keel_core::error::DomainError;
use keel_core::types::TypeNameRegistry;
use keel_postgres::transport::DEFAULT_POLL_INTERVAL;
use keel_postgres::{PgMessageTransport, PgSubscriptionStorage};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::config::HostConfig;
use crate::error::HostError;
use crate::health;

/// Builds the host router around `bus`.
pub fn app(bus: Arc<AsyncBus>) -> Router {
    Router::new()
        .merge(health::router())
        .layer(TraceLayer::new_for_http())
        .with_state(bus)
}

/// Opens the database pool and creates the keel tables.
///
/// # Errors
///
/// Returns `HostError::Database` if the pool cannot connect, or
/// `HostError::Engine` if the schema cannot be created.
pub async fn connect(config: &HostConfig) -> Result<PgPool, HostError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await?;
    keel_postgres::migrate(&pool).await?;
    tracing::info!("database ready");
    Ok(pool)
}

/// A running endpoint plus its health server.
pub struct Host {
    bus: Arc<AsyncBus>,
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<std::io::Result<()>>,
}

impl Host {
    /// Builds a PostgreSQL-backed async bus for `config`, lets `register`
    /// add the endpoint's subscribers, starts the bus and serves health.
    ///
    /// # Errors
    ///
    /// Returns `HostError::Engine` if registration, transport
    /// initialization or bus start fails, or `HostError::Server` if the
    /// health server cannot bind.
    pub async fn start<F>(
        config: &HostConfig,
        pool: PgPool,
        types: Arc<TypeNameRegistry>,
        register: F,
    ) -> Result<Self, HostError>
    where
        F: FnOnce(&mut AsyncBus) -> Result<(), DomainError>,
    {
        let transport = PgMessageTransport::with_timeouts(
            pool.clone(),
            config.receive_timeout,
            DEFAULT_POLL_INTERVAL,
        );
        let mut bus = AsyncBus::new(
            config.bus_config(),
            types,
            Arc::new(PgSubscriptionStorage::new(pool)),
            Arc::new(transport),
        );
        register(&mut bus)?;
        bus.initialize().await?;
        bus.start().await?;
        Self::serve(Arc::new(bus), config.socket_addr()?).await
    }

    /// Serves health for an already started `bus` on `addr`.
    ///
    /// # Errors
    ///
    /// Returns `HostError::Server` if `addr` cannot be bound.
    pub async fn serve(bus: Arc<AsyncBus>, addr: SocketAddr) -> Result<Self, HostError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, signal) = oneshot::channel::<()>();
        let router = app(Arc::clone(&bus));
        let server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = signal.await;
                })
                .await
        });
        tracing::info!(%local_addr, endpoint = %bus.input_address(), "host listening");
        Ok(Self {
            bus,
            local_addr,
            shutdown,
            server,
        })
    }

    /// The hosted bus.
    #[must_use]
    pub fn bus(&self) -> &Arc<AsyncBus> {
        &self.bus
    }

    /// Address the health server is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the bus workers, then the health server.
    ///
    /// # Errors
    ///
    /// Returns `HostError::Server` if the server task failed.
    pub async fn shutdown(self) -> Result<(), HostError> {
        self.bus.stop().await;
        let _ = self.shutdown.send(());
        self.server.await.map_err(std::io::Error::other)??;
        tracing::info!(local_addr = %self.local_addr, "host stopped");
        Ok(())
    }

    /// Runs until the process receives Ctrl-C, then shuts down.
    ///
    /// # Errors
    ///
    /// Returns `HostError::Server` if the signal cannot be awaited or the
    /// server task failed.
    pub async fn run_until_ctrl_c(self) -> Result<(), HostError> {
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown requested");
        self.shutdown().await
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("endpoint", self.bus.input_address())
            .field("local_addr", &self.local_addr)
            .field("active_workers", &self.bus.active_workers())
            .finish_non_exhaustive()
    }
}
