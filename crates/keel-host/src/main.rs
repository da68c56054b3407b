//! Keel host entry point.
//!
//! Runs an endpoint with no local subscribers: its queue exists so peers
//! can address it, and its health is served until Ctrl-C.

use std::sync::Arc;

use keel_core::types::TypeNameRegistry;
use keel_host::{Host, HostConfig, HostError};

#[tokio::main]
async fn main() -> Result<(), HostError> {
    keel_host::init_tracing()?;

    let config = HostConfig::from_env()?;
    tracing::info!(endpoint = %config.endpoint, workers = config.workers, "starting keel host");

    let pool = keel_host::connect(&config).await?;
    let host = Host::start(&config, pool, Arc::new(TypeNameRegistry::new()), |_| Ok(())).await?;
    host.run_until_ctrl_c().await
}
