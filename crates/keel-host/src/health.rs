//! Health check endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Json, Router, routing::get};
use keel_core::bus::AsyncBus;
use serde::Serialize;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok` while workers run, `stopped` otherwise.
    pub status: &'static str,
    /// Host version.
    pub version: &'static str,
    /// Input queue of the endpoint.
    pub endpoint: String,
    /// Running worker loops.
    pub active_workers: usize,
}

/// GET /health
async fn health_check(State(bus): State<Arc<AsyncBus>>) -> (StatusCode, Json<HealthResponse>) {
    let active_workers = bus.active_workers();
    let (status, label) = if active_workers > 0 {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "stopped")
    };
    let body = HealthResponse {
        status: label,
        version: env!("CARGO_PKG_VERSION"),
        endpoint: bus.input_address().to_string(),
        active_workers,
    };
    (status, Json(body))
}

/// Returns the health check router.
pub fn router() -> Router<Arc<AsyncBus>> {
    Router::new().route("/health", get(health_check))
}
