//! Shared helpers for host integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use keel_core::bus::{AsyncBus, AsyncBusConfig};
use keel_core::bus::transport::Address;
use keel_core::memory::{InMemoryNetwork, InMemorySubscriptionStorage};
use keel_test_support::sample_types;
use tower::ServiceExt;

/// An in-memory endpoint on `queue`, initialized but not started.
pub async fn in_memory_bus(queue: &str) -> Arc<AsyncBus> {
    let network = InMemoryNetwork::new();
    let bus = AsyncBus::new(
        AsyncBusConfig {
            input_address: Address::local(queue),
            worker_count: 2,
        },
        Arc::new(sample_types().unwrap()),
        Arc::new(InMemorySubscriptionStorage::new()),
        Arc::new(network.transport()),
    );
    bus.initialize().await.unwrap();
    Arc::new(bus)
}

/// Send a GET request and return the response.
pub async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap_or_default();

    (status, json)
}
