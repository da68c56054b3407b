//! Integration tests for the host lifecycle.

mod common;

use keel_host::Host;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn raw_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_served_health_is_reachable_over_tcp() {
    let bus = common::in_memory_bus("ledger").await;
    bus.start().await.unwrap();
    let host = Host::serve(bus, "127.0.0.1:0".parse().unwrap()).await.unwrap();

    let response = raw_get(host.local_addr(), "/health").await;
    host.shutdown().await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("\"endpoint\":\"ledger@localhost\""), "{response}");
}

#[tokio::test]
async fn test_shutdown_stops_workers_and_closes_the_listener() {
    let bus = common::in_memory_bus("ledger").await;
    bus.start().await.unwrap();
    let host = Host::serve(bus.clone(), "127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = host.local_addr();

    host.shutdown().await.unwrap();

    assert_eq!(bus.active_workers(), 0);
    assert!(TcpStream::connect(addr).await.is_err());
}
