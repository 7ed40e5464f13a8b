//! Shared fixtures for integration tests.

#![allow(dead_code)]

pub mod memory_sink;
pub mod mock_upstream;

use pacegate::config::ProxyConfig;
use std::time::Duration;

/// Spacing used by the timing tests. Small enough to keep the suite fast,
/// large enough to dwarf loopback latency.
pub const TEST_LIMIT: Duration = Duration::from_millis(250);

/// Slack allowed when comparing wall-clock gaps measured at the upstream.
pub const TOLERANCE: Duration = Duration::from_millis(30);

/// Proxy configuration with test-friendly timings.
pub fn test_config() -> ProxyConfig {
    ProxyConfig {
        min_interval: TEST_LIMIT,
        poll_interval: Duration::from_millis(20),
        upstream_idle_timeout: Duration::from_secs(5),
        upstream_total_timeout: Duration::from_secs(10),
        ..ProxyConfig::default()
    }
}

/// Serve `service` behind the logging layer on an ephemeral loopback port.
pub async fn spawn_proxy(service: pacegate::proxy_service::ProxyService) -> std::net::SocketAddr {
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use hyper_util::server::conn::auto;
    use pacegate::logging_layer::LoggingLayer;
    use tower::{Service, ServiceBuilder};

    let stack = ServiceBuilder::new().layer(LoggingLayer).service(service);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let stack = stack.clone();
            tokio::spawn(async move {
                let svc = hyper::service::service_fn(move |req| {
                    let mut stack = stack.clone();
                    async move { stack.call(req).await }
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    addr
}

/// HTTP client that ignores proxy environment variables.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}
