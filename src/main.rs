//! pacegate - Forwarding proxy that releases requests FIFO with a minimum spacing.
//!
//! Listens for plain HTTP, relays each request to the URL in its `X-Proxy-To`
//! header and audits every exchange.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use hyper::Request;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto;
use pacegate::audit::loggly::{LogglyConfig, LogglyShipper};
use pacegate::audit::{AuditSink, MultiSink, TracingSink};
use pacegate::config::ProxyConfig;
use pacegate::logging_layer::LoggingLayer;
use pacegate::proxy_service::ProxyService;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tower::{Service, ServiceBuilder};
use tracing::{error, info, warn};

/// Command line configuration for the listener.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Config {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value = "5000")]
    port: u16,

    /// Bind address
    #[arg(short, long, env = "BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Graceful shutdown timeout in seconds
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value = "30")]
    shutdown_timeout: u64,
}

/// Counts open connections so shutdown can wait for them.
#[derive(Clone)]
struct ConnectionTracker {
    active_connections: Arc<AtomicUsize>,
}

impl ConnectionTracker {
    fn new() -> Self {
        Self {
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn increment(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(&self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    fn count(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli_config = Config::parse();
    let proxy_config = ProxyConfig::from_env();

    #[cfg(feature = "metrics")]
    {
        use opentelemetry::global;
        use opentelemetry_sdk::metrics::SdkMeterProvider;
        use pacegate::metrics;

        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(prometheus::default_registry().clone())
            .build()?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        global::set_meter_provider(provider.clone());

        let meter = global::meter("pacegate");
        metrics::init_metrics(&meter);

        let metrics_port = proxy_config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(metrics_port).await {
                error!(error = %e, "Metrics server error");
            }
        });

        info!(metrics_port = metrics_port, "Metrics endpoint started");
    }

    // Audit sinks: always structured logs, plus Loggly when a token is set.
    let mut sinks = MultiSink::new().with(Arc::new(TracingSink));
    let mut shipper = None;
    if let Some(loggly_config) = LogglyConfig::from_env() {
        info!(config = ?loggly_config, "Shipping audit records to Loggly");
        match LogglyShipper::spawn(loggly_config) {
            Ok((sink, handle)) => {
                sinks = sinks.with(Arc::new(sink));
                shipper = Some(handle);
            }
            Err(e) => {
                error!(error = %e, "Failed to start Loggly shipper, continuing without it");
            }
        }
    }
    let sink: Arc<dyn AuditSink> = Arc::new(sinks);

    let addr = format!("{}:{}", cli_config.bind, cli_config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!(
        addr = %addr,
        min_interval_ms = proxy_config.min_interval.as_millis() as u64,
        poll_interval_ms = proxy_config.poll_interval.as_millis() as u64,
        max_queue_depth = ?proxy_config.max_queue_depth,
        shutdown_timeout = cli_config.shutdown_timeout,
        tcp_nodelay = proxy_config.tcp_nodelay,
        "pacegate listening"
    );

    let proxy_service = ProxyService::new(proxy_config.clone(), sink)?;
    let service_stack = ServiceBuilder::new()
        .layer(LoggingLayer)
        .service(proxy_service.clone());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let connection_tracker = ConnectionTracker::new();

    let shutdown_tx_sigint = shutdown_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                let _ = shutdown_tx_sigint.send(());
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    {
        let shutdown_tx_sigterm = shutdown_tx.clone();
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown");
                    let _ = shutdown_tx_sigterm.send(());
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGTERM");
                }
            }
        });
    }

    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = configure_tcp_stream(&stream, &proxy_config) {
                            error!(error = %e, "Failed to configure socket");
                        }

                        let service_stack = service_stack.clone();
                        let mut conn_shutdown_rx = shutdown_tx.subscribe();
                        let tracker = connection_tracker.clone();

                        tracker.increment();

                        tokio::spawn(async move {
                            handle_connection(stream, peer_addr, service_stack, &mut conn_shutdown_rx)
                                .await;
                            tracker.decrement();
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }

            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping new connections");
                break;
            }
        }
    }

    info!(
        active_connections = connection_tracker.count(),
        queued_requests = proxy_service.queue().len(),
        timeout_seconds = cli_config.shutdown_timeout,
        "Waiting for active connections to drain"
    );

    let shutdown_deadline = Duration::from_secs(cli_config.shutdown_timeout);
    let start = std::time::Instant::now();

    while connection_tracker.count() > 0 {
        if start.elapsed() >= shutdown_deadline {
            warn!(
                active_connections = connection_tracker.count(),
                queued_requests = proxy_service.queue().len(),
                "Shutdown timeout reached, forcing exit"
            );
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }

    if connection_tracker.count() == 0 {
        info!("All connections drained");
    }

    if let Some(shipper) = shipper {
        shipper.shutdown().await;
    }

    info!(releases = proxy_service.gate().releases(), "pacegate stopped");
    Ok(())
}

/// Serve one connection until it closes or shutdown is signalled.
async fn handle_connection<S>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    service: S,
    shutdown_rx: &mut broadcast::Receiver<()>,
) where
    S: Service<Request<Incoming>, Response = hyper::Response<pacegate::exchange_body::ProxyBody>>
        + Clone
        + Send
        + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    let io = TokioIo::new(stream);

    let svc_fn = hyper::service::service_fn(move |req| {
        let mut svc = service.clone();
        async move { svc.call(req).await }
    });

    let executor = hyper_util::rt::TokioExecutor::new();
    let builder = auto::Builder::new(executor);
    let conn = builder.serve_connection(io, svc_fn);

    tokio::pin!(conn);

    tokio::select! {
        result = &mut conn => {
            if let Err(e) = result {
                warn!(peer = %peer_addr, error = %e, "Connection error");
            }
        }
        _ = shutdown_rx.recv() => {
            info!(peer = %peer_addr, "Shutdown signal received, gracefully closing connection");
            conn.as_mut().graceful_shutdown();
            let _ = conn.await;
        }
    }
}

/// Apply TCP options to an accepted connection.
fn configure_tcp_stream(stream: &TcpStream, config: &ProxyConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if config.tcp_keepalive_secs > 0 {
        let socket = socket2::SockRef::from(stream);
        let keepalive =
            socket2::TcpKeepalive::new().with_time(Duration::from_secs(config.tcp_keepalive_secs));
        socket.set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// Serve the Prometheus metrics endpoint.
#[cfg(feature = "metrics")]
async fn serve_metrics(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    use axum::{Router, response::IntoResponse, routing::get};

    async fn metrics_handler() -> impl IntoResponse {
        use prometheus::{Encoder, TextEncoder};

        let metrics = prometheus::default_registry().gather();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metrics, &mut buffer) {
            return (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response();
        }
        (
            axum::http::StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            buffer,
        )
            .into_response()
    }

    let app = Router::new().route("/metrics", get(metrics_handler));

    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(addr = %addr, "Metrics server listening");

    axum::serve(listener, app).await?;

    Ok(())
}
