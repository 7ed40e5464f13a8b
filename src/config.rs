//! Runtime configuration for the pacegate proxy.
//!
//! The listen address is handled by the CLI in `main.rs`; everything that
//! tunes admission, buffering and the upstream leg is read here.

use std::time::Duration;

/// Runtime configuration for the pacegate proxy.
///
/// All parameters can be overridden via environment variables.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    // ─────────────────────────────────────────────────────────────────────────
    // Admission
    // ─────────────────────────────────────────────────────────────────────────
    /// Minimum spacing between two consecutive releases.
    pub min_interval: Duration,

    /// Upper bound on a single wait for queue position.
    pub poll_interval: Duration,

    /// Maximum number of in-flight requests. `None` means unbounded.
    pub max_queue_depth: Option<usize>,

    // ─────────────────────────────────────────────────────────────────────────
    // Buffering and auditing
    // ─────────────────────────────────────────────────────────────────────────
    /// Maximum inbound request body size in bytes.
    /// Larger requests receive 413 Payload Too Large.
    pub req_buffer_max: usize,

    /// Bytes of request/response bodies copied into each audit record.
    pub audit_body_max: usize,

    // ─────────────────────────────────────────────────────────────────────────
    // Upstream leg
    // ─────────────────────────────────────────────────────────────────────────
    /// Longest gap allowed between two upstream response chunks.
    pub upstream_idle_timeout: Duration,

    /// Longest time an upstream exchange may take end to end.
    pub upstream_total_timeout: Duration,

    /// Enable TCP_NODELAY on both legs
    pub tcp_nodelay: bool,

    /// TCP keepalive interval in seconds
    pub tcp_keepalive_secs: u64,

    /// Prometheus metrics endpoint port
    pub metrics_port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(3000),
            poll_interval: Duration::from_millis(500),
            max_queue_depth: None,

            req_buffer_max: 10 * 1024 * 1024, // 10 MB
            audit_body_max: 64 * 1024,        // 64 KB

            upstream_idle_timeout: Duration::from_secs(60),
            upstream_total_timeout: Duration::from_secs(300),
            tcp_nodelay: true,
            tcp_keepalive_secs: 60,
            metrics_port: 9090,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// # Environment Variables
    ///
    /// - `LIMIT` - minimum spacing in milliseconds (default: 3000)
    /// - `PACEGATE_POLL_INTERVAL_MS` (default: 500)
    /// - `PACEGATE_MAX_QUEUE_DEPTH` (default: 0 = unbounded)
    /// - `PACEGATE_REQ_BUFFER_MAX` (default: 10485760 = 10MB)
    /// - `PACEGATE_AUDIT_BODY_MAX` (default: 65536)
    /// - `PACEGATE_UPSTREAM_IDLE_TIMEOUT_SECS` (default: 60)
    /// - `PACEGATE_UPSTREAM_TOTAL_TIMEOUT_SECS` (default: 300)
    /// - `PACEGATE_TCP_NODELAY` (default: true)
    /// - `PACEGATE_TCP_KEEPALIVE_SECS` (default: 60)
    /// - `PACEGATE_METRICS_PORT` (default: 9090)
    ///
    /// Unparsable values fall back to the default.
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            min_interval: std::env::var("LIMIT")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.min_interval),

            poll_interval: std::env::var("PACEGATE_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|ms: &u64| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(default.poll_interval),

            max_queue_depth: std::env::var("PACEGATE_MAX_QUEUE_DEPTH")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .map(|depth| (depth > 0).then_some(depth))
                .unwrap_or(default.max_queue_depth),

            req_buffer_max: std::env::var("PACEGATE_REQ_BUFFER_MAX")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.req_buffer_max),

            audit_body_max: std::env::var("PACEGATE_AUDIT_BODY_MAX")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.audit_body_max),

            upstream_idle_timeout: std::env::var("PACEGATE_UPSTREAM_IDLE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.upstream_idle_timeout),

            upstream_total_timeout: std::env::var("PACEGATE_UPSTREAM_TOTAL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.upstream_total_timeout),

            tcp_nodelay: std::env::var("PACEGATE_TCP_NODELAY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.tcp_nodelay),

            tcp_keepalive_secs: std::env::var("PACEGATE_TCP_KEEPALIVE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.tcp_keepalive_secs),

            metrics_port: std::env::var("PACEGATE_METRICS_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.metrics_port),
        }
    }
}
