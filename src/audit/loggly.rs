//! Background shipping of audit records to Loggly's bulk endpoint.
//!
//! [`LogglySink::record`] only does a non-blocking `try_send` onto a bounded
//! channel. A worker task batches entries and POSTs them as newline-delimited
//! JSON. Failed batches are retried after `retry_interval` up to
//! `max_retries` times and then dropped; nothing here ever reaches a proxied
//! caller.

use super::{AuditEntry, AuditError, AuditSink, ExchangeRecord};
use crate::metrics;
use reqwest::Client;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default Loggly bulk ingestion host.
pub const DEFAULT_ENDPOINT: &str = "https://logs-01.loggly.com";

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the Loggly shipper.
#[derive(Clone)]
pub struct LogglyConfig {
    /// Customer token (NEVER log this value)
    token: String,
    /// Base URL of the ingestion host
    pub endpoint: String,
    /// Comma-separated tags attached to every entry
    pub tags: String,
    /// Entries per bulk POST
    pub bulk_size: usize,
    /// Flush a partial batch after this long
    pub flush_interval: Duration,
    /// Delay before re-sending a failed batch
    pub retry_interval: Duration,
    /// Re-send attempts per batch before it is dropped
    pub max_retries: u32,
    /// Entries buffered between the proxy and the worker
    pub channel_capacity: usize,
    /// Request timeout for bulk POSTs
    pub api_timeout: Duration,
}

impl fmt::Debug for LogglyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogglyConfig")
            .field("token", &"[REDACTED]")
            .field("endpoint", &self.endpoint)
            .field("tags", &self.tags)
            .field("bulk_size", &self.bulk_size)
            .field("flush_interval", &self.flush_interval)
            .field("retry_interval", &self.retry_interval)
            .field("max_retries", &self.max_retries)
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

impl LogglyConfig {
    /// Create a configuration with defaults for everything but the token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            tags: "pacegate".to_string(),
            bulk_size: 1000,
            flush_interval: Duration::from_secs(5),
            retry_interval: Duration::from_secs(60),
            max_retries: 3,
            channel_capacity: 10_000,
            api_timeout: Duration::from_secs(10),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `LOGGLY_TOKEN` - customer token; unset or empty disables shipping
    /// - `LOGGLY_TAGS` (default: pacegate)
    /// - `LOGGLY_BULK_SIZE` (default: 1000)
    /// - `LOGGLY_FLUSH_INTERVAL_SECS` (default: 5)
    /// - `LOGGLY_RETRY_INTERVAL_SECS` (default: 60)
    /// - `LOGGLY_CHANNEL_CAPACITY` (default: 10000)
    ///
    /// Returns `None` when no token is configured.
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("LOGGLY_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())?;
        let default = Self::new(token);

        Some(Self {
            tags: std::env::var("LOGGLY_TAGS").unwrap_or(default.tags.clone()),
            bulk_size: std::env::var("LOGGLY_BULK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(default.bulk_size),
            flush_interval: std::env::var("LOGGLY_FLUSH_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &u64| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(default.flush_interval),
            retry_interval: std::env::var("LOGGLY_RETRY_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.retry_interval),
            channel_capacity: std::env::var("LOGGLY_CHANNEL_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(default.channel_capacity),
            ..default
        })
    }

    /// Override the ingestion host (tests, regional endpoints).
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the bulk size.
    #[must_use]
    pub fn with_bulk_size(mut self, bulk_size: usize) -> Self {
        self.bulk_size = bulk_size.max(1);
        self
    }

    /// Set the flush interval.
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, retry_interval: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_interval = retry_interval;
        self
    }

    /// Set the channel capacity.
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Full bulk URL, including the token.
    fn bulk_url(&self) -> String {
        format!(
            "{}/bulk/{}/tag/{}/",
            self.endpoint.trim_end_matches('/'),
            self.token,
            self.tags
        )
    }
}

// ============================================================================
// Sink and Shipper
// ============================================================================

/// Proxy-facing half: enqueues records without blocking.
#[derive(Clone)]
pub struct LogglySink {
    tx: mpsc::Sender<AuditEntry>,
    dropped: Arc<AtomicU64>,
}

impl LogglySink {
    /// Records dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditSink for LogglySink {
    fn record(&self, record: &ExchangeRecord) {
        match self.tx.try_send(record.to_entry()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(request_id = %record.id, "Audit buffer full, dropping record");
                if let Some(m) = metrics::get_metrics() {
                    m.record_audit_dropped(1);
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!(request_id = %record.id, "Audit shipper stopped, dropping record");
            }
        }
    }
}

/// Worker-facing half: owns the background task.
pub struct LogglyShipper {
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl LogglyShipper {
    /// Start the background worker.
    ///
    /// # Errors
    ///
    /// Returns `AuditError::Transport` if the HTTP client cannot be built.
    pub fn spawn(config: LogglyConfig) -> Result<(LogglySink, LogglyShipper), AuditError> {
        let client = Client::builder().timeout(config.api_timeout).build()?;
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let shutdown = CancellationToken::new();

        info!(
            endpoint = %config.endpoint,
            tags = %config.tags,
            bulk_size = config.bulk_size,
            "Loggly audit shipping enabled"
        );

        let worker = Worker {
            client,
            url: config.bulk_url(),
            config,
            rx,
            shutdown: shutdown.clone(),
        };
        let handle = tokio::spawn(worker.run());

        let sink = LogglySink {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        Ok((sink, LogglyShipper { handle, shutdown }))
    }

    /// Flush what is buffered and stop the worker.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "Audit shipper task failed");
        }
    }
}

struct Worker {
    client: Client,
    url: String,
    config: LogglyConfig,
    rx: mpsc::Receiver<AuditEntry>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        let mut batch: Vec<AuditEntry> = Vec::with_capacity(self.config.bulk_size);
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    while let Ok(entry) = self.rx.try_recv() {
                        batch.push(entry);
                    }
                    // Final flush gets a single attempt.
                    if !batch.is_empty() {
                        let entries = std::mem::take(&mut batch);
                        if let Err(e) = self.deliver(&entries).await {
                            warn!(error = %e, dropped = entries.len(), "Final audit flush failed");
                        }
                    }
                    break;
                }

                received = self.rx.recv() => match received {
                    Some(entry) => {
                        batch.push(entry);
                        if batch.len() >= self.config.bulk_size {
                            self.ship(&mut batch).await;
                        }
                    }
                    None => {
                        self.ship(&mut batch).await;
                        break;
                    }
                },

                _ = ticker.tick() => {
                    self.ship(&mut batch).await;
                }
            }
        }

        debug!("Audit shipper stopped");
    }

    /// Send the batch, retrying per config; the batch is empty afterwards.
    async fn ship(&self, batch: &mut Vec<AuditEntry>) {
        if batch.is_empty() {
            return;
        }
        let entries = std::mem::take(batch);

        let mut attempt = 0;
        loop {
            match self.deliver(&entries).await {
                Ok(()) => {
                    debug!(count = entries.len(), "Audit batch delivered");
                    return;
                }
                Err(e) => {
                    if let Some(m) = metrics::get_metrics() {
                        m.record_audit_delivery_failure();
                    }
                    if attempt >= self.config.max_retries {
                        warn!(
                            error = %e,
                            attempts = attempt + 1,
                            dropped = entries.len(),
                            "Giving up on audit batch"
                        );
                        if let Some(m) = metrics::get_metrics() {
                            m.record_audit_dropped(entries.len() as u64);
                        }
                        return;
                    }
                    attempt += 1;
                    warn!(
                        error = %e,
                        attempt,
                        retry_in_secs = self.config.retry_interval.as_secs(),
                        "Audit batch delivery failed, will retry"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_interval) => {}
                        _ = self.shutdown.cancelled() => {
                            warn!(dropped = entries.len(), "Shutdown during audit retry, dropping batch");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn deliver(&self, entries: &[AuditEntry]) -> Result<(), AuditError> {
        let body = encode_bulk(entries)?;
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuditError::Rejected {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Encode entries as newline-delimited JSON, the bulk endpoint's format.
pub fn encode_bulk(entries: &[AuditEntry]) -> Result<String, AuditError> {
    let mut body = String::new();
    for entry in entries {
        body.push_str(&serde_json::to_string(entry)?);
        body.push('\n');
    }
    Ok(body)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::RequestId;
    use crate::audit::{Outcome, RequestMeta};
    use axum::{Router, extract::State, http::StatusCode, routing::post};
    use serial_test::serial;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    type Received = Arc<Mutex<Vec<(String, String)>>>;

    /// Bulk endpoint stub that records (path, body) and answers `status`.
    async fn spawn_bulk_endpoint(status: StatusCode) -> (String, Received) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));

        async fn handler(
            State((received, status)): State<(Received, StatusCode)>,
            uri: axum::http::Uri,
            body: String,
        ) -> StatusCode {
            received.lock().unwrap().push((uri.path().to_string(), body));
            status
        }

        let app = Router::new()
            .route("/bulk/{*rest}", post(handler))
            .with_state((received.clone(), status));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}", addr), received)
    }

    fn record() -> ExchangeRecord {
        ExchangeRecord::rejected(
            RequestId::new(),
            RequestMeta::default(),
            Outcome::NoTarget,
            "no-proxy".into(),
        )
    }

    #[test]
    fn test_bulk_url_contains_token_and_tags() {
        let config = LogglyConfig::new("tok-123").with_endpoint("https://logs.example/");
        assert_eq!(config.bulk_url(), "https://logs.example/bulk/tok-123/tag/pacegate/");
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = LogglyConfig::new("super-secret");
        let shown = format!("{:?}", config);
        assert!(!shown.contains("super-secret"));
        assert!(shown.contains("[REDACTED]"));
    }

    #[test]
    fn test_encode_bulk_is_ndjson() {
        let entries = vec![record().to_entry(), record().to_entry()];
        let body = encode_bulk(&entries).unwrap();
        let lines: Vec<_> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["status"], "error");
        }
    }

    #[test]
    #[serial]
    fn test_from_env_requires_token() {
        unsafe {
            std::env::remove_var("LOGGLY_TOKEN");
        }
        assert!(LogglyConfig::from_env().is_none());

        unsafe {
            std::env::set_var("LOGGLY_TOKEN", "abc");
            std::env::set_var("LOGGLY_TAGS", "proxy,zoho");
            std::env::set_var("LOGGLY_BULK_SIZE", "50");
        }
        let config = LogglyConfig::from_env().unwrap();
        assert_eq!(config.tags, "proxy,zoho");
        assert_eq!(config.bulk_size, 50);
        assert_eq!(config.retry_interval, Duration::from_secs(60));

        unsafe {
            std::env::remove_var("LOGGLY_TOKEN");
            std::env::remove_var("LOGGLY_TAGS");
            std::env::remove_var("LOGGLY_BULK_SIZE");
        }
    }

    #[tokio::test]
    async fn test_full_batch_is_shipped() {
        let (endpoint, received) = spawn_bulk_endpoint(StatusCode::OK).await;
        let config = LogglyConfig::new("tok")
            .with_endpoint(endpoint)
            .with_bulk_size(2)
            .with_flush_interval(Duration::from_secs(3600));
        let (sink, shipper) = LogglyShipper::spawn(config).unwrap();

        sink.record(&record());
        sink.record(&record());

        for _ in 0..100 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        {
            let received = received.lock().unwrap();
            assert_eq!(received.len(), 1);
            assert_eq!(received[0].0, "/bulk/tok/tag/pacegate/");
            assert_eq!(received[0].1.lines().count(), 2);
        }
        shipper.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_partial_batch() {
        let (endpoint, received) = spawn_bulk_endpoint(StatusCode::OK).await;
        let config = LogglyConfig::new("tok")
            .with_endpoint(endpoint)
            .with_bulk_size(100)
            .with_flush_interval(Duration::from_secs(3600));
        let (sink, shipper) = LogglyShipper::spawn(config).unwrap();

        sink.record(&record());
        shipper.shutdown().await;

        let received = received.lock().unwrap();
        let lines: usize = received.iter().map(|(_, body)| body.lines().count()).sum();
        assert_eq!(lines, 1);
    }

    #[tokio::test]
    async fn test_rejected_batch_is_dropped_without_blocking() {
        let (endpoint, received) = spawn_bulk_endpoint(StatusCode::FORBIDDEN).await;
        let config = LogglyConfig::new("tok")
            .with_endpoint(endpoint)
            .with_bulk_size(1)
            .with_retries(1, Duration::from_millis(10));
        let (sink, shipper) = LogglyShipper::spawn(config).unwrap();

        sink.record(&record());

        for _ in 0..100 {
            if received.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // One attempt plus one retry.
        assert_eq!(received.lock().unwrap().len(), 2);
        shipper.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_blocking() {
        // Unroutable endpoint and a long flush interval keep the worker idle.
        let config = LogglyConfig::new("tok")
            .with_endpoint("http://127.0.0.1:9")
            .with_bulk_size(1000)
            .with_flush_interval(Duration::from_secs(3600))
            .with_retries(0, Duration::from_millis(1))
            .with_channel_capacity(1);
        let (sink, shipper) = LogglyShipper::spawn(config).unwrap();

        // No await between sends, so the worker cannot drain the channel.
        let started = std::time::Instant::now();
        for _ in 0..50 {
            sink.record(&record());
        }
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(sink.dropped(), 49);

        shipper.shutdown().await;
    }

    #[tokio::test]
    async fn test_transport_error_does_not_expose_token() {
        let config = LogglyConfig::new("SECRET-TOKEN-123").with_endpoint("http://127.0.0.1:9");
        let (_tx, rx) = mpsc::channel(1);
        let worker = Worker {
            client: Client::new(),
            url: config.bulk_url(),
            config,
            rx,
            shutdown: CancellationToken::new(),
        };

        let err = worker.deliver(&[record().to_entry()]).await.unwrap_err();
        assert!(matches!(err, AuditError::Transport(_)));
        let shown = err.to_string();
        assert!(!shown.contains("SECRET-TOKEN-123"), "token leaked: {shown}");
        assert!(!format!("{:?}", err).contains("SECRET-TOKEN-123"));
    }
}
