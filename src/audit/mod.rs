//! Audit recording for proxied exchanges.
//!
//! The proxy hands every terminal exchange to an [`AuditSink`] exactly once,
//! in termination order. Sinks must return immediately and swallow their own
//! failures: auditing can never block or fail a proxied request.
//!
//! - [`TracingSink`] writes records as structured log events.
//! - [`loggly::LogglySink`] ships records to Loggly in the background.
//! - [`MultiSink`] fans out to several sinks.

pub mod loggly;
pub mod record;

pub use record::{AuditEntry, ExchangeRecord, Outcome, RequestMeta, ResponseMeta};

use crate::logging_layer::redact_header_map;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Receiver of finished exchange records.
pub trait AuditSink: Send + Sync {
    /// Accept one record. Must not block and must not panic.
    fn record(&self, record: &ExchangeRecord);
}

/// Errors inside audit delivery. Never surfaced to proxied callers.
#[derive(Debug, Error)]
pub enum AuditError {
    /// HTTP client construction or transport failure
    #[error("Audit transport error: {0}")]
    Transport(reqwest::Error),

    /// Remote sink answered with a non-success status
    #[error("Audit sink rejected batch with status {status}")]
    Rejected {
        /// HTTP status returned by the sink
        status: u16,
    },

    /// Record could not be encoded
    #[error("Audit encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<reqwest::Error> for AuditError {
    // The bulk URL carries the customer token.
    fn from(err: reqwest::Error) -> Self {
        AuditError::Transport(err.without_url())
    }
}

// ============================================================================
// Tracing Sink
// ============================================================================

/// Writes each record as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, record: &ExchangeRecord) {
        let status = record.response.as_ref().map(|r| r.status);

        if record.outcome.is_success() {
            info!(
                request_id = %record.id,
                outcome = record.outcome.as_str(),
                method = %record.request.method,
                url = %record.request.url,
                status = ?status,
                duration_ms = record.duration_ms(),
                "Exchange completed"
            );
        } else {
            warn!(
                request_id = %record.id,
                outcome = record.outcome.as_str(),
                method = %record.request.method,
                url = %record.request.url,
                status = ?status,
                error = record.error.as_deref().unwrap_or(""),
                duration_ms = record.duration_ms(),
                "Exchange failed"
            );
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(
                request_id = %record.id,
                request_headers = ?redact_header_map(&record.request.headers),
                response_headers = ?record.response.as_ref().map(|r| redact_header_map(&r.headers)),
                "Exchange details"
            );
        }
    }
}

// ============================================================================
// Multi Sink
// ============================================================================

/// Forwards each record to every inner sink, in order.
#[derive(Clone, Default)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl MultiSink {
    /// Create an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    /// Add a sink.
    #[must_use]
    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of inner sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// True when there are no inner sinks.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl AuditSink for MultiSink {
    fn record(&self, record: &ExchangeRecord) {
        for sink in &self.sinks {
            sink.record(record);
        }
    }
}
