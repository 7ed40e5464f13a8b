//! Error types for the pacegate proxy.
//!
//! Every variant is terminal for the exchange it belongs to. The mapping to an
//! HTTP status, a response body and an audit outcome lives here and nowhere
//! else.

use crate::admission::AdmissionError;
use crate::audit::Outcome;
use bytes::Bytes;
use http::{Response, StatusCode, header};
use http_body_util::Full;
use thiserror::Error;

/// Boxed error used for streaming bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body returned to callers for locally generated (non-proxied) responses.
pub const NO_TARGET_BODY: &str = "Missed X-Proxy-To header";

/// Body returned when the target could not be reached.
pub const UPSTREAM_ERROR_BODY: &str = "There was an error proxying your request";

/// Errors that can occur while handling a proxied exchange.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The caller did not supply an `X-Proxy-To` header.
    #[error("Missed X-Proxy-To header")]
    NoTarget,

    /// The `X-Proxy-To` header is not an absolute http(s) URL.
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Transport failure talking to the target.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// The target did not answer (or finish answering) in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The admission queue is at its configured bound.
    #[error("Admission queue is full ({capacity} requests in flight)")]
    QueueFull {
        /// Configured queue bound
        capacity: usize,
    },

    /// The inbound body exceeded the buffering limit.
    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge {
        /// Configured body limit in bytes
        limit: usize,
    },

    /// Queue bookkeeping failure (duplicate id).
    #[error("Admission error: {0}")]
    Admission(AdmissionError),

    /// Any other fault inside request handling.
    #[error("{0}")]
    Internal(String),
}

impl From<AdmissionError> for ProxyError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::Full { capacity } => ProxyError::QueueFull { capacity },
            other => ProxyError::Admission(other),
        }
    }
}

impl ProxyError {
    /// Audit outcome for an exchange that terminated with this error.
    pub fn outcome(&self) -> Outcome {
        match self {
            ProxyError::NoTarget => Outcome::NoTarget,
            ProxyError::InvalidTarget(_) | ProxyError::Upstream(_) | ProxyError::Timeout(_) => {
                Outcome::UpstreamError
            }
            ProxyError::QueueFull { .. }
            | ProxyError::BodyTooLarge { .. }
            | ProxyError::Admission(_)
            | ProxyError::Internal(_) => Outcome::InternalError,
        }
    }

    /// HTTP status returned to the caller.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoTarget | ProxyError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::InvalidTarget(_) | ProxyError::Upstream(_) | ProxyError::Timeout(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Admission(_) | ProxyError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message stored in the audit record's `error.msg`.
    pub fn audit_message(&self) -> String {
        match self {
            ProxyError::NoTarget => "no-proxy".to_string(),
            other => other.to_string(),
        }
    }

    /// Render the error as the response the caller receives.
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        let body = match self {
            ProxyError::NoTarget => NO_TARGET_BODY.to_string(),
            ProxyError::InvalidTarget(_) | ProxyError::Upstream(_) | ProxyError::Timeout(_) => {
                UPSTREAM_ERROR_BODY.to_string()
            }
            ProxyError::QueueFull { .. } => "Proxy queue is full".to_string(),
            ProxyError::BodyTooLarge { limit } => {
                format!("Request body exceeds maximum size of {} bytes", limit)
            }
            ProxyError::Admission(e) => format!("Unknow error: {}", e),
            ProxyError::Internal(msg) => format!("Unknow error: {}", msg),
        };

        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = self.status();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        if matches!(self, ProxyError::QueueFull { .. }) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("1"));
        }
        response
    }
}

/// Result type alias for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;
