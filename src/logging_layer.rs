//! Tower layer for structured request/response logging.
//!
//! Logs every inbound request and the response sent back, with latency.
//! Header dumps are only produced at DEBUG level and always pass through
//! redaction.

use http::{HeaderMap, Request, Response};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::{Layer, Service};
use tracing::info;

/// Headers that are redacted from logs for security.
#[cfg(feature = "fuzzing")]
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "x-api-key",
    "x-auth-token",
    "proxy-authorization",
    "set-cookie",
];

#[cfg(not(feature = "fuzzing"))]
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "x-api-key",
    "x-auth-token",
    "proxy-authorization",
    "set-cookie",
];

const REDACTED: &str = "[REDACTED]";

/// True if the header must never be logged verbatim.
pub fn is_sensitive_header(name: &str) -> bool {
    SENSITIVE_HEADERS
        .iter()
        .any(|&sensitive| name.eq_ignore_ascii_case(sensitive))
}

// ============================================================================
// Layer
// ============================================================================

/// Layer that wraps a service with [`LoggingService`].
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingLayer;

impl<S> Layer<S> for LoggingLayer {
    type Service = LoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoggingService { inner }
    }
}

/// Service that logs request arrival and response departure.
#[derive(Clone, Debug)]
pub struct LoggingService<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for LoggingService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: fmt::Display,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let target = req
            .headers()
            .get(crate::forwarder::PROXY_TO_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_owned());

        info!(
            method = %method,
            uri = %uri,
            target = target.as_deref().unwrap_or("-"),
            direction = "inbound",
            "Request received"
        );

        // PERF(latency): Only sanitize headers at DEBUG level to avoid allocation overhead
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                version = ?req.version(),
                headers = ?sanitize_headers(req.headers()),
                "Request details"
            );
        }

        let started = Instant::now();
        let fut = self.inner.call(req);

        Box::pin(async move {
            let result = fut.await;
            let latency = started.elapsed();

            match &result {
                Ok(response) => {
                    info!(
                        method = %method,
                        uri = %uri,
                        status = response.status().as_u16(),
                        latency_ms = latency.as_millis() as u64,
                        direction = "outbound",
                        "Response sent"
                    );
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!(
                            headers = ?sanitize_headers(response.headers()),
                            "Response details"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        method = %method,
                        uri = %uri,
                        error = %e,
                        latency_ms = latency.as_millis() as u64,
                        direction = "error",
                        "Request failed"
                    );
                }
            }

            result
        })
    }
}

// ============================================================================
// Header Redaction
// ============================================================================

/// Zero-allocation wrapper for sanitized headers.
#[cfg(feature = "fuzzing")]
pub struct SanitizedHeaders<'a>(pub &'a HeaderMap);

#[cfg(not(feature = "fuzzing"))]
struct SanitizedHeaders<'a>(&'a HeaderMap);

impl fmt::Debug for SanitizedHeaders<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();

        // Limit header count to prevent DoS via excessive formatting
        const MAX_HEADERS_TO_LOG: usize = 50;
        const MAX_VALUE_LEN: usize = 1024;

        for (idx, (name, value)) in self.0.iter().enumerate() {
            if idx >= MAX_HEADERS_TO_LOG {
                map.entry(&"...", &format!("({} more headers)", self.0.len() - idx));
                break;
            }

            let name_str = name.as_str();
            if is_sensitive_header(name_str) {
                map.entry(&name_str, &REDACTED);
                continue;
            }

            match value.to_str() {
                Ok(val_str) if val_str.len() <= MAX_VALUE_LEN => {
                    map.entry(&name_str, &val_str);
                }
                Ok(val_str) => {
                    let mut cut = MAX_VALUE_LEN;
                    while !val_str.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    map.entry(
                        &name_str,
                        &format!("{}... ({} bytes)", &val_str[..cut], val_str.len()),
                    );
                }
                Err(_) => {
                    map.entry(&name_str, &format!("<binary: {} bytes>", value.len()));
                }
            }
        }

        map.finish()
    }
}

/// Create a zero-allocation sanitized headers wrapper.
#[inline]
#[cfg(feature = "fuzzing")]
pub fn sanitize_headers(headers: &HeaderMap) -> SanitizedHeaders<'_> {
    SanitizedHeaders(headers)
}

#[inline]
#[cfg(not(feature = "fuzzing"))]
fn sanitize_headers(headers: &HeaderMap) -> SanitizedHeaders<'_> {
    SanitizedHeaders(headers)
}

/// Redacted view of an already-flattened header map (audit records).
pub fn redact_header_map(headers: &BTreeMap<String, String>) -> BTreeMap<&str, &str> {
    headers
        .iter()
        .map(|(name, value)| {
            if is_sensitive_header(name) {
                (name.as_str(), REDACTED)
            } else {
                (name.as_str(), value.as_str())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use std::convert::Infallible;
    use tower::{ServiceBuilder, ServiceExt, service_fn};

    #[test]
    fn test_sensitive_headers_case_insensitive() {
        assert!(is_sensitive_header("Authorization"));
        assert!(is_sensitive_header("COOKIE"));
        assert!(!is_sensitive_header("x-proxy-to"));
    }

    #[test]
    fn test_sanitized_headers_redact_secrets() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Zoho-oauthtoken 1000.abc"));
        headers.insert("x-proxy-to", HeaderValue::from_static("https://www.zohoapis.com/"));

        let shown = format!("{:?}", sanitize_headers(&headers));
        assert!(!shown.contains("1000.abc"));
        assert!(shown.contains("[REDACTED]"));
        assert!(shown.contains("zohoapis"));
    }

    #[test]
    fn test_redact_header_map() {
        let mut headers = BTreeMap::new();
        headers.insert("cookie".to_string(), "session=1".to_string());
        headers.insert("accept".to_string(), "*/*".to_string());

        let redacted = redact_header_map(&headers);
        assert_eq!(redacted["cookie"], "[REDACTED]");
        assert_eq!(redacted["accept"], "*/*");
    }

    #[tokio::test]
    async fn test_layer_passes_response_through() {
        let svc = ServiceBuilder::new()
            .layer(LoggingLayer)
            .service(service_fn(|_req: Request<()>| async {
                Ok::<_, Infallible>(Response::new("hi"))
            }));

        let response = svc.oneshot(Request::new(())).await.unwrap();
        assert_eq!(*response.body(), "hi");
    }
}
