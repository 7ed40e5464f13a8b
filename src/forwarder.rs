//! Relays admitted requests to the target named by `X-Proxy-To`.
//!
//! # Overview
//!
//! The forwarder owns the upstream HTTP(S) client. Given an admitted request
//! and its buffered body it:
//!
//! 1. Rewrites the request for the target (`Host`, hop-by-hop headers)
//! 2. Sends it, bounded by the total upstream timeout
//! 3. Streams the response back wrapped in [`ExchangeBody`], which finalizes
//!    the exchange when the stream ends
//!
//! Failures before a response arrives finalize the exchange here.
//!
//! # Target resolution
//!
//! `X-Proxy-To` carries an absolute `http`/`https` URL. When the inbound
//! request is for `/` with no query string the target URL is used verbatim.
//! Otherwise the inbound path is appended to the target path and the query
//! strings are concatenated.

use crate::admission::Admission;
use crate::audit::{Outcome, ResponseMeta};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::exchange::ExchangeCompletion;
use crate::exchange_body::{ExchangeBody, ProxyBody};
use crate::timeout::{TimeoutBody, UpstreamTimeouts};
use bytes::Bytes;
use http::request::Parts;
use http::{HeaderMap, HeaderValue, Request, Response, Uri, header};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Header naming the absolute URL the request is relayed to.
pub const PROXY_TO_HEADER: &str = "x-proxy-to";

/// Check if a header is a hop-by-hop header (RFC 7230 Section 6.1).
///
/// Hop-by-hop headers describe one connection and are never relayed.
pub fn is_hop_by_hop_header(name: &str) -> bool {
    const HOP_BY_HOP: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "proxy-connection",
        "te",
        "trailer",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ];
    HOP_BY_HOP
        .iter()
        .any(|&hop| name.eq_ignore_ascii_case(hop))
}

/// Headers the proxy consumes or recomputes instead of relaying.
fn is_consumed_header(name: &str) -> bool {
    name.eq_ignore_ascii_case(PROXY_TO_HEADER)
        || name.eq_ignore_ascii_case(header::HOST.as_str())
        || name.eq_ignore_ascii_case(header::CONTENT_LENGTH.as_str())
}

/// Resolve the upstream URI for a request.
///
/// # Errors
///
/// - `ProxyError::NoTarget` if the header is missing or blank
/// - `ProxyError::InvalidTarget` if it is not an absolute http(s) URL
pub fn resolve_target(headers: &HeaderMap, inbound: &Uri) -> ProxyResult<Uri> {
    let raw = match headers.get(PROXY_TO_HEADER) {
        Some(value) => value
            .to_str()
            .map_err(|_| ProxyError::InvalidTarget("X-Proxy-To is not valid ASCII".into()))?
            .trim(),
        None => return Err(ProxyError::NoTarget),
    };
    if raw.is_empty() {
        return Err(ProxyError::NoTarget);
    }

    let mut url =
        Url::parse(raw).map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ProxyError::InvalidTarget(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ProxyError::InvalidTarget(format!("{}: missing host", raw)));
    }
    url.set_fragment(None);

    let inbound_path = inbound.path();
    let inbound_query = inbound.query().filter(|q| !q.is_empty());
    if inbound_path != "/" || inbound_query.is_some() {
        let joined_path = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            inbound_path.trim_start_matches('/')
        );
        url.set_path(&joined_path);

        let joined_query = match (url.query().filter(|q| !q.is_empty()), inbound_query) {
            (Some(target), Some(inbound)) => Some(format!("{}&{}", target, inbound)),
            (Some(target), None) => Some(target.to_string()),
            (None, inbound) => inbound.map(str::to_string),
        };
        url.set_query(joined_query.as_deref());
    }

    url.as_str()
        .parse::<Uri>()
        .map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", raw, e)))
}

/// Build the request sent to the target.
///
/// Method and end-to-end headers are kept. `Host` is rewritten to the target
/// authority and `Content-Length` is recomputed from `body`.
///
/// # Errors
///
/// Returns `ProxyError::InvalidTarget` if the target has no authority or the
/// request cannot be assembled.
pub fn build_upstream_request(
    parts: &Parts,
    target: &Uri,
    body: Bytes,
) -> ProxyResult<Request<Full<Bytes>>> {
    let authority = target
        .authority()
        .ok_or_else(|| ProxyError::InvalidTarget(format!("{}: missing authority", target)))?;
    let host = HeaderValue::from_str(authority.as_str())
        .map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", target, e)))?;

    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(target.clone());

    if let Some(headers) = builder.headers_mut() {
        for (name, value) in &parts.headers {
            let name_str = name.as_str();
            if is_hop_by_hop_header(name_str) || is_consumed_header(name_str) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        headers.insert(header::HOST, host);
    }

    builder
        .body(Full::new(body))
        .map_err(|e| ProxyError::InvalidTarget(format!("Failed to build upstream request: {}", e)))
}

/// Upstream HTTP(S) client plus the rules for relaying one exchange.
#[derive(Clone)]
pub struct Forwarder {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeouts: UpstreamTimeouts,
    audit_body_max: usize,
}

impl Forwarder {
    /// Create a forwarder with TLS support.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Internal` if:
    /// - TLS crypto provider installation fails
    /// - Native TLS root certificates cannot be loaded
    pub fn new(config: &ProxyConfig) -> ProxyResult<Self> {
        // The provider is process-global; install it once and remember the result.
        static RUSTLS_INIT: std::sync::OnceLock<Result<(), ()>> = std::sync::OnceLock::new();
        let init_result = RUSTLS_INIT.get_or_init(|| {
            rustls::crypto::ring::default_provider()
                .install_default()
                .map_err(|_| ())
        });
        if init_result.is_err() && rustls::crypto::CryptoProvider::get_default().is_none() {
            return Err(ProxyError::Internal(
                "Failed to install rustls crypto provider".into(),
            ));
        }

        let mut http_connector = HttpConnector::new();
        http_connector.set_nodelay(config.tcp_nodelay);
        http_connector.enforce_http(false);
        if config.tcp_keepalive_secs > 0 {
            http_connector.set_keepalive(Some(Duration::from_secs(config.tcp_keepalive_secs)));
        }

        let https_connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| ProxyError::Internal(format!("Failed to load native TLS roots: {}", e)))?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .http1_preserve_header_case(true)
            .http1_allow_obsolete_multiline_headers_in_responses(true)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(https_connector);

        Ok(Self {
            client,
            timeouts: UpstreamTimeouts::new(
                config.upstream_idle_timeout,
                config.upstream_total_timeout,
            ),
            audit_body_max: config.audit_body_max,
        })
    }

    /// Timeouts applied to the upstream leg.
    pub fn timeouts(&self) -> UpstreamTimeouts {
        self.timeouts
    }

    /// Relay an admitted request and stream the answer back.
    ///
    /// On success the returned body owns `completion` and finalizes it when
    /// the stream terminates. On error `completion` has already been finalized
    /// and the caller only renders the error.
    ///
    /// # Errors
    ///
    /// - `ProxyError::Upstream` on connect or protocol failure
    /// - `ProxyError::Timeout` if no response head arrives in time
    /// - `ProxyError::InvalidTarget` if the upstream request cannot be built
    pub async fn forward(
        &self,
        admission: &Admission,
        target: Uri,
        parts: Parts,
        body: Bytes,
        mut completion: ExchangeCompletion,
    ) -> ProxyResult<Response<ProxyBody>> {
        match self.send(&target, &parts, body).await {
            Ok(upstream) => {
                let (upstream_parts, upstream_body) = upstream.into_parts();
                info!(
                    request_id = %admission.id,
                    target = %target,
                    status = upstream_parts.status.as_u16(),
                    "Upstream responded"
                );

                let mut response = Response::new(());
                *response.status_mut() = upstream_parts.status;
                for (name, value) in &upstream_parts.headers {
                    if !is_hop_by_hop_header(name.as_str()) {
                        response.headers_mut().append(name.clone(), value.clone());
                    }
                }

                let meta = ResponseMeta::new(upstream_parts.status, &upstream_parts.headers);
                let body = ExchangeBody::new(
                    TimeoutBody::new(upstream_body, self.timeouts),
                    completion,
                    meta,
                    self.audit_body_max,
                );
                let (response_parts, ()) = response.into_parts();
                Ok(Response::from_parts(response_parts, body.boxed()))
            }
            Err(e) => {
                warn!(
                    request_id = %admission.id,
                    target = %target,
                    error = %e,
                    "Upstream request failed"
                );
                let outcome = match e.outcome() {
                    Outcome::Success => Outcome::UpstreamError,
                    other => other,
                };
                completion.finish(outcome, None, Some(e.audit_message()));
                Err(e)
            }
        }
    }

    async fn send(
        &self,
        target: &Uri,
        parts: &Parts,
        body: Bytes,
    ) -> ProxyResult<Response<hyper::body::Incoming>> {
        let request = build_upstream_request(parts, target, body)?;
        debug!(method = %request.method(), uri = %request.uri(), "Sending upstream request");

        match tokio::time::timeout(self.timeouts.total, self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(ProxyError::Upstream(describe_client_error(&e))),
            Err(_) => Err(ProxyError::Timeout(format!(
                "no response from {} within {:?}",
                target, self.timeouts.total
            ))),
        }
    }
}

/// Flatten a client error and its sources into one line.
fn describe_client_error(err: &hyper_util::client::legacy::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
