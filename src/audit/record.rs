//! Exchange records and their wire representation.

use crate::admission::RequestId;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, StatusCode, Uri};
use serde::Serialize;
use std::collections::BTreeMap;

/// Terminal outcome of one proxied exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    /// Upstream answered and the response was relayed in full.
    Success,
    /// The caller did not name a target.
    NoTarget,
    /// The target was unreachable, invalid, or failed mid-stream.
    UpstreamError,
    /// Anything else: body limits, a full queue, a caller that went away, a fault.
    InternalError,
}

impl Outcome {
    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::NoTarget => "no-target",
            Outcome::UpstreamError => "upstream-error",
            Outcome::InternalError => "internal-error",
        }
    }

    /// Returns `true` for [`Outcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// What the caller sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestMeta {
    /// Inbound request URI as received
    pub url: String,
    /// HTTP method
    pub method: String,
    /// Headers, multi-valued headers joined with ", "
    pub headers: BTreeMap<String, String>,
    /// Body as text (lossy UTF-8, truncated)
    pub body: String,
}

impl RequestMeta {
    /// Capture method, URI and headers. The body is attached later.
    pub fn new(method: &Method, uri: &Uri, headers: &HeaderMap) -> Self {
        Self {
            url: uri.to_string(),
            method: method.to_string(),
            headers: headers_to_map(headers),
            body: String::new(),
        }
    }

    /// Attach (a prefix of) the buffered body.
    #[must_use]
    pub fn with_body(mut self, body: &[u8], limit: usize) -> Self {
        self.body = body_text(body, body.len(), limit);
        self
    }
}

/// What the target answered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResponseMeta {
    /// Upstream status code
    pub status: u16,
    /// Upstream headers
    pub headers: BTreeMap<String, String>,
    /// Body as text (lossy UTF-8, truncated)
    pub body: String,
}

impl ResponseMeta {
    /// Capture status and headers. The body is attached when the stream ends.
    pub fn new(status: StatusCode, headers: &HeaderMap) -> Self {
        Self {
            status: status.as_u16(),
            headers: headers_to_map(headers),
            body: String::new(),
        }
    }
}

/// Audit payload for one completed (or failed) exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRecord {
    /// Correlation id
    pub id: RequestId,
    /// Terminal outcome
    pub outcome: Outcome,
    /// Inbound request
    pub request: RequestMeta,
    /// Upstream response, if one arrived
    pub response: Option<ResponseMeta>,
    /// Error detail for non-success outcomes
    pub error: Option<String>,
    /// When the request was accepted
    pub accepted_at: DateTime<Utc>,
    /// When the rate gate released it, if it got that far
    pub released_at: Option<DateTime<Utc>>,
    /// When the exchange terminated
    pub finished_at: DateTime<Utc>,
}

impl ExchangeRecord {
    /// Build a record for a request that never reached the queue.
    pub fn rejected(id: RequestId, request: RequestMeta, outcome: Outcome, error: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            outcome,
            request,
            response: None,
            error: Some(error),
            accepted_at: now,
            released_at: None,
            finished_at: now,
        }
    }

    /// End-to-end duration in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.accepted_at).num_milliseconds()
    }

    /// Shape shipped to the remote log sink.
    pub fn to_entry(&self) -> AuditEntry {
        AuditEntry {
            id: self.id.to_string(),
            status: if self.outcome.is_success() {
                "success"
            } else {
                "error"
            },
            outcome: self.outcome,
            request: self.request.clone(),
            response: match &self.response {
                Some(meta) => ResponseEntry::Received(meta.clone()),
                None => ResponseEntry::Missing {},
            },
            error: ErrorEntry {
                msg: self.error.clone(),
            },
            timestamp: self.finished_at.to_rfc3339(),
            released_at: self.released_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// Wire form of an [`ExchangeRecord`].
///
/// `{status, request: {url, method, headers, body}, response: {status,
/// headers, body}, error: {msg}}`, with `response` and `error` rendered as
/// empty objects when absent.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Correlation id
    pub id: String,
    /// `success` or `error`
    pub status: &'static str,
    /// Fine-grained outcome
    pub outcome: Outcome,
    /// Inbound request
    pub request: RequestMeta,
    /// Upstream response
    pub response: ResponseEntry,
    /// Error detail
    pub error: ErrorEntry,
    /// RFC 3339 termination time
    pub timestamp: String,
    /// RFC 3339 release time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_at: Option<String>,
}

/// Response part of an [`AuditEntry`].
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ResponseEntry {
    /// Upstream answered
    Received(ResponseMeta),
    /// No response; serialized as `{}`
    Missing {},
}

/// Error part of an [`AuditEntry`].
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    /// Error message, omitted on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

/// Flatten a header map into sorted name -> value strings.
pub fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    map
}

/// Render at most `limit` bytes of a body as text.
///
/// `total` is the full body length, which may exceed `captured.len()` when the
/// caller only kept a prefix.
pub fn body_text(captured: &[u8], total: usize, limit: usize) -> String {
    let kept = &captured[..captured.len().min(limit)];
    let mut text = String::from_utf8_lossy(kept).into_owned();
    if total > kept.len() {
        text.push_str(&format!("...[truncated {} bytes]", total - kept.len()));
    }
    text
}
