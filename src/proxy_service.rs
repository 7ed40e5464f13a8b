//! Core proxy service.
//!
//! # Request Flow
//!
//! ```text
//! Request ──► join queue ──► buffer body ──► resolve X-Proxy-To
//!                 │               │                  │
//!              full: 503     too big: 413      missing: 503 / invalid: 502
//!                                                    │
//!                                                    ▼
//!                                           RateGate::admit()
//!                                                    │
//!                                                    ▼
//!                                          Forwarder::forward() ──► response
//! ```
//!
//! Every path that leaves the queue does so through the exchange's
//! [`ExchangeCompletion`], so the slot is reclaimed and the audit record
//! emitted exactly once.

use crate::admission::{AdmissionQueue, RateGate, RequestId};
use crate::audit::{AuditSink, ExchangeRecord, RequestMeta};
use crate::config::ProxyConfig;
use crate::error::{BoxError, ProxyError, ProxyResult};
use crate::exchange::{ExchangeCompletion, Unfinished};
use crate::exchange_body::ProxyBody;
use crate::forwarder::{Forwarder, resolve_target};
use crate::metrics;
use bytes::Bytes;
use futures_util::FutureExt;
use http_body::Body;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::{Request, Response};
use std::any::Any;
use std::convert::Infallible;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{Instrument, debug, error, info_span, warn};

/// Proxy service that paces every request through the admission queue.
#[derive(Clone)]
pub struct ProxyService {
    queue: Arc<AdmissionQueue>,
    gate: Arc<RateGate>,
    forwarder: Forwarder,
    sink: Arc<dyn AuditSink>,
    config: Arc<ProxyConfig>,
}

impl ProxyService {
    /// Create a proxy service with its own queue, gate and upstream client.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Internal` if the upstream TLS client cannot be built.
    pub fn new(config: ProxyConfig, sink: Arc<dyn AuditSink>) -> ProxyResult<Self> {
        let forwarder = Forwarder::new(&config)?;
        let queue = Arc::new(AdmissionQueue::with_capacity_limit(config.max_queue_depth));
        let gate = Arc::new(RateGate::new(
            Arc::clone(&queue),
            config.min_interval,
            config.poll_interval,
        ));

        Ok(Self {
            queue,
            gate,
            forwarder,
            sink,
            config: Arc::new(config),
        })
    }

    /// The admission queue shared by all connections.
    pub fn queue(&self) -> &Arc<AdmissionQueue> {
        &self.queue
    }

    /// The rate gate shared by all connections.
    pub fn gate(&self) -> &Arc<RateGate> {
        &self.gate
    }

    /// Runtime configuration.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Handle one inbound request to completion.
    ///
    /// Never fails: every error is rendered as a response. A panic inside the
    /// exchange becomes a 500, and the exchange is finished with the panic
    /// message so its queue slot is reclaimed.
    pub async fn handle_request<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let id = RequestId::new();
        let span = info_span!("exchange", request_id = %id);

        let unfinished = Unfinished::default();
        let result = AssertUnwindSafe(self.run_exchange(id, req, unfinished.clone()))
            .catch_unwind()
            .instrument(span)
            .await;

        match result {
            Ok(response) => response,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(request_id = %id, panic = %message, "Exchange panicked");
                let err = ProxyError::Internal(message);
                if let Some(mut completion) = unfinished.take() {
                    completion.finish(err.outcome(), None, Some(err.audit_message()));
                }
                error_response(&err)
            }
        }
    }

    async fn run_exchange<B>(
        &self,
        id: RequestId,
        req: Request<B>,
        unfinished: Unfinished,
    ) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();
        let request_meta = RequestMeta::new(&parts.method, &parts.uri, &parts.headers);

        let slot = match self.queue.join(id) {
            Ok(slot) => slot,
            Err(e) => {
                let err = ProxyError::from(e);
                warn!(error = %err, depth = self.queue.len(), "Request rejected at admission");
                let record = ExchangeRecord::rejected(
                    id,
                    request_meta,
                    err.outcome(),
                    err.audit_message(),
                );
                self.sink.record(&record);
                if let Some(m) = metrics::get_metrics() {
                    m.record_exchange(record.outcome);
                }
                return error_response(&err);
            }
        };
        let mut completion =
            ExchangeCompletion::new(slot, Arc::clone(&self.sink), request_meta.clone());
        completion.park_on_drop(unfinished);

        // Buffer the request body with stream-level size enforcement.
        let limit = self.config.req_buffer_max;
        let body = match Limited::new(body, limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let err = if e.downcast_ref::<LengthLimitError>().is_some() {
                    ProxyError::BodyTooLarge { limit }
                } else {
                    ProxyError::Internal(format!("Failed to read request body: {}", e))
                };
                return fail(&mut completion, err);
            }
        };
        debug!(size = body.len(), "Buffered request body");
        completion.set_request(request_meta.with_body(&body, self.config.audit_body_max));

        // No upstream call will be made, so there is nothing to pace.
        let target = match resolve_target(&parts.headers, &parts.uri) {
            Ok(target) => target,
            Err(err) => return fail(&mut completion, err),
        };

        let admission = self.gate.admit(id).await;
        completion.mark_released();

        match self
            .forwarder
            .forward(&admission, target, parts, body, completion)
            .await
        {
            Ok(response) => response,
            Err(err) => error_response(&err),
        }
    }
}

/// Finish the exchange with `err` and render it.
fn fail(completion: &mut ExchangeCompletion, err: ProxyError) -> Response<ProxyBody> {
    warn!(error = %err, outcome = err.outcome().as_str(), "Exchange failed before forwarding");
    completion.finish(err.outcome(), None, Some(err.audit_message()));
    error_response(&err)
}

/// Render a [`ProxyError`] with the unified body type.
pub fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    err.to_response()
        .map(|body| body.map_err(|never| match never {}).boxed())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic during request handling".to_string()
    }
}

impl<B> Service<Request<B>> for ProxyService
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle_request(req).await) })
    }
}
