//! Response body that finalizes its exchange when the stream terminates.

use crate::audit::record::body_text;
use crate::audit::{Outcome, ResponseMeta};
use crate::error::BoxError;
use crate::exchange::ExchangeCompletion;
use bytes::{Bytes, BytesMut};
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::BoxBody;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Body type of every response the proxy sends.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// Message recorded when the caller stops reading before the end.
pub const DISCONNECTED_MESSAGE: &str = "caller disconnected before response completed";

/// Upstream body wrapper that copies a prefix for the audit record.
///
/// Terminal events map to outcomes:
/// - end of stream: `success`
/// - stream error (including upstream timeouts): `upstream-error`
/// - dropped early: `internal-error` (the caller went away)
pub struct ExchangeBody<B> {
    inner: B,
    completion: ExchangeCompletion,
    response: Option<ResponseMeta>,
    captured: BytesMut,
    total: usize,
    limit: usize,
    /// Inner body reported end of stream; hyper may drop us without a final poll.
    ended: bool,
}

impl<B: Body> ExchangeBody<B> {
    /// Wrap an upstream body.
    ///
    /// `limit` is the number of body bytes copied into the audit record.
    pub fn new(inner: B, completion: ExchangeCompletion, response: ResponseMeta, limit: usize) -> Self {
        let ended = inner.is_end_stream();
        Self {
            inner,
            completion,
            response: Some(response),
            captured: BytesMut::new(),
            total: 0,
            limit,
            ended,
        }
    }
}

impl<B> ExchangeBody<B> {
    fn capture(&mut self, data: &Bytes) {
        self.total += data.len();
        let room = self.limit.saturating_sub(self.captured.len());
        if room > 0 {
            self.captured
                .extend_from_slice(&data[..data.len().min(room)]);
        }
    }

    fn complete(&mut self, outcome: Outcome, error: Option<String>) {
        let response = self.response.take().map(|mut meta| {
            meta.body = body_text(&self.captured, self.total, self.limit);
            meta
        });
        self.completion.finish(outcome, response, error);
    }
}

impl<B> Body for ExchangeBody<B>
where
    B: Body<Data = Bytes, Error = BoxError> + Unpin,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.capture(data);
                }
                if this.inner.is_end_stream() {
                    this.ended = true;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.complete(Outcome::UpstreamError, Some(e.to_string()));
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.ended = true;
                this.complete(Outcome::Success, None);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for ExchangeBody<B> {
    fn drop(&mut self) {
        if self.completion.is_finished() {
            return;
        }
        if self.ended {
            self.complete(Outcome::Success, None);
        } else {
            self.complete(Outcome::InternalError, Some(DISCONNECTED_MESSAGE.to_string()));
        }
    }
}
