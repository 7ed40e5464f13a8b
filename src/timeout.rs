//! Timeouts for upstream response bodies.
//!
//! The queue head stays in flight until its response stream ends, so an
//! upstream that stops sending would stall every request behind it. Wrapping
//! the upstream body in [`TimeoutBody`] turns a stall into a stream error.

use crate::error::BoxError;
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep, sleep_until};

/// Deadlines applied to the upstream leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamTimeouts {
    /// Longest gap between two frames
    pub idle: Duration,
    /// Longest lifetime of the whole body
    pub total: Duration,
}

impl UpstreamTimeouts {
    /// Create a new timeout configuration.
    pub fn new(idle: Duration, total: Duration) -> Self {
        Self { idle, total }
    }
}

/// Body wrapper that fails the stream when a deadline passes.
///
/// The idle deadline is pushed forward every time a frame arrives; the total
/// deadline is fixed when the wrapper is created.
pub struct TimeoutBody<B> {
    inner: B,
    timeouts: UpstreamTimeouts,
    idle_deadline: Pin<Box<Sleep>>,
    total_deadline: Pin<Box<Sleep>>,
    expired: bool,
}

impl<B> TimeoutBody<B> {
    /// Wrap `inner`; both clocks start now.
    pub fn new(inner: B, timeouts: UpstreamTimeouts) -> Self {
        let now = Instant::now();
        Self {
            inner,
            timeouts,
            idle_deadline: Box::pin(sleep_until(deadline_after(now, timeouts.idle))),
            total_deadline: Box::pin(sleep_until(deadline_after(now, timeouts.total))),
            expired: false,
        }
    }

    /// The deadlines in force.
    pub fn timeouts(&self) -> UpstreamTimeouts {
        self.timeouts
    }

    fn timed_out(&mut self, what: &str, after: Duration) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        self.expired = true;
        Poll::Ready(Some(Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("Upstream {} timeout exceeded ({:?})", what, after),
        )
        .into())))
    }
}

/// `now + after`, saturating at roughly 30 years out.
fn deadline_after(now: Instant, after: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);
    now.checked_add(after.min(FAR_FUTURE))
        .unwrap_or_else(|| now + FAR_FUTURE)
}

impl<B> Body for TimeoutBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        if this.expired {
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                let next_idle = deadline_after(Instant::now(), this.timeouts.idle);
                this.idle_deadline.as_mut().reset(next_idle);
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e.into()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => {
                if this.total_deadline.as_mut().poll(cx).is_ready() {
                    let total = this.timeouts.total;
                    return this.timed_out("total", total);
                }
                if this.idle_deadline.as_mut().poll(cx).is_ready() {
                    let idle = this.timeouts.idle;
                    return this.timed_out("idle", idle);
                }
                Poll::Pending
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.expired || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
