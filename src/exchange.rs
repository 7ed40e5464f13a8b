//! Exactly-once finalization of a proxied exchange.
//!
//! An [`ExchangeCompletion`] is created as soon as a request holds a queue
//! slot. Whichever code path observes the terminal outcome calls
//! [`ExchangeCompletion::finish`]; if none does (the handler future was
//! dropped), `Drop` finishes it as an internal error. Finishing releases the
//! queue slot and then hands one [`ExchangeRecord`] to the audit sink.
//!
//! A completion attached to an [`Unfinished`] cell is parked there on drop
//! instead, so the code that caught a panic can finish it with the real cause.

use crate::admission::{QueueSlot, RequestId};
use crate::audit::{AuditSink, ExchangeRecord, Outcome, RequestMeta, ResponseMeta};
use crate::metrics;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Message recorded when an exchange is dropped without an outcome.
pub const ABANDONED_MESSAGE: &str = "exchange abandoned before completion";

struct Pending {
    slot: QueueSlot,
    sink: Arc<dyn AuditSink>,
    request: RequestMeta,
    accepted_at: DateTime<Utc>,
    released_at: Option<DateTime<Utc>>,
}

/// Owner of one exchange's queue slot and audit obligation.
pub struct ExchangeCompletion {
    id: RequestId,
    pending: Option<Pending>,
    unfinished: Option<Unfinished>,
}

/// Parking spot for an exchange dropped before it was finished.
///
/// Whatever is still parked when the last clone goes away is finished as
/// abandoned.
#[derive(Clone, Default)]
pub struct Unfinished(Arc<Mutex<Option<ExchangeCompletion>>>);

impl Unfinished {
    /// Take the parked exchange, if any.
    pub fn take(&self) -> Option<ExchangeCompletion> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn park(&self, completion: ExchangeCompletion) {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(completion);
    }
}

impl ExchangeCompletion {
    /// Start tracking an exchange that has just joined the queue.
    pub fn new(slot: QueueSlot, sink: Arc<dyn AuditSink>, request: RequestMeta) -> Self {
        Self {
            id: slot.id(),
            pending: Some(Pending {
                slot,
                sink,
                request,
                accepted_at: Utc::now(),
                released_at: None,
            }),
            unfinished: None,
        }
    }

    /// Park this exchange in `cell` instead of abandoning it on drop.
    pub fn park_on_drop(&mut self, cell: Unfinished) {
        self.unfinished = Some(cell);
    }

    /// The exchange's correlation id.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// True once [`ExchangeCompletion::finish`] has run.
    pub fn is_finished(&self) -> bool {
        self.pending.is_none()
    }

    /// Replace the captured request (e.g. once the body has been buffered).
    pub fn set_request(&mut self, request: RequestMeta) {
        if let Some(pending) = self.pending.as_mut() {
            pending.request = request;
        }
    }

    /// Note that the rate gate released the request.
    pub fn mark_released(&mut self) {
        if let Some(pending) = self.pending.as_mut() {
            pending.released_at = Some(Utc::now());
        }
    }

    /// Terminate the exchange.
    ///
    /// Leaves the queue, then emits the audit record. Only the first call has
    /// any effect; returns `true` if this call finished the exchange.
    pub fn finish(
        &mut self,
        outcome: Outcome,
        response: Option<ResponseMeta>,
        error: Option<String>,
    ) -> bool {
        let Some(pending) = self.pending.take() else {
            return false;
        };

        pending.slot.release();

        let record = ExchangeRecord {
            id: self.id,
            outcome,
            request: pending.request,
            response,
            error,
            accepted_at: pending.accepted_at,
            released_at: pending.released_at,
            finished_at: Utc::now(),
        };
        debug!(
            request_id = %self.id,
            outcome = outcome.as_str(),
            "Exchange finished"
        );
        pending.sink.record(&record);

        if let Some(m) = metrics::get_metrics() {
            m.record_exchange(outcome);
        }
        true
    }
}

impl Drop for ExchangeCompletion {
    fn drop(&mut self) {
        if self.pending.is_none() {
            return;
        }
        if let Some(cell) = self.unfinished.take() {
            cell.park(ExchangeCompletion {
                id: self.id,
                pending: self.pending.take(),
                unfinished: None,
            });
            return;
        }
        self.finish(Outcome::InternalError, None, Some(ABANDONED_MESSAGE.to_string()));
    }
}
