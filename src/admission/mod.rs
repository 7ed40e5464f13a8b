//! Admission control for outbound requests.
//!
//! Every inbound request joins a FIFO [`AdmissionQueue`] and is held by the
//! [`RateGate`] until it is at the head of the queue and the minimum spacing
//! since the previous release has elapsed. The queue slot is reclaimed when
//! the exchange reaches any terminal outcome, including the caller going away.
//!
//! ```text
//! request ──► AdmissionQueue::join() ──► RateGate::admit() ──► Forwarder
//!                    ▲                                             │
//!                    └────────── QueueSlot dropped / released ◄────┘
//! ```

pub mod gate;
pub mod queue;

pub use gate::{Admission, RateGate};
pub use queue::{AdmissionQueue, PendingRequest, QueueSlot};

use serde::Serialize;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Correlation id for one proxied exchange.
///
/// Generated once per inbound request; appears in the queue, in every log line
/// of the exchange and in the audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

/// Errors raised when a request cannot join the admission queue.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// The id is already queued. Ids are random, so this is a bug.
    #[error("Request {id} is already queued")]
    Duplicate {
        /// The offending id
        id: RequestId,
    },

    /// The queue reached its configured bound.
    #[error("Admission queue is full ({capacity} requests in flight)")]
    Full {
        /// Configured bound
        capacity: usize,
    },
}
