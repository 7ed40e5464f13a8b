//! FIFO queue of in-flight requests.
//!
//! The queue holds one entry per accepted-but-not-terminal request. Only the
//! first entry is eligible for release. Each operation is a single short
//! critical section; the lock is never held across an `.await`.

use super::{AdmissionError, RequestId};
use crate::metrics;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A request waiting in (or being served from) the admission queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    /// Correlation id
    pub id: RequestId,
    /// When the request joined the queue
    pub enqueued_at: Instant,
}

/// Ordered set of in-flight request ids.
pub struct AdmissionQueue {
    entries: Mutex<VecDeque<PendingRequest>>,
    /// `None` means unbounded.
    capacity: Option<usize>,
    /// Fired on every successful removal so waiters can re-check their position.
    removed: Notify,
}

impl AdmissionQueue {
    /// Create an unbounded queue.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity_limit(None)
    }

    /// Create a queue that rejects new requests once `capacity` are in flight.
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity_limit(Some(capacity))
    }

    /// Create a queue with an optional bound.
    #[must_use]
    pub fn with_capacity_limit(capacity: Option<usize>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
            removed: Notify::new(),
        }
    }

    // Poison-safe: a panic in another exchange must not wedge the proxy.
    fn lock(&self) -> MutexGuard<'_, VecDeque<PendingRequest>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append `id` to the back of the queue.
    ///
    /// # Errors
    ///
    /// - `AdmissionError::Duplicate` if `id` is already queued
    /// - `AdmissionError::Full` if the configured bound is reached
    pub fn enqueue(&self, id: RequestId) -> Result<PendingRequest, AdmissionError> {
        let pending = {
            let mut entries = self.lock();

            if entries.iter().any(|entry| entry.id == id) {
                warn!(request_id = %id, "Duplicate enqueue rejected");
                return Err(AdmissionError::Duplicate { id });
            }
            if let Some(capacity) = self.capacity {
                if entries.len() >= capacity {
                    return Err(AdmissionError::Full { capacity });
                }
            }

            let pending = PendingRequest {
                id,
                enqueued_at: Instant::now(),
            };
            entries.push_back(pending);
            debug!(request_id = %id, depth = entries.len(), "Request enqueued");
            pending
        };

        if let Some(m) = metrics::get_metrics() {
            m.queue_depth_changed(1);
        }
        Ok(pending)
    }

    /// Enqueue `id` and return a guard that removes it again when dropped.
    ///
    /// # Errors
    ///
    /// Same as [`AdmissionQueue::enqueue`].
    pub fn join(self: &Arc<Self>, id: RequestId) -> Result<QueueSlot, AdmissionError> {
        let pending = self.enqueue(id)?;
        Ok(QueueSlot {
            queue: Arc::clone(self),
            pending,
            released: false,
        })
    }

    /// True iff `id` is the first element.
    pub fn is_head(&self, id: RequestId) -> bool {
        self.lock().front().is_some_and(|entry| entry.id == id)
    }

    /// True if `id` has competitors and is not at the head.
    ///
    /// This is the position check of the rate gate, observed atomically.
    pub fn is_waiting_behind(&self, id: RequestId) -> bool {
        let entries = self.lock();
        entries.len() > 1 && entries.front().is_none_or(|entry| entry.id != id)
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Zero-based position of `id`, if queued.
    pub fn position(&self, id: RequestId) -> Option<usize> {
        self.lock().iter().position(|entry| entry.id == id)
    }

    /// Ids in release order.
    pub fn snapshot(&self) -> Vec<RequestId> {
        self.lock().iter().map(|entry| entry.id).collect()
    }

    /// Remove `id` wherever it is. Removing an absent id is a no-op.
    ///
    /// Returns `true` if an entry was removed.
    pub fn remove(&self, id: RequestId) -> bool {
        let removed = {
            let mut entries = self.lock();
            match entries.iter().position(|entry| entry.id == id) {
                Some(idx) => {
                    entries.remove(idx);
                    debug!(request_id = %id, depth = entries.len(), "Request dequeued");
                    true
                }
                None => false,
            }
        };

        if removed {
            self.removed.notify_waiters();
            if let Some(m) = metrics::get_metrics() {
                m.queue_depth_changed(-1);
            }
        }
        removed
    }

    /// Future that resolves on the next successful removal.
    ///
    /// Create it *before* inspecting the queue so a removal between the check
    /// and the await is not missed.
    pub fn removal(&self) -> Notified<'_> {
        self.removed.notified()
    }
}

impl Default for AdmissionQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Queue Slot
// ============================================================================

/// RAII membership in the admission queue.
///
/// The id is removed on [`QueueSlot::release`] or when the slot is dropped,
/// whichever comes first. Dropping covers cancelled request futures (caller
/// disconnects) so a vanished request can never hold the head forever.
pub struct QueueSlot {
    queue: Arc<AdmissionQueue>,
    pending: PendingRequest,
    released: bool,
}

impl QueueSlot {
    /// The queued request's id.
    pub fn id(&self) -> RequestId {
        self.pending.id
    }

    /// When the request joined the queue.
    pub fn enqueued_at(&self) -> Instant {
        self.pending.enqueued_at
    }

    /// Leave the queue now.
    ///
    /// Returns `true` if this call removed the entry.
    pub fn release(mut self) -> bool {
        self.released = true;
        self.queue.remove(self.pending.id)
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        if !self.released && self.queue.remove(self.pending.id) {
            debug!(request_id = %self.pending.id, "Queue slot reclaimed on drop");
        }
    }
}
