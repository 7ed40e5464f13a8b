//! Rate gate: releases queued requests in FIFO order with a minimum spacing.
//!
//! A request is released once it is at the head of the admission queue (or
//! alone in it) and at least `min_interval` has passed since the previous
//! release. The release instant is recorded as the new reference point.

use super::{AdmissionQueue, RequestId};
use crate::metrics;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

// ============================================================================
// Rate Gate
// ============================================================================

/// Gate that owns the release clock and decides when the head may go.
pub struct RateGate {
    queue: Arc<AdmissionQueue>,
    clock: Mutex<ReleaseClock>,
    min_interval: Duration,
    poll_interval: Duration,
}

struct ReleaseClock {
    /// Instant of the last release; `None` until the first one
    last_release: Option<Instant>,
    /// Total releases since startup
    releases: u64,
}

/// Proof that a request passed the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// The released request
    pub id: RequestId,
    /// Release instant (the value written to the release clock)
    pub released_at: Instant,
    /// Time spent inside [`RateGate::admit`]
    pub waited: Duration,
}

impl RateGate {
    /// Create a gate over `queue`.
    ///
    /// # Arguments
    ///
    /// * `min_interval` - Minimum spacing between two releases
    /// * `poll_interval` - Upper bound on one wait for queue position
    #[must_use]
    pub fn new(queue: Arc<AdmissionQueue>, min_interval: Duration, poll_interval: Duration) -> Self {
        Self {
            queue,
            clock: Mutex::new(ReleaseClock {
                last_release: None,
                releases: 0,
            }),
            min_interval,
            poll_interval,
        }
    }

    /// The queue this gate releases from.
    pub fn queue(&self) -> &Arc<AdmissionQueue> {
        &self.queue
    }

    /// Configured minimum spacing.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Instant of the most recent release, if any.
    pub fn last_release(&self) -> Option<Instant> {
        self.lock().last_release
    }

    /// Number of requests released so far.
    pub fn releases(&self) -> u64 {
        self.lock().releases
    }

    fn lock(&self) -> MutexGuard<'_, ReleaseClock> {
        self.clock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait until `id` may be forwarded.
    ///
    /// `id` must already be queued. The future is cancel-safe: dropping it
    /// leaves the release clock untouched, and the caller's queue slot takes
    /// care of leaving the queue.
    pub async fn admit(&self, id: RequestId) -> Admission {
        let started = Instant::now();

        self.wait_for_turn(id).await;
        let released_at = self.wait_for_spacing(id).await;

        let waited = released_at.saturating_duration_since(started);
        if let Some(m) = metrics::get_metrics() {
            m.record_release(waited);
        }
        info!(
            request_id = %id,
            waited_ms = waited.as_millis() as u64,
            depth = self.queue.len(),
            "Request released"
        );

        Admission {
            id,
            released_at,
            waited,
        }
    }

    /// Block while other requests are ahead of `id`.
    async fn wait_for_turn(&self, id: RequestId) {
        loop {
            // Register before checking so a removal in between is not lost.
            let removal = self.queue.removal();
            if !self.queue.is_waiting_behind(id) {
                return;
            }

            debug!(
                request_id = %id,
                position = ?self.queue.position(id),
                "Waiting for queue position"
            );
            // The poll interval bounds each wait even if a wakeup is missed.
            let _ = tokio::time::timeout(self.poll_interval, removal).await;
        }
    }

    /// Block until `min_interval` has passed since the last release, then
    /// stamp the release clock.
    async fn wait_for_spacing(&self, id: RequestId) -> Instant {
        loop {
            let wait_time = {
                let mut clock = self.lock();
                let now = Instant::now();

                match clock.last_release {
                    Some(last) if now.duration_since(last) < self.min_interval => {
                        self.min_interval - now.duration_since(last)
                    }
                    _ => {
                        clock.last_release = Some(now);
                        clock.releases += 1;
                        return now;
                    }
                }
            };

            debug!(
                request_id = %id,
                wait_ms = wait_time.as_millis() as u64,
                "Waiting out minimum spacing"
            );
            tokio::time::sleep(wait_time).await;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
