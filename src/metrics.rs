//! Metrics for the admission queue, rate gate and audit pipeline.
//!
//! Instruments are created from an OpenTelemetry `Meter` once at startup and
//! exported through the Prometheus registry. Call sites fetch the global
//! instance with [`get_metrics`] and skip recording when it is not set
//! (tests, or the `metrics` feature disabled).

use crate::audit::Outcome;
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
use std::sync::Arc;
use std::time::Duration;

/// Metrics collector for admission and auditing.
#[derive(Clone)]
pub struct AdmissionMetrics {
    /// Requests currently queued or being forwarded
    pub queue_depth: UpDownCounter<i64>,
    /// Requests released by the rate gate
    pub released_total: Counter<u64>,
    /// Time from joining the gate to release
    pub admission_wait_seconds: Histogram<f64>,
    /// Terminal exchanges by outcome
    pub exchanges_total: Counter<u64>,
    /// Audit records dropped by a full shipping buffer
    pub audit_dropped_total: Counter<u64>,
    /// Audit batches that could not be delivered
    pub audit_delivery_failures_total: Counter<u64>,
}

impl AdmissionMetrics {
    /// Create new metrics collector.
    pub fn new(meter: &Meter) -> Self {
        Self {
            queue_depth: meter
                .i64_up_down_counter("pacegate_queue_depth")
                .with_description("Requests currently in the admission queue")
                .build(),
            released_total: meter
                .u64_counter("pacegate_released_total")
                .with_description("Requests released to the forwarder")
                .build(),
            admission_wait_seconds: meter
                .f64_histogram("pacegate_admission_wait_seconds")
                .with_description("Time spent waiting for release")
                .build(),
            exchanges_total: meter
                .u64_counter("pacegate_exchanges_total")
                .with_description("Completed exchanges by outcome")
                .build(),
            audit_dropped_total: meter
                .u64_counter("pacegate_audit_dropped_total")
                .with_description("Audit records dropped before shipping")
                .build(),
            audit_delivery_failures_total: meter
                .u64_counter("pacegate_audit_delivery_failures_total")
                .with_description("Audit batches that failed delivery")
                .build(),
        }
    }

    /// Adjust the queue depth gauge.
    pub fn queue_depth_changed(&self, delta: i64) {
        self.queue_depth.add(delta, &[]);
    }

    /// Record one release and how long it waited.
    pub fn record_release(&self, waited: Duration) {
        self.released_total.add(1, &[]);
        self.admission_wait_seconds.record(waited.as_secs_f64(), &[]);
    }

    /// Record a terminal exchange.
    pub fn record_exchange(&self, outcome: Outcome) {
        self.exchanges_total
            .add(1, &[KeyValue::new("outcome", outcome.as_str())]);
    }

    /// Record audit records dropped locally.
    pub fn record_audit_dropped(&self, count: u64) {
        self.audit_dropped_total.add(count, &[]);
    }

    /// Record a failed delivery attempt to the remote sink.
    pub fn record_audit_delivery_failure(&self) {
        self.audit_delivery_failures_total.add(1, &[]);
    }
}

/// Global metrics instance.
static METRICS: std::sync::OnceLock<Arc<AdmissionMetrics>> = std::sync::OnceLock::new();

/// Initialize global metrics.
pub fn init_metrics(meter: &Meter) {
    let _ = METRICS.set(Arc::new(AdmissionMetrics::new(meter)));
}

/// Get global metrics instance.
pub fn get_metrics() -> Option<Arc<AdmissionMetrics>> {
    METRICS.get().cloned()
}
