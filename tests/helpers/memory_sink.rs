//! In-memory audit sink for assertions.

use pacegate::audit::{AuditSink, ExchangeRecord, Outcome};
use std::sync::Mutex;
use std::time::Duration;

/// Collects every record it is given, in order.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<ExchangeRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the records so far.
    pub fn records(&self) -> Vec<ExchangeRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.records().iter().map(|r| r.outcome).collect()
    }

    /// Wait until at least `count` records arrived, or panic after `timeout`.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<ExchangeRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let records = self.records();
            if records.len() >= count {
                return records;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("expected {count} audit records, got {}", records.len());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl AuditSink for MemorySink {
    fn record(&self, record: &ExchangeRecord) {
        self.records.lock().unwrap().push(record.clone());
    }
}
