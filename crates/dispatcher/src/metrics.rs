//! Sink metrics for observability
//!
//! Every row a sink processes ends in exactly one of `skipped`,
//! `sent_to_output` or `failed`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use metrics::{counter, gauge};

/// Metrics for a single sink
#[derive(Debug)]
pub struct SinkMetrics {
    /// Sink name (metric label)
    name: String,
    /// Current queue length
    queue_len: AtomicUsize,
    /// Rows rejected by the output mode filter
    skipped: AtomicU64,
    /// Rows written by a successful flush
    sent_to_output: AtomicU64,
    /// Rows in batches whose flush failed
    failed: AtomicU64,
}

impl SinkMetrics {
    /// Create new metrics instance
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue_len: AtomicUsize::new(0),
            skipped: AtomicU64::new(0),
            sent_to_output: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get current queue length
    pub fn queue_len(&self) -> usize {
        self.queue_len.load(Ordering::Relaxed)
    }

    /// Set current queue length
    pub fn set_queue_len(&self, len: usize) {
        self.queue_len.store(len, Ordering::Relaxed);
        gauge!("dnscope_sink_queue_len", "sink" => self.name.clone()).set(len as f64);
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn add_skipped(&self, rows: u64) {
        self.skipped.fetch_add(rows, Ordering::Relaxed);
        self.record("skipped", rows);
    }

    pub fn sent_to_output(&self) -> u64 {
        self.sent_to_output.load(Ordering::Relaxed)
    }

    pub fn add_sent(&self, rows: u64) {
        self.sent_to_output.fetch_add(rows, Ordering::Relaxed);
        self.record("sent", rows);
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn add_failed(&self, rows: u64) {
        self.failed.fetch_add(rows, Ordering::Relaxed);
        self.record("failed", rows);
    }

    fn record(&self, outcome: &'static str, rows: u64) {
        counter!("dnscope_sink_rows_total", "sink" => self.name.clone(), "outcome" => outcome)
            .increment(rows);
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queue_len: self.queue_len(),
            skipped: self.skipped(),
            sent_to_output: self.sent_to_output(),
            failed: self.failed(),
        }
    }
}

/// Snapshot of sink metrics (for reporting)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub queue_len: usize,
    pub skipped: u64,
    pub sent_to_output: u64,
    pub failed: u64,
}

impl MetricsSnapshot {
    /// Rows with a final outcome
    pub fn processed(&self) -> u64 {
        self.skipped + self.sent_to_output + self.failed
    }
}
