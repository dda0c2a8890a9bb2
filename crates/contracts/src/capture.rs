//! Per-frame capture metadata and cumulative capture counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata produced by a capture backend for every frame read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureInfo {
    /// Kernel (or backend) capture timestamp
    pub timestamp: DateTime<Utc>,

    /// Bytes actually captured (bounded by the snapshot length)
    pub capture_length: u32,

    /// Length of the frame on the wire
    pub length: u32,
}

impl CaptureInfo {
    /// Whether the frame was cut short by the snapshot length
    pub fn is_truncated(&self) -> bool {
        self.capture_length < self.length
    }
}

/// Cumulative capture counters for one handle.
///
/// Both counters are monotonically non-decreasing for the life of the handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStats {
    /// Packets delivered by the backend
    pub packets_read: u64,

    /// Packets the backend dropped (ring full, buffer overrun)
    pub packets_dropped: u64,
}

impl CaptureStats {
    /// Fold a reset-on-read delta into the cumulative counters
    pub fn accumulate(&mut self, read: u64, dropped: u64) {
        self.packets_read = self.packets_read.saturating_add(read);
        self.packets_dropped = self.packets_dropped.saturating_add(dropped);
    }
}
