//! dnscope 指标模块
//!
//! 指标由各 crate 直接通过 `metrics` facade 记录；这里负责注册说明文本，
//! 并在进程退出时汇总一次运行摘要。

use std::fmt;
use std::time::Duration;

use metrics::{describe_counter, describe_gauge, Unit};

/// Sink row outcomes, labelled `sink` and `outcome`
pub const SINK_ROWS_TOTAL: &str = "dnscope_sink_rows_total";
/// Sink input queue depth, labelled `sink`
pub const SINK_QUEUE_LEN: &str = "dnscope_sink_queue_len";
/// Packets seen by a capture backend, labelled `device`
pub const CAPTURE_PACKETS_TOTAL: &str = "dnscope_capture_packets_total";
/// Packets dropped by a capture backend, labelled `device`
pub const CAPTURE_DROPPED_TOTAL: &str = "dnscope_capture_dropped_total";
/// Frames the decoder rejected, labelled `device`
pub const DECODE_ERRORS_TOTAL: &str = "dnscope_decode_errors_total";
/// Results accepted by every active sink
pub const RESULTS_DISPATCHED_TOTAL: &str = "dnscope_results_dispatched_total";

/// 注册所有指标的说明
///
/// 在安装 recorder 之后调用，Prometheus 输出中才会带 HELP 行。
pub fn describe_metrics() {
    describe_counter!(
        SINK_ROWS_TOTAL,
        Unit::Count,
        "Question rows per sink by outcome (skipped, sent, failed)"
    );
    describe_gauge!(SINK_QUEUE_LEN, Unit::Count, "Results waiting in a sink input queue");
    describe_counter!(
        CAPTURE_PACKETS_TOTAL,
        Unit::Count,
        "Packets delivered by the capture backend"
    );
    describe_counter!(
        CAPTURE_DROPPED_TOTAL,
        Unit::Count,
        "Packets dropped by the kernel or capture backend"
    );
    describe_counter!(DECODE_ERRORS_TOTAL, Unit::Count, "Captured frames that did not decode");
    describe_counter!(
        RESULTS_DISPATCHED_TOTAL,
        Unit::Count,
        "Decoded results handed to every active sink"
    );
}

/// 单个 capture 设备的运行结果
#[derive(Debug, Clone, Default)]
pub struct CaptureReport {
    pub device: String,
    pub packets_read: u64,
    pub packets_dropped: u64,
    /// Why the read loop stopped
    pub exit: String,
}

/// 单个 sink 的运行结果
#[derive(Debug, Clone, Default)]
pub struct SinkReport {
    pub name: String,
    pub sent: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl SinkReport {
    pub fn processed(&self) -> u64 {
        self.sent + self.skipped + self.failed
    }
}

/// 运行摘要
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub elapsed: Duration,
    /// Frames decoded into results, all devices
    pub decoded: u64,
    /// Frames the decoder rejected, all devices
    pub decode_errors: u64,
    pub captures: Vec<CaptureReport>,
    pub sinks: Vec<SinkReport>,
}

impl RunSummary {
    pub fn new(elapsed: Duration) -> Self {
        Self {
            elapsed,
            ..Default::default()
        }
    }

    pub fn total_packets(&self) -> u64 {
        self.captures.iter().map(|c| c.packets_read).sum()
    }

    pub fn total_dropped(&self) -> u64 {
        self.captures.iter().map(|c| c.packets_dropped).sum()
    }

    /// 内核丢包率 (%)
    pub fn drop_rate(&self) -> f64 {
        let seen = self.total_packets() + self.total_dropped();
        if seen == 0 {
            0.0
        } else {
            self.total_dropped() as f64 / seen as f64 * 100.0
        }
    }

    pub fn total_failed(&self) -> u64 {
        self.sinks.iter().map(|s| s.failed).sum()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== dnscope run summary ===")?;
        writeln!(f, "Elapsed: {:.1}s", self.elapsed.as_secs_f64())?;
        writeln!(
            f,
            "Packets: {} read, {} dropped ({:.2}%)",
            self.total_packets(),
            self.total_dropped(),
            self.drop_rate()
        )?;
        writeln!(f, "Decoded: {} ({} undecodable)", self.decoded, self.decode_errors)?;
        for c in &self.captures {
            writeln!(
                f,
                "  capture {}: read={} dropped={} exit={}",
                c.device, c.packets_read, c.packets_dropped, c.exit
            )?;
        }
        for s in &self.sinks {
            writeln!(
                f,
                "  sink {}: sent={} skipped={} failed={}",
                s.name, s.sent, s.skipped, s.failed
            )?;
        }
        Ok(())
    }
}
