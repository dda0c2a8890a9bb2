//! Capture pipeline: backend selection and the blocking read loops

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_channel::Sender;
use contracts::{CaptureConfig, CaptureMode, CaptureStats, DnsResult};
use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::decode::decode;
use crate::error::{CaptureError, Result};
use crate::handle::CaptureHandle;
use crate::{FastRingCapture, LivePcap};

/// Open the backend selected by `config.mode` and install its filter
///
/// There is no fallback: a mode this build cannot serve fails with
/// `CapabilityUnsupported`.
#[instrument(name = "capture_open", skip(config), fields(device = %config.device, mode = config.mode.as_str()))]
pub fn open(config: &CaptureConfig) -> Result<Box<dyn CaptureHandle>> {
    let mut handle: Box<dyn CaptureHandle> = match config.mode {
        CaptureMode::Live => Box::new(LivePcap::open(config)?),
        CaptureMode::FastRing => Box::new(FastRingCapture::open(config)?),
    };
    install_filter(handle.as_mut(), &config.filter)?;
    Ok(handle)
}

/// Install `expression` on `handle`; an empty expression captures everything
///
/// On failure the handle is closed before the error is returned.
pub fn install_filter(handle: &mut dyn CaptureHandle, expression: &str) -> Result<()> {
    if expression.trim().is_empty() {
        warn!(device = %handle.device(), "no capture filter configured");
        return Ok(());
    }
    if let Err(e) = handle.set_filter(expression) {
        handle.close();
        return Err(e);
    }
    info!(device = %handle.device(), filter = expression, "capture filter installed");
    Ok(())
}

/// Read loop counters shared by every device
#[derive(Debug, Default)]
pub struct CaptureMetrics {
    /// Frames returned by the backends
    pub frames_read: AtomicU64,

    /// Frames decoded into results
    pub decoded: AtomicU64,

    /// Frames the decoder rejected
    pub decode_errors: AtomicU64,
}

impl CaptureMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CaptureMetricsSnapshot {
        CaptureMetricsSnapshot {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

/// Capture metrics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureMetricsSnapshot {
    pub frames_read: u64,
    pub decoded: u64,
    pub decode_errors: u64,
}

/// Why a read loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Shutdown signal observed
    Cancelled,
    /// Downstream channel closed
    ChannelClosed,
    /// Backend read failed
    ReadError(String),
}

/// Result of one finished read loop
#[derive(Debug, Clone)]
pub struct CaptureSummary {
    pub device: String,
    pub exit: LoopExit,
    pub stats: CaptureStats,
}

/// Drive one handle until cancellation, channel close or a read error
///
/// Blocks the calling thread; run it through `spawn_blocking`. A send
/// blocks while the dispatcher input is full and is released when the
/// dispatcher drops its receiver on shutdown.
pub fn run_capture_loop(
    mut handle: Box<dyn CaptureHandle>,
    tx: Sender<Arc<DnsResult>>,
    shutdown: watch::Receiver<bool>,
    stats_interval: Duration,
    metrics: Arc<CaptureMetrics>,
) -> CaptureSummary {
    let device = handle.device().to_string();
    let link_type = handle.link_type();
    let mut reporter = StatsReporter::new(&device);
    let mut last_report = Instant::now();

    info!(device = %device, link_type = ?link_type, "capture loop started");

    let exit = loop {
        if *shutdown.borrow() {
            break LoopExit::Cancelled;
        }
        if last_report.elapsed() >= stats_interval {
            reporter.report(handle.as_mut());
            last_report = Instant::now();
        }

        let result = match handle.read_zero_copy() {
            Ok((frame, info)) => {
                metrics.frames_read.fetch_add(1, Ordering::Relaxed);
                decode(link_type, frame, &info)
            }
            Err(CaptureError::Timeout) => continue,
            Err(e) => {
                error!(device = %device, error = %e, "capture read failed");
                break LoopExit::ReadError(e.to_string());
            }
        };

        match result {
            Ok(result) => {
                metrics.decoded.fetch_add(1, Ordering::Relaxed);
                if tx.send_blocking(Arc::new(result)).is_err() {
                    debug!(device = %device, "result channel closed");
                    break LoopExit::ChannelClosed;
                }
            }
            Err(e) => {
                metrics.decode_errors.fetch_add(1, Ordering::Relaxed);
                counter!("dnscope_decode_errors_total", "device" => device.clone()).increment(1);
                trace!(device = %device, error = %e, "frame skipped");
            }
        }
    };

    let stats = reporter.report(handle.as_mut());
    handle.close();
    info!(device = %device, exit = ?exit, packets = stats.packets_read, dropped = stats.packets_dropped, "capture loop stopped");

    CaptureSummary { device, exit, stats }
}

/// Logs backend statistics and forwards deltas to the metrics registry
struct StatsReporter {
    device: String,
    last: CaptureStats,
}

impl StatsReporter {
    fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            last: CaptureStats::default(),
        }
    }

    fn report(&mut self, handle: &mut dyn CaptureHandle) -> CaptureStats {
        let stats = match handle.stats() {
            Ok(stats) => stats,
            Err(e) => {
                warn!(device = %self.device, error = %e, "capture statistics unavailable");
                return CaptureStats::default();
            }
        };
        counter!("dnscope_capture_packets_total", "device" => self.device.clone())
            .increment(stats.packets_read.saturating_sub(self.last.packets_read));
        counter!("dnscope_capture_dropped_total", "device" => self.device.clone())
            .increment(stats.packets_dropped.saturating_sub(self.last.packets_dropped));
        info!(
            device = %self.device,
            packets = stats.packets_read,
            dropped = stats.packets_dropped,
            "capture statistics"
        );
        self.last = stats;
        stats
    }
}

/// Capture Pipeline
///
/// Owns the opened handles until `start_all` moves each onto its own
/// blocking thread.
pub struct CapturePipeline {
    handles: Vec<Box<dyn CaptureHandle>>,
    metrics: Arc<CaptureMetrics>,
    stats_interval: Duration,
}

impl CapturePipeline {
    pub fn new(stats_interval: Duration) -> Self {
        Self {
            handles: Vec::new(),
            metrics: Arc::new(CaptureMetrics::new()),
            stats_interval,
        }
    }

    /// Open every configured device; the first failure aborts startup
    #[instrument(name = "capture_open_all", skip(self, configs), fields(count = configs.len()))]
    pub fn open_all(&mut self, configs: &[CaptureConfig]) -> Result<()> {
        for config in configs {
            let handle = match open(config) {
                Ok(handle) => handle,
                Err(e) => {
                    for handle in &mut self.handles {
                        handle.close();
                    }
                    return Err(e);
                }
            };
            self.register(handle);
        }
        Ok(())
    }

    /// Register an already opened handle
    pub fn register(&mut self, handle: Box<dyn CaptureHandle>) {
        debug!(device = %handle.device(), "registered capture handle");
        self.handles.push(handle);
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub fn metrics(&self) -> Arc<CaptureMetrics> {
        self.metrics.clone()
    }

    /// Spawn one blocking read loop per handle
    #[instrument(name = "capture_start_all", skip_all, fields(count = self.handles.len()))]
    pub fn start_all(
        self,
        tx: Sender<Arc<DnsResult>>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<CaptureSummary>> {
        self.handles
            .into_iter()
            .map(|handle| {
                let tx = tx.clone();
                let shutdown = shutdown.clone();
                let metrics = self.metrics.clone();
                let interval = self.stats_interval;
                tokio::task::spawn_blocking(move || {
                    run_capture_loop(handle, tx, shutdown, interval, metrics)
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tests::{dns_query, udp4_dns_frame};
    use crate::MockCapture;
    use contracts::CaptureInfo;
    use std::sync::atomic::AtomicBool;

    fn mock_with_queries(n: u16) -> MockCapture {
        let mut cap = MockCapture::new("loop0");
        for i in 0..n {
            cap.inject(udp4_dns_frame(40000 + i, 53, &dns_query(i, "example.com", 1, None)));
        }
        cap
    }

    /// Records `close` calls on the wrapped handle
    struct CloseProbe {
        inner: MockCapture,
        closed: Arc<AtomicBool>,
    }

    impl CaptureHandle for CloseProbe {
        fn device(&self) -> &str {
            self.inner.device()
        }
        fn read_zero_copy(&mut self) -> Result<(&[u8], CaptureInfo)> {
            self.inner.read_zero_copy()
        }
        fn set_filter(&mut self, expression: &str) -> Result<()> {
            self.inner.set_filter(expression)
        }
        fn stats(&mut self) -> Result<CaptureStats> {
            self.inner.stats()
        }
        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
            self.inner.close();
        }
    }

    #[test]
    fn test_loop_decodes_and_forwards() {
        let (tx, rx) = async_channel::bounded(16);
        let (_stop, shutdown) = watch::channel(false);
        let metrics = Arc::new(CaptureMetrics::new());

        let mut cap = mock_with_queries(3);
        cap.inject(vec![0u8; 20]);
        let summary = run_capture_loop(
            Box::new(cap),
            tx,
            shutdown,
            Duration::from_secs(60),
            metrics.clone(),
        );

        assert!(matches!(summary.exit, LoopExit::ReadError(_)));
        assert_eq!(summary.stats.packets_read, 4);
        assert_eq!(rx.len(), 3);
        let first = rx.try_recv().unwrap();
        assert_eq!(first.src_port, 40000);
        assert_eq!(
            metrics.snapshot(),
            CaptureMetricsSnapshot {
                frames_read: 4,
                decoded: 3,
                decode_errors: 1
            }
        );
    }

    #[test]
    fn test_loop_observes_cancellation_and_closes_handle() {
        let (tx, _rx) = async_channel::bounded(16);
        let (stop, shutdown) = watch::channel(false);
        let closed = Arc::new(AtomicBool::new(false));
        let probe = CloseProbe {
            inner: MockCapture::new("loop0").keep_open(),
            closed: closed.clone(),
        };

        let worker = std::thread::spawn(move || {
            run_capture_loop(
                Box::new(probe),
                tx,
                shutdown,
                Duration::from_secs(60),
                Arc::new(CaptureMetrics::new()),
            )
        });
        stop.send(true).unwrap();
        let summary = worker.join().unwrap();

        assert_eq!(summary.exit, LoopExit::Cancelled);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_loop_stops_when_channel_closes() {
        let (tx, rx) = async_channel::bounded(1);
        drop(rx);
        let (_stop, shutdown) = watch::channel(false);
        let summary = run_capture_loop(
            Box::new(mock_with_queries(2)),
            tx,
            shutdown,
            Duration::from_secs(60),
            Arc::new(CaptureMetrics::new()),
        );
        assert_eq!(summary.exit, LoopExit::ChannelClosed);
    }

    #[test]
    fn test_stats_failure_is_not_fatal() {
        let (tx, rx) = async_channel::bounded(16);
        let (_stop, shutdown) = watch::channel(false);
        let summary = run_capture_loop(
            Box::new(mock_with_queries(2).fail_stats(true)),
            tx,
            shutdown,
            Duration::ZERO,
            Arc::new(CaptureMetrics::new()),
        );
        assert!(matches!(summary.exit, LoopExit::ReadError(_)));
        assert_eq!(summary.stats, CaptureStats::default());
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn test_failed_filter_closes_handle() {
        let closed = Arc::new(AtomicBool::new(false));
        let mut probe = CloseProbe {
            inner: MockCapture::new("loop0"),
            closed: closed.clone(),
        };
        let err = install_filter(&mut probe, "this is not a filter (").unwrap_err();
        assert!(matches!(err, CaptureError::Filter { .. }));
        assert!(err.is_fatal());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_empty_filter_is_accepted() {
        let mut cap = MockCapture::new("loop0");
        install_filter(&mut cap, "  ").unwrap();
        assert!(!cap.is_closed());
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn test_fast_ring_is_unsupported_off_linux() {
        let mut config = CaptureConfig::new("eth0");
        config.mode = CaptureMode::FastRing;
        assert!(matches!(
            open(&config),
            Err(CaptureError::CapabilityUnsupported { backend: "fast_ring" })
        ));
    }

    #[cfg(not(feature = "pcap"))]
    #[test]
    fn test_live_is_unsupported_without_pcap() {
        let config = CaptureConfig::new("eth0");
        assert!(matches!(
            open(&config),
            Err(CaptureError::CapabilityUnsupported { backend: "live" })
        ));
    }

    #[tokio::test]
    async fn test_pipeline_runs_registered_handles() {
        let (tx, rx) = async_channel::bounded(16);
        let (_stop, shutdown) = watch::channel(false);
        let mut pipeline = CapturePipeline::new(Duration::from_secs(60));
        pipeline.register(Box::new(mock_with_queries(2)));
        pipeline.register(Box::new(mock_with_queries(3)));
        assert_eq!(pipeline.handle_count(), 2);

        let metrics = pipeline.metrics();
        let tasks = pipeline.start_all(tx, shutdown);
        for task in tasks {
            let summary = task.await.unwrap();
            assert_eq!(summary.device, "loop0");
        }
        assert_eq!(rx.len(), 5);
        assert_eq!(metrics.snapshot().decoded, 5);
    }
}
