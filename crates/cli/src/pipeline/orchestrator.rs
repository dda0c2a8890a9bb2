//! Pipeline orchestrator - coordinates all components.
//!
//! 启动顺序：metrics → 域名列表 → 打开所有 capture 设备 → 初始化 sinks →
//! 启动 dispatcher 与读循环。
//!
//! 关闭分两级：先停止读循环，dispatcher 在输入耗尽后逐个关闭 sink 队列并
//! 等待最后一批写出；超过 `shutdown_timeout_ms` 仍未结束时再触发强制取消。

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use capture::{CaptureSummary, CapturePipeline, LoopExit};
use contracts::{DnsResult, MonitorBlueprint};
use observability::{CaptureReport, RunSummary, SinkReport};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// The loaded (and overridden) configuration
    pub blueprint: MonitorBlueprint,

    /// Directory relative domain list paths resolve against
    pub config_dir: Option<PathBuf>,

    /// Pipeline timeout (None = run until signalled)
    pub timeout: Option<Duration>,

    /// Metrics server port (None = disabled)
    pub metrics_port: Option<u16>,
}

/// Main pipeline orchestrator
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    /// Create a new pipeline with the given configuration
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Open every configured device and run until `signal` resolves
    pub async fn run<S>(self, signal: S) -> Result<RunSummary>
    where
        S: Future<Output = ()>,
    {
        // Initialize Metrics (optional)
        if let Some(port) = self.config.metrics_port {
            observability::init_metrics_only(port)?;
            info!("Metrics endpoint available on port {}", port);
        }

        let general = &self.config.blueprint.general;
        let mut captures = CapturePipeline::new(general.stats_interval());
        captures
            .open_all(&self.config.blueprint.captures)
            .context("Failed to open capture devices")?;

        info!(devices = captures.handle_count(), "Capture devices opened");
        self.run_with(captures, signal).await
    }

    /// Run with already opened capture handles
    pub async fn run_with<S>(self, captures: CapturePipeline, signal: S) -> Result<RunSummary>
    where
        S: Future<Output = ()>,
    {
        let start_time = Instant::now();
        let blueprint = &self.config.blueprint;
        let general = &blueprint.general;

        let filter = config_loader::load_domain_filter(general, self.config.config_dir.as_deref())
            .context("Failed to load domain lists")?;
        let filter = Arc::new(filter);

        // Setup Dispatcher
        info!("Setting up dispatcher...");
        let (abort_tx, abort_rx) = watch::channel(false);
        if blueprint.sinks.is_empty() {
            warn!("No sinks configured - captured results will be dropped");
        }
        let dispatcher =
            dispatcher::create_dispatcher(&blueprint.sinks, general, filter, abort_rx.clone())
                .context("Failed to create dispatcher")?;

        let sink_metrics = dispatcher.sink_metrics();
        info!(active_sinks = dispatcher.sink_count(), sinks = ?dispatcher.sink_names(), "Dispatcher ready");

        let (results_tx, results_rx) =
            async_channel::bounded::<Arc<DnsResult>>(general.result_queue_capacity);
        let mut dispatcher_handle = dispatcher.spawn(results_rx, abort_rx);

        // Start capture loops
        let capture_metrics = captures.metrics();
        let (stop_tx, stop_rx) = watch::channel(false);
        let capture_tasks = captures.start_all(results_tx, stop_rx);
        info!(loops = capture_tasks.len(), "Capture running");

        let timeout = async {
            match self.config.timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };

        let mut dispatcher_done = false;
        tokio::select! {
            _ = signal => {},
            _ = timeout => {
                if let Some(t) = self.config.timeout {
                    info!(timeout_secs = t.as_secs(), "Pipeline timeout reached");
                }
            },
            res = &mut dispatcher_handle => {
                dispatcher_done = true;
                if let Err(e) = res {
                    error!(error = %e, "Dispatcher task failed");
                }
                warn!("Dispatcher finished before shutdown was requested");
            },
        }

        // Shutdown
        info!("Shutting down pipeline...");
        let _ = stop_tx.send(true);

        let grace = general.shutdown_timeout();
        let summaries = join_captures(capture_tasks, grace, &abort_tx).await;

        if !dispatcher_done {
            // the dispatcher applies its own deadline to the sinks
            match tokio::time::timeout(grace + Duration::from_secs(1), &mut dispatcher_handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Dispatcher task failed"),
                Err(_) => {
                    warn!("Dispatcher missed shutdown deadline, cancelling sinks");
                    let _ = abort_tx.send(true);
                    if let Err(e) = dispatcher_handle.await {
                        error!(error = %e, "Dispatcher task failed");
                    }
                }
            }
        }

        let mut summary = RunSummary::new(start_time.elapsed());
        let decoded = capture_metrics.snapshot();
        summary.decoded = decoded.decoded;
        summary.decode_errors = decoded.decode_errors;
        summary.captures = summaries.into_iter().map(capture_report).collect();
        summary.sinks = sink_metrics
            .iter()
            .map(|m| {
                let snap = m.snapshot();
                SinkReport {
                    name: m.name().to_string(),
                    sent: snap.sent_to_output,
                    skipped: snap.skipped,
                    failed: snap.failed,
                }
            })
            .collect();

        info!(
            duration_secs = summary.elapsed.as_secs_f64(),
            decoded = summary.decoded,
            "Pipeline shutdown complete"
        );
        Ok(summary)
    }
}

/// Wait for every read loop; past `grace` the sinks are cancelled so a
/// loop blocked on a full channel is released
async fn join_captures(
    tasks: Vec<JoinHandle<CaptureSummary>>,
    grace: Duration,
    abort_tx: &watch::Sender<bool>,
) -> Vec<CaptureSummary> {
    let deadline = tokio::time::Instant::now() + grace;
    let mut summaries = Vec::with_capacity(tasks.len());
    for mut task in tasks {
        let joined = match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!("Capture loop still running at shutdown deadline");
                let _ = abort_tx.send(true);
                task.await
            }
        };
        match joined {
            Ok(summary) => summaries.push(summary),
            Err(e) => error!(error = %e, "Capture loop panicked"),
        }
    }
    summaries
}

fn capture_report(summary: CaptureSummary) -> CaptureReport {
    let exit = match summary.exit {
        LoopExit::Cancelled => "cancelled".to_string(),
        LoopExit::ChannelClosed => "channel closed".to_string(),
        LoopExit::ReadError(e) => format!("read error: {e}"),
    };
    CaptureReport {
        device: summary.device,
        packets_read: summary.stats.packets_read,
        packets_dropped: summary.stats.packets_dropped,
        exit,
    }
}
