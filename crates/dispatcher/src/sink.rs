//! OutputSink - sink registration contract

use std::sync::Arc;

use async_channel::Receiver;
use contracts::DnsResult;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::DispatcherError;
use crate::metrics::SinkMetrics;

/// Everything a sink's workers need, handed over by `initialize`
pub struct SinkContext {
    /// Sink input queue, shared by all workers of the sink
    pub queue: Receiver<Arc<DnsResult>>,

    /// Process-wide cancellation signal
    pub shutdown: watch::Receiver<bool>,

    /// Outcome counters
    pub metrics: Arc<SinkMetrics>,
}

/// Output sink trait
///
/// `initialize` is called once, from inside the runtime, and must not
/// block: it spawns the sink's workers and returns their handles. Backend
/// setup (connecting, creating tables) belongs inside the workers.
///
/// # Errors
/// `DispatcherError::SinkInit` when the sink is disabled or misconfigured.
/// The dispatcher then drops the sink for the rest of the run.
pub trait OutputSink: Send + Sync {
    /// Sink name (used for logging/metrics)
    fn name(&self) -> &str;

    /// Spawn the worker pool
    fn initialize(self: Box<Self>, ctx: SinkContext) -> Result<Vec<JoinHandle<()>>, DispatcherError>;
}

/// Resolves once `shutdown` is set; never resolves if the sender is gone
/// without having signalled.
pub async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
