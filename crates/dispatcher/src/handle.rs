//! SinkHandle - one registered sink: its queue, metrics and worker tasks

use std::sync::Arc;

use async_channel::{bounded, Receiver, Sender};
use contracts::DnsResult;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, instrument, warn};

use crate::error::DispatcherError;
use crate::metrics::SinkMetrics;
use crate::sink::{OutputSink, SinkContext};

/// Handle to a registered sink
///
/// Holds the sink until `initialize`, then the spawned worker tasks.
pub struct SinkHandle {
    /// Sink name
    name: String,
    /// Producer side of the input queue
    tx: Sender<Arc<DnsResult>>,
    /// Consumer side, handed to the workers on initialize
    rx: Option<Receiver<Arc<DnsResult>>>,
    /// Sink awaiting initialization
    sink: Option<Box<dyn OutputSink>>,
    /// Shared metrics
    metrics: Arc<SinkMetrics>,
    /// Worker task handles
    workers: Vec<JoinHandle<()>>,
}

impl SinkHandle {
    /// Wrap `sink` with a bounded input queue of `queue_capacity`
    pub fn new(sink: Box<dyn OutputSink>, queue_capacity: usize) -> Self {
        let name = sink.name().to_string();
        let (tx, rx) = bounded(queue_capacity.max(1));
        let metrics = Arc::new(SinkMetrics::new(name.clone()));
        Self {
            name,
            tx,
            rx: Some(rx),
            sink: Some(sink),
            metrics,
            workers: Vec::new(),
        }
    }

    /// Get sink name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get current metrics
    pub fn metrics(&self) -> &Arc<SinkMetrics> {
        &self.metrics
    }

    /// Producer side of the input queue
    pub fn input_queue(&self) -> &Sender<Arc<DnsResult>> {
        &self.tx
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Start the sink's workers
    #[instrument(name = "sink_handle_initialize", skip(self, shutdown), fields(sink = %self.name))]
    pub(crate) fn initialize(&mut self, shutdown: watch::Receiver<bool>) -> Result<(), DispatcherError> {
        let (sink, queue) = match (self.sink.take(), self.rx.take()) {
            (Some(sink), Some(queue)) => (sink, queue),
            _ => return Err(DispatcherError::sink_init(&self.name, "already initialized")),
        };
        let ctx = SinkContext {
            queue,
            shutdown,
            metrics: Arc::clone(&self.metrics),
        };
        self.workers = sink.initialize(ctx)?;
        debug!(sink = %self.name, workers = self.workers.len(), "sink initialized");
        Ok(())
    }

    /// Enqueue a result, waiting while the queue is full
    ///
    /// Returns false if the queue is closed.
    pub async fn send(&self, result: Arc<DnsResult>) -> bool {
        match self.tx.send(result).await {
            Ok(()) => {
                self.metrics.set_queue_len(self.tx.len());
                true
            }
            Err(_) => {
                warn!(sink = %self.name, "sink queue closed, result not delivered");
                false
            }
        }
    }

    /// Stop accepting new results; queued results stay receivable
    pub fn close(&self) {
        if self.tx.close() {
            debug!(sink = %self.name, "sink queue closed");
        }
    }

    /// Wait for the workers until `deadline`, then abort the rest
    ///
    /// Returns true if every worker finished on its own.
    #[instrument(name = "sink_handle_shutdown", skip(self, deadline), fields(sink = %self.name))]
    pub async fn shutdown(self, deadline: Instant) -> bool {
        self.close();
        let mut clean = true;
        for mut worker in self.workers {
            match timeout_at(deadline, &mut worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    clean = false;
                    error!(sink = %self.name, error = ?e, "sink worker panicked");
                }
                Err(_) => {
                    clean = false;
                    warn!(sink = %self.name, "sink worker missed shutdown deadline, aborting");
                    worker.abort();
                }
            }
        }
        debug!(sink = %self.name, clean, "SinkHandle shutdown complete");
        clean
    }
}
