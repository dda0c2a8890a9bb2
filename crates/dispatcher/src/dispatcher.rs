//! Dispatcher - main loop for fan-out to sinks

use std::sync::Arc;
use std::time::Duration;

use async_channel::Receiver;
use contracts::{DnsResult, DomainFilter, GeneralConfig, SinkConfig};
use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::DispatcherError;
use crate::handle::SinkHandle;
use crate::metrics::{MetricsSnapshot, SinkMetrics};
use crate::sink::{cancelled, OutputSink};
use crate::sinks::create_sink;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Builder for creating a Dispatcher
///
/// Sinks are registered during composition; `initialize_all` freezes the
/// list and drops every sink that fails to start.
pub struct DispatcherBuilder {
    handles: Vec<SinkHandle>,
    shutdown_timeout: Duration,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherBuilder {
    /// Create a new DispatcherBuilder
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Deadline budget used by `Dispatcher::run` on exit
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Append a sink with an input queue of `queue_capacity`
    pub fn register(&mut self, sink: Box<dyn OutputSink>, queue_capacity: usize) -> &mut Self {
        debug!(sink = sink.name(), queue_capacity, "sink registered");
        self.handles.push(SinkHandle::new(sink, queue_capacity));
        self
    }

    /// Register every configured sink
    ///
    /// A sink whose construction fails is logged and skipped, like a sink
    /// whose initialization fails later.
    #[instrument(
        name = "dispatcher_builder_from_configs",
        skip(configs, general, filter),
        fields(sink_count = configs.len())
    )]
    pub fn from_configs(configs: &[SinkConfig], general: &GeneralConfig, filter: Arc<DomainFilter>) -> Self {
        let mut builder = Self::new().shutdown_timeout(general.shutdown_timeout());
        for config in configs {
            match create_sink(config, Arc::clone(&filter), &general.server_name) {
                Ok(sink) => {
                    let capacity = config.queue_capacity.unwrap_or(general.result_queue_capacity);
                    builder.register(sink, capacity);
                }
                Err(e) => warn!(sink = %config.name, error = %e, "sink not registered"),
            }
        }
        builder
    }

    pub fn registered(&self) -> usize {
        self.handles.len()
    }

    /// Initialize every registered sink exactly once
    ///
    /// Must run inside the runtime. Sinks returning an error are removed
    /// for the rest of the run.
    #[instrument(name = "dispatcher_initialize_all", skip(self, shutdown), fields(sink_count = self.handles.len()))]
    pub fn initialize_all(self, shutdown: watch::Receiver<bool>) -> Dispatcher {
        let mut active = Vec::with_capacity(self.handles.len());
        for mut handle in self.handles {
            match handle.initialize(shutdown.clone()) {
                Ok(()) => active.push(handle),
                Err(e) => {
                    warn!(sink = %handle.name(), error = %e, "sink removed from fan-out");
                }
            }
        }
        info!(active = active.len(), "sinks initialized");
        Dispatcher {
            handles: active,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

/// The main Dispatcher that fans out results to sinks
pub struct Dispatcher {
    handles: Vec<SinkHandle>,
    shutdown_timeout: Duration,
}

impl Dispatcher {
    /// Number of active sinks
    pub fn sink_count(&self) -> usize {
        self.handles.len()
    }

    /// Names of active sinks
    pub fn sink_names(&self) -> Vec<&str> {
        self.handles.iter().map(|h| h.name()).collect()
    }

    /// Get metrics for all sinks
    pub fn metrics(&self) -> Vec<(String, MetricsSnapshot)> {
        self.handles
            .iter()
            .map(|h| (h.name().to_string(), h.metrics().snapshot()))
            .collect()
    }

    /// Shared counters of every active sink; they stay readable after `run`
    pub fn sink_metrics(&self) -> Vec<Arc<SinkMetrics>> {
        self.handles.iter().map(|h| Arc::clone(h.metrics())).collect()
    }

    /// Push `result` onto every active sink queue
    ///
    /// Waits while a queue is full. Returns false if cancellation fired
    /// before every sink accepted the result.
    pub async fn dispatch(&self, result: &Arc<DnsResult>, shutdown: &mut watch::Receiver<bool>) -> bool {
        for handle in &self.handles {
            tokio::select! {
                biased;
                _ = cancelled(shutdown) => return false,
                _ = handle.send(Arc::clone(result)) => {}
            }
        }
        counter!("dnscope_results_dispatched_total").increment(1);
        true
    }

    /// Run the dispatcher main loop
    ///
    /// Consumes results until the input channel closes or cancellation
    /// fires, then shuts every sink down.
    #[instrument(name = "dispatcher_run", skip(self, input, shutdown))]
    pub async fn run(self, input: Receiver<Arc<DnsResult>>, mut shutdown: watch::Receiver<bool>) {
        info!(sinks = self.handles.len(), "Dispatcher started");

        let mut count: u64 = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => break,
                msg = input.recv() => match msg {
                    Ok(result) => result,
                    Err(_) => break,
                },
            };
            if !self.dispatch(&result, &mut shutdown).await {
                break;
            }
            count += 1;
            if count.is_multiple_of(10_000) {
                debug!(results = count, "Dispatcher progress");
            }
        }

        // unblocks capture threads waiting on a full input channel
        input.close();
        info!(results = count, "Dispatcher input done, shutting down");

        let deadline = Instant::now() + self.shutdown_timeout;
        self.shutdown(deadline).await;
    }

    /// Spawn the dispatcher as a background task
    pub fn spawn(self, input: Receiver<Arc<DnsResult>>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(input, shutdown))
    }

    /// Close every sink queue and wait for the workers until `deadline`
    ///
    /// Returns true if every worker stopped on its own.
    #[instrument(name = "dispatcher_shutdown", skip(self, deadline))]
    pub async fn shutdown(self, deadline: Instant) -> bool {
        for handle in &self.handles {
            handle.close();
        }
        let mut clean = true;
        for handle in self.handles {
            let name = handle.name().to_string();
            let metrics = Arc::clone(handle.metrics());
            clean &= handle.shutdown(deadline).await;
            let snap = metrics.snapshot();
            info!(
                sink = %name,
                sent = snap.sent_to_output,
                skipped = snap.skipped,
                failed = snap.failed,
                "sink stopped"
            );
        }
        if !clean {
            warn!("some sink workers were aborted at the shutdown deadline");
        }
        info!("Dispatcher shutdown complete");
        clean
    }
}

/// Convenience: build and initialize a dispatcher from sink configs
pub fn create_dispatcher(
    configs: &[SinkConfig],
    general: &GeneralConfig,
    filter: Arc<DomainFilter>,
    shutdown: watch::Receiver<bool>,
) -> Result<Dispatcher, DispatcherError> {
    let dispatcher = DispatcherBuilder::from_configs(configs, general, filter).initialize_all(shutdown);
    if dispatcher.sink_count() == 0 && !configs.is_empty() {
        return Err(DispatcherError::sink_init("*", "no sink could be started"));
    }
    Ok(dispatcher)
}
