//! LogSink - one tracing event per accepted question row

use std::collections::HashMap;
use std::sync::Arc;

use contracts::{DnsResult, DomainFilter, OutputMode};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::error::DispatcherError;
use crate::sink::{cancelled, OutputSink, SinkContext};

/// Sink that logs question rows for debugging
pub struct LogSink {
    name: String,
    mode: OutputMode,
    workers: usize,
    filter: Arc<DomainFilter>,
}

impl LogSink {
    /// Create a new LogSink with the given name
    pub fn new(name: impl Into<String>, mode: OutputMode, filter: Arc<DomainFilter>) -> Self {
        Self {
            name: name.into(),
            mode,
            workers: 1,
            filter,
        }
    }

    /// Create from params (`workers`, default 1)
    pub fn from_params(
        name: impl Into<String>,
        mode: OutputMode,
        params: &HashMap<String, String>,
        filter: Arc<DomainFilter>,
    ) -> Result<Self, String> {
        let workers = match params.get("workers") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|e| format!("invalid 'workers' value '{raw}': {e}"))?,
            None => 1,
        };
        if workers == 0 {
            return Err("'workers' must be at least 1".to_string());
        }
        Ok(Self {
            workers,
            ..Self::new(name, mode, filter)
        })
    }
}

fn log_result(sink: &str, mode: OutputMode, filter: &DomainFilter, result: &DnsResult) -> (u64, u64) {
    let mut sent = 0;
    let mut skipped = 0;
    for q in &result.dns.questions {
        if filter.should_skip(mode, &q.name) {
            skipped += 1;
            continue;
        }
        info!(
            sink = %sink,
            src = %result.src_ip,
            dst = %result.dst_ip,
            proto = %result.protocol,
            id = result.dns.id,
            qr = result.dns.response,
            rcode = result.dns.rcode,
            qtype = q.qtype,
            question = %q.name,
            "dns question"
        );
        sent += 1;
    }
    (sent, skipped)
}

impl OutputSink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(name = "log_sink_initialize", skip(self, ctx), fields(sink = %self.name))]
    fn initialize(self: Box<Self>, ctx: SinkContext) -> Result<Vec<JoinHandle<()>>, DispatcherError> {
        if !self.mode.is_enabled() {
            return Err(DispatcherError::sink_init(&self.name, "output mode is disabled"));
        }

        let handles = (0..self.workers)
            .map(|id| {
                let name = self.name.clone();
                let mode = self.mode;
                let filter = Arc::clone(&self.filter);
                let queue = ctx.queue.clone();
                let mut shutdown = ctx.shutdown.clone();
                let metrics = Arc::clone(&ctx.metrics);
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            biased;
                            _ = cancelled(&mut shutdown) => break,
                            msg = queue.recv() => match msg {
                                Ok(result) => {
                                    let (sent, skipped) = log_result(&name, mode, &filter, &result);
                                    if sent > 0 {
                                        metrics.add_sent(sent);
                                    }
                                    if skipped > 0 {
                                        metrics.add_skipped(skipped);
                                    }
                                }
                                Err(_) => break,
                            },
                        }
                    }
                    debug!(sink = %name, worker = id, "LogSink worker stopped");
                })
            })
            .collect();
        Ok(handles)
    }
}
