//! Sink implementations
//!
//! Contains SqlSink and LogSink.

mod log;
mod sql;

use std::sync::Arc;

use contracts::{DomainFilter, SinkConfig, SinkType};

use crate::error::DispatcherError;
use crate::sink::OutputSink;

pub use self::log::LogSink;
pub use self::sql::{
    BackendFactory, BatchAccumulator, BatchBackend, DnsRow, LocalBatchBackend, MySqlBackend,
    MySqlFactory, SqlSink, SqlSinkConfig,
};

/// Build a sink from its configuration
///
/// Only constructs the sink; params are validated by `initialize`.
pub fn create_sink(
    config: &SinkConfig,
    filter: Arc<DomainFilter>,
    server_name: &str,
) -> Result<Box<dyn OutputSink>, DispatcherError> {
    match config.sink_type {
        SinkType::Sql => Ok(Box::new(SqlSink::new(
            &config.name,
            config.output_mode,
            config.params.clone(),
            filter,
            server_name,
        ))),
        SinkType::Log => {
            let sink = LogSink::from_params(&config.name, config.output_mode, &config.params, filter)
                .map_err(|e| DispatcherError::sink_creation(&config.name, e))?;
            Ok(Box::new(sink))
        }
    }
}
