//! Dispatcher error types

use thiserror::Error;

/// Dispatcher-specific errors
#[derive(Debug, Error)]
pub enum DispatcherError {
    /// Sink could not be built from its configuration
    #[error("failed to create sink '{name}': {message}")]
    SinkCreation { name: String, message: String },

    /// Sink refused to start (disabled or misconfigured); it is removed from fan-out
    #[error("sink '{name}' failed to initialize: {message}")]
    SinkInit { name: String, message: String },

    /// A batch flush failed; the batch is discarded
    #[error("sink '{name}' failed to write {rows} rows: {message}")]
    BackendWrite {
        name: String,
        rows: usize,
        message: String,
    },
}

impl DispatcherError {
    /// Create a sink creation error
    pub fn sink_creation(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SinkCreation {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a sink initialization error
    pub fn sink_init(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SinkInit {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a backend write error
    pub fn backend_write(name: impl Into<String>, rows: usize, message: impl Into<String>) -> Self {
        Self::BackendWrite {
            name: name.into(),
            rows,
            message: message.into(),
        }
    }
}
