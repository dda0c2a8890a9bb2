//! Capture 错误类型

use thiserror::Error;

/// Capture errors
///
/// `CapabilityUnsupported`, `DeviceInit` and `Filter` are fatal at startup;
/// `Stats` is recoverable; `Timeout` only tells the read loop to re-check
/// cancellation.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The platform or build lacks this backend
    #[error("capture backend '{backend}' is not supported by this build")]
    CapabilityUnsupported {
        /// Backend name
        backend: &'static str,
    },

    /// Device could not be opened or configured
    #[error("failed to initialize capture device '{device}': {message}")]
    DeviceInit {
        /// Device name
        device: String,
        /// Error message
        message: String,
    },

    /// Filter expression invalid or rejected by the backend
    #[error("failed to install filter '{expression}': {message}")]
    Filter {
        /// Filter expression
        expression: String,
        /// Error message
        message: String,
    },

    /// Device error or closed handle
    #[error("read error on '{device}': {message}")]
    Read {
        /// Device name
        device: String,
        /// Error message
        message: String,
    },

    /// No frame arrived within the read timeout
    #[error("read timed out")]
    Timeout,

    /// Backend cannot report statistics
    #[error("statistics unavailable for '{device}': {message}")]
    Stats {
        /// Device name
        device: String,
        /// Error message
        message: String,
    },
}

impl CaptureError {
    pub fn unsupported(backend: &'static str) -> Self {
        Self::CapabilityUnsupported { backend }
    }

    pub fn device_init(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DeviceInit {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn filter(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Filter {
            expression: expression.into(),
            message: message.into(),
        }
    }

    pub fn read(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Read {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn closed(device: impl Into<String>) -> Self {
        Self::read(device, "handle is closed")
    }

    pub fn stats(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stats {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Errors that must stop the process at startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CapabilityUnsupported { .. } | Self::DeviceInit { .. } | Self::Filter { .. }
        )
    }
}

/// Capture Result 类型别名
pub type Result<T> = std::result::Result<T, CaptureError>;
