//! Null-object backend for builds lacking a capture facility

use contracts::{CaptureConfig, CaptureInfo, CaptureStats};

use crate::error::{CaptureError, Result};
use crate::handle::CaptureHandle;

/// Stands in for a backend this build or platform does not provide.
///
/// Construction fails, so a working instance only exists in tests; every
/// method still answers `CapabilityUnsupported`.
#[derive(Debug)]
pub struct UnsupportedCapture {
    backend: &'static str,
    device: String,
}

impl UnsupportedCapture {
    /// Always fails with `CapabilityUnsupported`
    pub fn open_as(backend: &'static str, _config: &CaptureConfig) -> Result<Self> {
        Err(CaptureError::unsupported(backend))
    }

    #[cfg(test)]
    pub(crate) fn stub(backend: &'static str, device: &str) -> Self {
        Self {
            backend,
            device: device.to_string(),
        }
    }
}

impl CaptureHandle for UnsupportedCapture {
    fn device(&self) -> &str {
        &self.device
    }

    fn read_zero_copy(&mut self) -> Result<(&[u8], CaptureInfo)> {
        Err(CaptureError::unsupported(self.backend))
    }

    fn set_filter(&mut self, _expression: &str) -> Result<()> {
        Err(CaptureError::unsupported(self.backend))
    }

    fn stats(&mut self) -> Result<CaptureStats> {
        Err(CaptureError::unsupported(self.backend))
    }

    fn close(&mut self) {}
}

/// Generates a backend alias with the real backend's constructor signature
macro_rules! unsupported_backend {
    ($name:ident, $backend:literal) => {
        #[doc = concat!("`", $backend, "` is not available in this build")]
        pub struct $name;

        impl $name {
            pub fn open(config: &CaptureConfig) -> Result<UnsupportedCapture> {
                UnsupportedCapture::open_as($backend, config)
            }
        }
    };
}

#[cfg(not(feature = "pcap"))]
unsupported_backend!(LivePcap, "live");

#[cfg(not(target_os = "linux"))]
unsupported_backend!(FastRingCapture, "fast_ring");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_fails() {
        let err = UnsupportedCapture::open_as("fast_ring", &CaptureConfig::new("eth0")).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::CapabilityUnsupported { backend: "fast_ring" }
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_every_operation_is_unsupported() {
        let mut handle = UnsupportedCapture::stub("fast_ring", "eth0");
        assert!(matches!(
            handle.read_zero_copy(),
            Err(CaptureError::CapabilityUnsupported { .. })
        ));
        assert!(matches!(
            handle.read(),
            Err(CaptureError::CapabilityUnsupported { .. })
        ));
        assert!(matches!(
            handle.set_filter("port 53"),
            Err(CaptureError::CapabilityUnsupported { .. })
        ));
        assert!(matches!(
            handle.stats(),
            Err(CaptureError::CapabilityUnsupported { .. })
        ));
        handle.close();
        handle.close();
        assert_eq!(handle.device(), "eth0");
    }
}
