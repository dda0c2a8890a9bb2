//! CaptureHandle trait - capture backend contract

use bytes::Bytes;
use contracts::{CaptureInfo, CaptureStats};

use crate::error::Result;

/// Link-layer framing of the frames a handle returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkType {
    /// Ethernet II (optionally 802.1Q tagged)
    #[default]
    Ethernet,
    /// Linux cooked capture v1
    LinuxSll,
    /// Raw IP, no link header
    RawIp,
}

/// Capture handle trait
///
/// Every backend (libpcap, AF_PACKET ring, the unsupported stub, the mock)
/// implements this trait. Reads block until a frame arrives or the backend's
/// read timeout expires, so implementations are driven from a blocking thread.
pub trait CaptureHandle: Send {
    /// Device this handle is bound to
    fn device(&self) -> &str;

    /// Framing of returned frames
    fn link_type(&self) -> LinkType {
        LinkType::Ethernet
    }

    /// Read the next frame into an owned buffer
    fn read(&mut self) -> Result<(Bytes, CaptureInfo)> {
        let (data, info) = self.read_zero_copy()?;
        Ok((Bytes::copy_from_slice(data), info))
    }

    /// Read the next frame as a view into backend memory
    ///
    /// The view is only valid until the next call on this handle.
    fn read_zero_copy(&mut self) -> Result<(&[u8], CaptureInfo)>;

    /// Compile `expression` and install it
    ///
    /// # Errors
    /// `CaptureError::Filter` when the expression is invalid or the backend
    /// rejects the program.
    fn set_filter(&mut self, expression: &str) -> Result<()>;

    /// Cumulative packets read / dropped
    fn stats(&mut self) -> Result<CaptureStats>;

    /// Release the OS resource. A second call is a no-op.
    fn close(&mut self);
}
