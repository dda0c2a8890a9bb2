//! # Capture
//!
//! Packet capture backends and the read loop feeding the dispatcher.
//!
//! Responsibilities:
//! - `CaptureHandle` contract shared by every backend
//! - Backend selection per device (`open`), no fallback between variants
//! - Filter compilation and installation (classic BPF)
//! - Frame decoding into `DnsResult`
//! - Blocking read loops with backpressure towards the dispatcher
//!
//! ## Backends
//!
//! | variant            | available when                  |
//! |--------------------|---------------------------------|
//! | `LivePcap`         | `pcap` feature (default)        |
//! | `FastRingCapture`  | `target_os = "linux"`           |
//! | `MockCapture`      | always (tests)                  |
//!
//! Where a backend is missing, its name resolves to a stub whose `open`
//! returns `CaptureError::CapabilityUnsupported`.
//!
//! ## Usage Example
//!
//! ```ignore
//! use capture::CapturePipeline;
//!
//! let mut pipeline = CapturePipeline::new(blueprint.general.stats_interval());
//! pipeline.open_all(&blueprint.captures)?;
//! let loops = pipeline.start_all(results_tx, shutdown_rx);
//! ```

pub mod bpf;
pub mod decode;
mod error;
mod handle;
mod mock;
mod pipeline;
mod unsupported;

#[cfg(feature = "pcap")]
mod live;
#[cfg(target_os = "linux")]
mod ring;

pub use bpf::{BpfInstruction, BpfProgram};
pub use decode::{decode, DecodeError};
pub use error::{CaptureError, Result};
pub use handle::{CaptureHandle, LinkType};
pub use mock::MockCapture;
pub use pipeline::{
    install_filter, open, run_capture_loop, CaptureMetrics, CaptureMetricsSnapshot,
    CapturePipeline, CaptureSummary, LoopExit,
};
pub use unsupported::UnsupportedCapture;

#[cfg(feature = "pcap")]
pub use live::LivePcap;
#[cfg(not(feature = "pcap"))]
pub use unsupported::LivePcap;

#[cfg(target_os = "linux")]
pub use ring::FastRingCapture;
#[cfg(not(target_os = "linux"))]
pub use unsupported::FastRingCapture;
