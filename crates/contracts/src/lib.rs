//! # Contracts
//!
//! Frozen interface contracts shared by every crate in the workspace.
//! Business crates depend only on this crate, reverse dependencies are prohibited.
//!
//! ## Data flow
//! - capture produces `CaptureInfo` per frame and decodes `DnsResult`
//! - the dispatcher fans each `DnsResult` out to every active sink
//! - sinks filter question rows through `DomainFilter` according to their `OutputMode`

mod blueprint;
mod capture;
mod error;
mod filter;
mod result;

pub use blueprint::*;
pub use capture::*;
pub use error::*;
pub use filter::{DomainFilter, DomainList, MatchKind, OutputMode};
pub use result::*;
