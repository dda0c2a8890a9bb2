//! MonitorBlueprint - Config Loader output
//!
//! Describes the whole process: general settings, capture devices, output routing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::OutputMode;

/// Configuration version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConfigVersion {
    #[default]
    V1,
}

/// Complete process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorBlueprint {
    /// Configuration version
    #[serde(default)]
    pub version: ConfigVersion,

    /// Process-wide settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Capture devices, one handle each
    pub captures: Vec<CaptureConfig>,

    /// Output routing
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

/// Process-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Identifier written with every row
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Default capacity of each sink's input queue
    #[serde(default = "default_result_queue_capacity")]
    pub result_queue_capacity: usize,

    /// Deadline for draining sinks on shutdown
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// How often capture statistics are logged
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,

    /// Inline skip entries (`name[,fqdn|prefix|suffix]`)
    #[serde(default)]
    pub skip_domains: Vec<String>,

    /// Skip list file
    #[serde(default)]
    pub skip_domains_file: Option<PathBuf>,

    /// Inline allow entries
    #[serde(default)]
    pub allow_domains: Vec<String>,

    /// Allow list file
    #[serde(default)]
    pub allow_domains_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            result_queue_capacity: default_result_queue_capacity(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            stats_interval_ms: default_stats_interval_ms(),
            skip_domains: Vec::new(),
            skip_domains_file: None,
            allow_domains: Vec::new(),
            allow_domains_file: None,
        }
    }
}

impl GeneralConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn has_skip_list(&self) -> bool {
        !self.skip_domains.is_empty() || self.skip_domains_file.is_some()
    }

    pub fn has_allow_list(&self) -> bool {
        !self.allow_domains.is_empty() || self.allow_domains_file.is_some()
    }
}

fn default_server_name() -> String {
    "default".to_string()
}

fn default_result_queue_capacity() -> usize {
    100_000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

fn default_stats_interval_ms() -> u64 {
    10_000
}

/// Capture backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// libpcap live capture
    #[default]
    Live,
    /// Linux AF_PACKET memory-mapped ring
    FastRing,
}

impl CaptureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMode::Live => "live",
            CaptureMode::FastRing => "fast_ring",
        }
    }
}

/// One capture device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Interface name (e.g. "eth0")
    pub device: String,

    /// Backend selector
    #[serde(default)]
    pub mode: CaptureMode,

    /// Put the interface into promiscuous mode
    #[serde(default = "default_true")]
    pub promiscuous: bool,

    /// tcpdump-syntax filter; empty means capture everything
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Snapshot length in bytes
    #[serde(default = "default_snap_len")]
    pub snap_len: u32,

    /// Ring block size in bytes (fast ring only)
    #[serde(default = "default_block_size")]
    pub block_size: u32,

    /// Number of ring blocks (fast ring only)
    #[serde(default = "default_block_count")]
    pub block_count: u32,

    /// Read timeout; also the ring block retire timeout
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Promiscuous membership tied to the socket lifetime (fast ring only)
    #[serde(default)]
    pub auto_promiscuous: bool,
}

impl CaptureConfig {
    /// Config with defaults for the given device
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            mode: CaptureMode::default(),
            promiscuous: true,
            filter: default_filter(),
            snap_len: default_snap_len(),
            block_size: default_block_size(),
            block_count: default_block_count(),
            read_timeout_ms: default_read_timeout_ms(),
            auto_promiscuous: false,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_filter() -> String {
    "(ip or ip6) and port 53".to_string()
}

fn default_snap_len() -> u32 {
    65_536
}

fn default_block_size() -> u32 {
    4 * 1024 * 1024
}

fn default_block_count() -> u32 {
    64
}

fn default_read_timeout_ms() -> u64 {
    500
}

/// Sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Sink name (unique)
    pub name: String,

    /// Sink type
    pub sink_type: SinkType,

    /// What the sink writes
    #[serde(default)]
    pub output_mode: OutputMode,

    /// Input queue capacity (falls back to `general.result_queue_capacity`)
    #[serde(default)]
    pub queue_capacity: Option<usize>,

    /// Sink-specific parameters
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// Sink type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkType {
    /// Batched relational insert
    Sql,
    /// Structured log line per row
    Log,
}

/// Values bound per row by the sql sink's multi-row INSERT
pub const SQL_COLUMNS_PER_ROW: usize = 17;

/// Largest sql `batch_size` whose INSERT stays within MySQL's 65535
/// placeholder limit for one prepared statement
pub const SQL_MAX_BATCH_SIZE: usize = u16::MAX as usize / SQL_COLUMNS_PER_ROW;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_defaults() {
        let c: CaptureConfig = serde_json::from_str(r#"{"device": "eth0"}"#).unwrap();
        assert_eq!(c.mode, CaptureMode::Live);
        assert!(c.promiscuous);
        assert_eq!(c.filter, "(ip or ip6) and port 53");
        assert_eq!(c.read_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_sink_config_parses_mode() {
        let s: SinkConfig = serde_json::from_str(
            r#"{"name": "db", "sink_type": "sql", "output_mode": 1, "params": {"workers": "2"}}"#,
        )
        .unwrap();
        assert_eq!(s.sink_type, SinkType::Sql);
        assert_eq!(s.output_mode, OutputMode::Unfiltered);
        assert_eq!(s.params.get("workers").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_sql_batch_limit_fits_placeholders() {
        assert_eq!(SQL_MAX_BATCH_SIZE, 3855);
        assert!(SQL_MAX_BATCH_SIZE * SQL_COLUMNS_PER_ROW <= 65535);
        assert!((SQL_MAX_BATCH_SIZE + 1) * SQL_COLUMNS_PER_ROW > 65535);
    }
}
