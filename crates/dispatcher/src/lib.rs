//! # Dispatcher
//!
//! 结果分发模块。
//!
//! 负责：
//! - 消费 capture 产出的 `Arc<DnsResult>`
//! - Fan-out 到每个活跃 sink 的有界队列（满则阻塞，不丢数据）
//! - 初始化失败的 sink 永久移出 fan-out
//! - 每个 sink 自带 worker 池与批量写入

pub mod dispatcher;
pub mod error;
pub mod handle;
pub mod metrics;
pub mod sink;
pub mod sinks;

pub use contracts::DnsResult;
pub use dispatcher::{create_dispatcher, Dispatcher, DispatcherBuilder};
pub use error::DispatcherError;
pub use handle::SinkHandle;
pub use metrics::{MetricsSnapshot, SinkMetrics};
pub use sink::{cancelled, OutputSink, SinkContext};
pub use sinks::{
    create_sink, BackendFactory, BatchAccumulator, BatchBackend, DnsRow, LocalBatchBackend, LogSink,
    MySqlBackend, MySqlFactory, SqlSink, SqlSinkConfig,
};
