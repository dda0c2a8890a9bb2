//! Mock capture backend
//!
//! 用于无网卡/无权限环境的测试。帧由测试注入，过滤器在用户态执行。

use std::collections::VecDeque;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use contracts::{CaptureInfo, CaptureStats};
use tracing::{debug, trace};

use crate::bpf::{self, BpfProgram};
use crate::error::{CaptureError, Result};
use crate::handle::{CaptureHandle, LinkType};

struct MockFrame {
    data: Bytes,
    timestamp: DateTime<Utc>,
    length: u32,
}

/// In-memory capture handle
///
/// Frames are returned in injection order. An installed filter runs over
/// each frame before it is returned; frames it rejects are skipped and do
/// not count as read.
pub struct MockCapture {
    device: String,
    link_type: LinkType,
    frames: VecDeque<MockFrame>,
    current: Option<Bytes>,
    program: Option<BpfProgram>,
    snap_len: u32,
    eof_when_drained: bool,
    fail_stats: bool,
    closed: bool,
    stats: CaptureStats,
}

impl MockCapture {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            link_type: LinkType::Ethernet,
            frames: VecDeque::new(),
            current: None,
            program: None,
            snap_len: 65_536,
            eof_when_drained: true,
            fail_stats: false,
            closed: false,
            stats: CaptureStats::default(),
        }
    }

    /// Set the framing reported by `link_type`
    pub fn with_link_type(mut self, link_type: LinkType) -> Self {
        self.link_type = link_type;
        self
    }

    /// Truncate returned frames to `snap_len` bytes
    pub fn with_snap_len(mut self, snap_len: u32) -> Self {
        self.snap_len = snap_len;
        self
    }

    /// Once the injected frames are used up, report `Timeout` instead of a
    /// read error
    pub fn keep_open(mut self) -> Self {
        self.eof_when_drained = false;
        self
    }

    /// Make `stats` fail
    pub fn fail_stats(mut self, fail: bool) -> Self {
        self.fail_stats = fail;
        self
    }

    /// Queue a frame stamped with the current time
    pub fn inject(&mut self, frame: impl Into<Bytes>) {
        self.inject_at(frame, Utc::now());
    }

    /// Queue a frame with an explicit capture timestamp
    pub fn inject_at(&mut self, frame: impl Into<Bytes>, timestamp: DateTime<Utc>) {
        let data = frame.into();
        let length = data.len() as u32;
        self.frames.push_back(MockFrame {
            data,
            timestamp,
            length,
        });
    }

    /// Count an injected frame as dropped by the "kernel"
    pub fn record_drop(&mut self, count: u64) {
        self.stats.accumulate(0, count);
    }

    /// Install an already compiled program
    pub fn install_program(&mut self, program: BpfProgram) {
        debug!(device = %self.device, instructions = program.len(), "installed mock filter");
        self.program = Some(program);
    }

    pub fn pending(&self) -> usize {
        self.frames.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl CaptureHandle for MockCapture {
    fn device(&self) -> &str {
        &self.device
    }

    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn read_zero_copy(&mut self) -> Result<(&[u8], CaptureInfo)> {
        if self.closed {
            return Err(CaptureError::closed(&self.device));
        }
        loop {
            let Some(frame) = self.frames.pop_front() else {
                return if self.eof_when_drained {
                    Err(CaptureError::read(&self.device, "no more frames"))
                } else {
                    Err(CaptureError::Timeout)
                };
            };

            let accepted = self
                .program
                .as_ref()
                .map(|p| p.matches(&frame.data))
                .unwrap_or(true);
            if !accepted {
                trace!(device = %self.device, len = frame.length, "filtered out");
                continue;
            }

            self.stats.accumulate(1, 0);
            let capture_length = frame.length.min(self.snap_len);
            let info = CaptureInfo {
                timestamp: frame.timestamp,
                capture_length,
                length: frame.length,
            };
            let data = self.current.insert(frame.data.slice(..capture_length as usize));
            return Ok((&data[..], info));
        }
    }

    fn set_filter(&mut self, expression: &str) -> Result<()> {
        if self.closed {
            return Err(CaptureError::closed(&self.device));
        }
        let program = bpf::compile(expression)?;
        self.install_program(program);
        Ok(())
    }

    fn stats(&mut self) -> Result<CaptureStats> {
        if self.fail_stats {
            return Err(CaptureError::stats(&self.device, "injected failure"));
        }
        Ok(self.stats)
    }

    fn close(&mut self) {
        if !self.closed {
            debug!(device = %self.device, "closed mock capture");
        }
        self.closed = true;
        self.frames.clear();
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::tests::udp4_frame;
    use rand::Rng;

    #[test]
    fn test_reads_in_injection_order() {
        let mut cap = MockCapture::new("loop0");
        cap.inject(vec![1u8, 2, 3]);
        cap.inject(vec![4u8]);
        assert_eq!(cap.read().unwrap().0.as_ref(), &[1, 2, 3]);
        let (data, info) = cap.read_zero_copy().unwrap();
        assert_eq!(data, &[4]);
        assert_eq!(info.length, 1);
        assert!(matches!(cap.read(), Err(CaptureError::Read { .. })));
    }

    #[test]
    fn test_keep_open_times_out() {
        let mut cap = MockCapture::new("loop0").keep_open();
        assert!(matches!(cap.read(), Err(CaptureError::Timeout)));
    }

    #[test]
    fn test_filtered_reads_only_return_matches() {
        let mut rng = rand::rng();
        let mut cap = MockCapture::new("loop0");
        cap.install_program(BpfProgram::port(53));

        let mut expected = 0;
        for _ in 0..200 {
            let port: u16 = if rng.random_bool(0.5) { 53 } else { rng.random_range(1024..u16::MAX) };
            if rng.random_bool(0.5) {
                cap.inject(udp4_frame(port, 40000));
            } else {
                cap.inject(udp4_frame(40000, port));
            }
            if port == 53 {
                expected += 1;
            }
        }

        let mut delivered = 0;
        while let Ok((frame, _)) = cap.read() {
            let src = u16::from_be_bytes([frame[34], frame[35]]);
            let dst = u16::from_be_bytes([frame[36], frame[37]]);
            assert!(src == 53 || dst == 53, "{src} -> {dst}");
            delivered += 1;
        }
        assert_eq!(delivered, expected);
        assert_eq!(cap.stats().unwrap().packets_read, expected);
    }

    #[test]
    fn test_snap_len_truncates() {
        let mut cap = MockCapture::new("loop0").with_snap_len(4);
        cap.inject(vec![9u8; 10]);
        let (data, info) = cap.read_zero_copy().unwrap();
        assert_eq!(data.len(), 4);
        assert!(info.is_truncated());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut cap = MockCapture::new("loop0");
        cap.inject(vec![0u8; 4]);
        cap.close();
        cap.close();
        assert!(cap.is_closed());
        assert!(matches!(cap.read(), Err(CaptureError::Read { .. })));
        assert!(cap.set_filter("port 53").is_err());
    }

    #[test]
    fn test_stats_failure_injection() {
        let mut cap = MockCapture::new("loop0").fail_stats(true);
        assert!(matches!(cap.stats(), Err(CaptureError::Stats { .. })));
    }

    #[test]
    fn test_drops_are_cumulative() {
        let mut cap = MockCapture::new("loop0");
        cap.record_drop(2);
        cap.inject(vec![0u8; 4]);
        let _ = cap.read();
        cap.record_drop(1);
        let stats = cap.stats().unwrap();
        assert_eq!(stats.packets_read, 1);
        assert_eq!(stats.packets_dropped, 3);
    }
}
