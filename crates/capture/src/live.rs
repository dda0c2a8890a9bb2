//! LivePcap - libpcap live capture backend

use chrono::{DateTime, Utc};
use contracts::{CaptureConfig, CaptureInfo, CaptureStats};
use pcap::{Active, Capture, Linktype};
use tracing::{debug, info};

use crate::error::{CaptureError, Result};
use crate::handle::{CaptureHandle, LinkType};

/// libpcap live capture
///
/// Promiscuous mode is fixed at open time. Filters go through libpcap's
/// own compiler and are installed with `pcap_setfilter`.
pub struct LivePcap {
    device: String,
    capture: Option<Capture<Active>>,
    link_type: LinkType,
    stats: CaptureStats,
    last_received: u32,
    last_dropped: u32,
}

impl LivePcap {
    /// Open `config.device` for live capture
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        let device = config.device.clone();
        let snaplen = i32::try_from(config.snap_len).unwrap_or(i32::MAX);
        let timeout = i32::try_from(config.read_timeout_ms).unwrap_or(i32::MAX);

        let capture = Capture::from_device(device.as_str())
            .and_then(|c| {
                c.promisc(config.promiscuous)
                    .snaplen(snaplen)
                    .timeout(timeout)
                    .immediate_mode(true)
                    .open()
            })
            .map_err(|e| CaptureError::device_init(&device, e.to_string()))?;

        let link_type = match capture.get_datalink() {
            Linktype::ETHERNET => LinkType::Ethernet,
            Linktype::LINUX_SLL => LinkType::LinuxSll,
            Linktype::RAW | Linktype::IPV4 | Linktype::IPV6 => LinkType::RawIp,
            other => {
                return Err(CaptureError::device_init(
                    &device,
                    format!("unsupported link type {}", other.0),
                ));
            }
        };

        info!(
            device = %device,
            promiscuous = config.promiscuous,
            snap_len = config.snap_len,
            link_type = ?link_type,
            "opened live capture"
        );

        Ok(Self {
            device,
            capture: Some(capture),
            link_type,
            stats: CaptureStats::default(),
            last_received: 0,
            last_dropped: 0,
        })
    }
}

impl CaptureHandle for LivePcap {
    fn device(&self) -> &str {
        &self.device
    }

    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn read_zero_copy(&mut self) -> Result<(&[u8], CaptureInfo)> {
        let capture = self
            .capture
            .as_mut()
            .ok_or_else(|| CaptureError::closed(&self.device))?;

        match capture.next_packet() {
            Ok(packet) => {
                let ts = packet.header.ts;
                let timestamp: DateTime<Utc> =
                    DateTime::from_timestamp(ts.tv_sec as i64, (ts.tv_usec as u32) * 1_000)
                        .unwrap_or_default();
                let info = CaptureInfo {
                    timestamp,
                    capture_length: packet.header.caplen,
                    length: packet.header.len,
                };
                Ok((packet.data, info))
            }
            Err(pcap::Error::TimeoutExpired) => Err(CaptureError::Timeout),
            Err(e) => Err(CaptureError::read(&self.device, e.to_string())),
        }
    }

    fn set_filter(&mut self, expression: &str) -> Result<()> {
        let capture = self
            .capture
            .as_mut()
            .ok_or_else(|| CaptureError::closed(&self.device))?;
        capture
            .filter(expression, true)
            .map_err(|e| CaptureError::filter(expression, e.to_string()))?;
        debug!(device = %self.device, filter = expression, "installed filter");
        Ok(())
    }

    fn stats(&mut self) -> Result<CaptureStats> {
        let capture = self
            .capture
            .as_mut()
            .ok_or_else(|| CaptureError::closed(&self.device))?;
        let stat = capture
            .stats()
            .map_err(|e| CaptureError::stats(&self.device, e.to_string()))?;

        // libpcap counters are 32-bit and wrap
        let dropped = stat.dropped.wrapping_add(stat.if_dropped);
        self.stats.accumulate(
            u64::from(stat.received.wrapping_sub(self.last_received)),
            u64::from(dropped.wrapping_sub(self.last_dropped)),
        );
        self.last_received = stat.received;
        self.last_dropped = dropped;
        Ok(self.stats)
    }

    fn close(&mut self) {
        if self.capture.take().is_some() {
            debug!(device = %self.device, "closed live capture");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_read_close_twice() {
        let mut config = CaptureConfig::new("lo");
        config.read_timeout_ms = 50;
        let mut cap = match LivePcap::open(&config) {
            Ok(cap) => cap,
            // needs CAP_NET_RAW, or no loopback on this host
            Err(CaptureError::DeviceInit { .. }) => return,
            Err(e) => panic!("unexpected error: {e}"),
        };
        cap.set_filter("port 53").unwrap();

        match cap.read_zero_copy() {
            Ok((data, info)) => assert_eq!(data.len(), info.capture_length as usize),
            Err(CaptureError::Timeout) => {}
            Err(e) => panic!("unexpected read error: {e}"),
        }

        cap.close();
        cap.close();
        assert!(matches!(cap.read_zero_copy(), Err(CaptureError::Read { .. })));
        assert!(matches!(cap.set_filter("port 53"), Err(CaptureError::Read { .. })));
        assert!(matches!(cap.stats(), Err(CaptureError::Read { .. })));
    }

    #[test]
    fn test_unknown_device() {
        let config = CaptureConfig::new("dnscope-no-such-if0");
        assert!(matches!(
            LivePcap::open(&config),
            Err(CaptureError::DeviceInit { .. })
        ));
    }
}
