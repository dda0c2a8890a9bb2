//! FastRingCapture - AF_PACKET TPACKET_V3 memory-mapped ring (Linux)
//!
//! The kernel fills fixed-size blocks with frames and hands a block to
//! userspace by flipping its status word. Frames are read in place; a block
//! is returned to the kernel when the reader moves past it, so the slice
//! handed out by `read_zero_copy` stays valid until the next call.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use chrono::DateTime;
use contracts::{CaptureConfig, CaptureInfo, CaptureStats};
use libc::c_int;
use tracing::{debug, info};

use crate::bpf;
use crate::error::{CaptureError, Result};
use crate::handle::{CaptureHandle, LinkType};

// <linux/if_packet.h>
const PACKET_ADD_MEMBERSHIP: c_int = 1;
const PACKET_RX_RING: c_int = 5;
const PACKET_STATISTICS: c_int = 6;
const PACKET_VERSION: c_int = 10;
const PACKET_MR_PROMISC: u16 = 1;
const TPACKET_V3: c_int = 2;

// <linux/sockios.h>, <linux/if_arp.h>
const SIOCGIFHWADDR: u32 = 0x8927;
const ARPHRD_ETHER: u16 = 1;
const ARPHRD_LOOPBACK: u16 = 772;

const TP_STATUS_KERNEL: u32 = 0;
const TP_STATUS_USER: u32 = 1;

const FRAME_SIZE: u32 = 2048;
const PAGE_SIZE: u32 = 4096;

// tpacket_block_desc / tpacket_hdr_v1 field offsets
const BLOCK_STATUS: usize = 8;
const BLOCK_NUM_PKTS: usize = 12;
const BLOCK_FIRST_PKT: usize = 16;

// tpacket3_hdr field offsets
const PKT_NEXT_OFFSET: usize = 0;
const PKT_SEC: usize = 4;
const PKT_NSEC: usize = 8;
const PKT_SNAPLEN: usize = 12;
const PKT_LEN: usize = 16;
const PKT_MAC: usize = 24;

#[repr(C)]
#[allow(dead_code)]
struct TpacketReq3 {
    tp_block_size: u32,
    tp_block_nr: u32,
    tp_frame_size: u32,
    tp_frame_nr: u32,
    tp_retire_blk_tov: u32,
    tp_sizeof_priv: u32,
    tp_feature_req_word: u32,
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct TpacketStatsV3 {
    tp_packets: u32,
    tp_drops: u32,
    tp_freeze_q_cnt: u32,
}

#[repr(C)]
#[allow(dead_code)]
struct PacketMreq {
    mr_ifindex: c_int,
    mr_type: u16,
    mr_alen: u16,
    mr_address: [u8; 8],
}

/// `struct ifreq` as filled by `SIOCGIFHWADDR`
#[repr(C)]
struct IfreqHwaddr {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_hwaddr: libc::sockaddr,
    _pad: [u8; 8],
}

/// Owned `mmap` region of the rx ring
struct RingMap {
    base: *mut u8,
    len: usize,
}

impl RingMap {
    fn block(&self, index: usize, block_size: usize) -> *mut u8 {
        // index < block_count, so the offset stays inside the mapping
        unsafe { self.base.add(index * block_size) }
    }
}

impl Drop for RingMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.len);
        }
    }
}

/// Cursor into the block currently owned by userspace
#[derive(Debug, Default)]
struct BlockCursor {
    held: bool,
    packets_left: u32,
    offset: usize,
}

/// AF_PACKET TPACKET_V3 ring capture
pub struct FastRingCapture {
    device: String,
    // field order: the mapping must go before the socket
    ring: Option<RingMap>,
    fd: Option<OwnedFd>,
    link_type: LinkType,
    snap_len: u32,
    poll_timeout_ms: c_int,
    block_size: usize,
    block_count: usize,
    current_block: usize,
    cursor: BlockCursor,
    stats: CaptureStats,
}

// The mapping is private to this handle and only touched through &mut self.
unsafe impl Send for FastRingCapture {}

impl FastRingCapture {
    /// Create the socket, set up the ring and bind to `config.device`
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        let device = config.device.clone();
        let init_err = |what: &str, e: io::Error| CaptureError::device_init(&device, format!("{what}: {e}"));

        if config.block_count == 0 {
            return Err(CaptureError::device_init(&device, "block_count must be at least 1"));
        }
        if config.block_size == 0 || config.block_size % PAGE_SIZE != 0 {
            return Err(CaptureError::device_init(
                &device,
                format!("block_size {} is not a multiple of {PAGE_SIZE}", config.block_size),
            ));
        }

        let ifindex = interface_index(&device)?;

        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let raw = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, c_int::from(protocol)) };
        if raw < 0 {
            return Err(init_err("socket", io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // filters are compiled for Ethernet framing
        let link_type = if ifindex == 0 {
            LinkType::Ethernet
        } else {
            let hwtype = hardware_type(&fd, &device).map_err(|e| init_err("SIOCGIFHWADDR", e))?;
            link_type_for(hwtype).ok_or_else(|| {
                CaptureError::device_init(
                    &device,
                    format!("hardware type {hwtype} is not Ethernet, use live capture"),
                )
            })?
        };

        set_option(&fd, libc::SOL_PACKET, PACKET_VERSION, &TPACKET_V3)
            .map_err(|e| init_err("PACKET_VERSION", e))?;

        let frames_per_block = config.block_size / FRAME_SIZE;
        let req = TpacketReq3 {
            tp_block_size: config.block_size,
            tp_block_nr: config.block_count,
            tp_frame_size: FRAME_SIZE,
            tp_frame_nr: frames_per_block.saturating_mul(config.block_count),
            tp_retire_blk_tov: u32::try_from(config.read_timeout_ms).unwrap_or(u32::MAX),
            tp_sizeof_priv: 0,
            tp_feature_req_word: 0,
        };
        set_option(&fd, libc::SOL_PACKET, PACKET_RX_RING, &req)
            .map_err(|e| init_err("PACKET_RX_RING", e))?;

        let len = config.block_size as usize * config.block_count as usize;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(init_err("mmap", io::Error::last_os_error()));
        }
        let ring = RingMap {
            base: base.cast(),
            len,
        };

        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = protocol;
        addr.sll_ifindex = ifindex;
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&addr as *const libc::sockaddr_ll).cast(),
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(init_err("bind", io::Error::last_os_error()));
        }

        // released by the kernel together with the socket
        if config.auto_promiscuous && ifindex != 0 {
            let mreq = PacketMreq {
                mr_ifindex: ifindex,
                mr_type: PACKET_MR_PROMISC,
                mr_alen: 0,
                mr_address: [0; 8],
            };
            set_option(&fd, libc::SOL_PACKET, PACKET_ADD_MEMBERSHIP, &mreq)
                .map_err(|e| init_err("PACKET_ADD_MEMBERSHIP", e))?;
        }

        info!(
            device = %device,
            block_size = config.block_size,
            block_count = config.block_count,
            auto_promiscuous = config.auto_promiscuous,
            "opened fast ring capture"
        );

        Ok(Self {
            device,
            ring: Some(ring),
            fd: Some(fd),
            link_type,
            snap_len: config.snap_len,
            poll_timeout_ms: c_int::try_from(config.read_timeout_ms).unwrap_or(c_int::MAX),
            block_size: config.block_size as usize,
            block_count: config.block_count as usize,
            current_block: 0,
            cursor: BlockCursor::default(),
            stats: CaptureStats::default(),
        })
    }

    fn raw_fd(&self) -> Result<c_int> {
        self.fd
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| CaptureError::closed(&self.device))
    }

    /// Hand the current block back to the kernel and advance
    fn release_block(&mut self, ring: *mut u8) {
        if !self.cursor.held {
            return;
        }
        fence(Ordering::Release);
        unsafe {
            ptr::write_volatile(ring.add(BLOCK_STATUS).cast::<u32>(), TP_STATUS_KERNEL);
        }
        self.cursor = BlockCursor::default();
        self.current_block = (self.current_block + 1) % self.block_count;
    }

    fn wait_readable(&self) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.raw_fd()?,
            events: libc::POLLIN | libc::POLLERR,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, self.poll_timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(CaptureError::read(&self.device, format!("poll: {err}")));
        }
        if pfd.revents & libc::POLLERR != 0 {
            return Err(CaptureError::read(&self.device, "socket error"));
        }
        Ok(rc > 0)
    }
}

impl CaptureHandle for FastRingCapture {
    fn device(&self) -> &str {
        &self.device
    }

    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn read_zero_copy(&mut self) -> Result<(&[u8], CaptureInfo)> {
        let base = match &self.ring {
            Some(ring) => ring.block(self.current_block, self.block_size),
            None => return Err(CaptureError::closed(&self.device)),
        };

        let block = if self.cursor.packets_left > 0 {
            base
        } else {
            self.release_block(base);
            let block = match &self.ring {
                Some(ring) => ring.block(self.current_block, self.block_size),
                None => return Err(CaptureError::closed(&self.device)),
            };
            if !block_ready(block) && (!self.wait_readable()? || !block_ready(block)) {
                return Err(CaptureError::Timeout);
            }
            let num_pkts = unsafe { read_u32(block, BLOCK_NUM_PKTS) };
            let first = unsafe { read_u32(block, BLOCK_FIRST_PKT) } as usize;
            self.cursor = BlockCursor {
                held: true,
                packets_left: num_pkts,
                offset: first,
            };
            if num_pkts == 0 {
                // retired empty by timeout
                return Err(CaptureError::Timeout);
            }
            block
        };

        let offset = self.cursor.offset;
        if offset + PKT_MAC + 2 > self.block_size {
            return Err(CaptureError::read(&self.device, "corrupt ring block"));
        }
        let (next, sec, nsec, snaplen, len, mac) = unsafe {
            let hdr = block.add(offset);
            (
                read_u32(hdr, PKT_NEXT_OFFSET),
                read_u32(hdr, PKT_SEC),
                read_u32(hdr, PKT_NSEC),
                read_u32(hdr, PKT_SNAPLEN),
                read_u32(hdr, PKT_LEN),
                ptr::read_unaligned(hdr.add(PKT_MAC).cast::<u16>()),
            )
        };

        let capture_length = snaplen.min(self.snap_len);
        let start = offset + usize::from(mac);
        if start + capture_length as usize > self.block_size {
            return Err(CaptureError::read(&self.device, "corrupt ring block"));
        }

        self.cursor.packets_left -= 1;
        self.cursor.offset += next as usize;

        let data = unsafe { std::slice::from_raw_parts(block.add(start), capture_length as usize) };
        let info = CaptureInfo {
            timestamp: DateTime::from_timestamp(i64::from(sec), nsec).unwrap_or_default(),
            capture_length,
            length: len,
        };
        Ok((data, info))
    }

    fn set_filter(&mut self, expression: &str) -> Result<()> {
        let fd = self.raw_fd()?;
        let program = bpf::compile(expression)?;
        let mut filters: Vec<libc::sock_filter> = program
            .instructions()
            .iter()
            .map(|ins| libc::sock_filter {
                code: ins.code,
                jt: ins.jt,
                jf: ins.jf,
                k: ins.k,
            })
            .collect();
        let fprog = libc::sock_fprog {
            len: filters.len() as u16,
            filter: filters.as_mut_ptr(),
        };
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                (&fprog as *const libc::sock_fprog).cast(),
                mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(CaptureError::filter(
                expression,
                io::Error::last_os_error().to_string(),
            ));
        }
        debug!(device = %self.device, filter = expression, instructions = filters.len(), "attached filter");
        Ok(())
    }

    fn stats(&mut self) -> Result<CaptureStats> {
        let fd = self.raw_fd()?;
        let mut raw = TpacketStatsV3::default();
        let mut len = mem::size_of::<TpacketStatsV3>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_PACKET,
                PACKET_STATISTICS,
                (&mut raw as *mut TpacketStatsV3).cast(),
                &mut len,
            )
        };
        if rc < 0 {
            return Err(CaptureError::stats(
                &self.device,
                io::Error::last_os_error().to_string(),
            ));
        }
        // reset on read; tp_packets includes drops
        let delivered = raw.tp_packets.saturating_sub(raw.tp_drops);
        self.stats
            .accumulate(u64::from(delivered), u64::from(raw.tp_drops));
        Ok(self.stats)
    }

    fn close(&mut self) {
        let had_ring = self.ring.take().is_some();
        let had_fd = self.fd.take().is_some();
        if had_ring || had_fd {
            debug!(device = %self.device, "closed fast ring capture");
        }
    }
}

fn block_ready(block: *mut u8) -> bool {
    let status = unsafe { ptr::read_volatile(block.add(BLOCK_STATUS).cast::<u32>()) };
    fence(Ordering::Acquire);
    status & TP_STATUS_USER != 0
}

unsafe fn read_u32(base: *const u8, offset: usize) -> u32 {
    ptr::read_unaligned(base.add(offset).cast::<u32>())
}

/// Interface index; `any` binds every interface
fn interface_index(device: &str) -> Result<c_int> {
    if device == "any" {
        return Ok(0);
    }
    let name = CString::new(device)
        .map_err(|_| CaptureError::device_init(device, "device name contains NUL"))?;
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(CaptureError::device_init(
            device,
            io::Error::last_os_error().to_string(),
        ));
    }
    c_int::try_from(index).map_err(|_| CaptureError::device_init(device, "interface index out of range"))
}

/// ARPHRD_* hardware type of a named interface
fn hardware_type(fd: &OwnedFd, device: &str) -> io::Result<u16> {
    let mut req: IfreqHwaddr = unsafe { mem::zeroed() };
    for (dst, src) in req
        .ifr_name
        .iter_mut()
        .take(libc::IFNAMSIZ - 1)
        .zip(device.as_bytes())
    {
        *dst = *src as libc::c_char;
    }
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), SIOCGIFHWADDR as _, &mut req as *mut IfreqHwaddr) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(req.ifr_hwaddr.sa_family)
}

/// Framing the ring delivers for a hardware type; loopback carries a
/// zeroed Ethernet header
fn link_type_for(hwtype: u16) -> Option<LinkType> {
    match hwtype {
        ARPHRD_ETHER | ARPHRD_LOOPBACK => Some(LinkType::Ethernet),
        _ => None,
    }
}

fn set_option<T>(fd: &OwnedFd, level: c_int, name: c_int, value: &T) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            (value as *const T).cast(),
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_geometry() {
        let mut config = CaptureConfig::new("lo");
        config.block_size = 5000;
        assert!(matches!(
            FastRingCapture::open(&config),
            Err(CaptureError::DeviceInit { .. })
        ));

        let mut config = CaptureConfig::new("lo");
        config.block_count = 0;
        assert!(matches!(
            FastRingCapture::open(&config),
            Err(CaptureError::DeviceInit { .. })
        ));
    }

    #[test]
    fn test_unknown_interface() {
        let config = CaptureConfig::new("dnscope-no-such-if0");
        assert!(matches!(
            FastRingCapture::open(&config),
            Err(CaptureError::DeviceInit { .. })
        ));
    }

    #[test]
    fn test_interface_any_is_index_zero() {
        assert_eq!(interface_index("any").unwrap(), 0);
    }

    #[test]
    fn test_link_type_for_hardware_type() {
        assert_eq!(link_type_for(ARPHRD_ETHER), Some(LinkType::Ethernet));
        assert_eq!(link_type_for(ARPHRD_LOOPBACK), Some(LinkType::Ethernet));
        // tun devices, PPP and IP-in-IP tunnels carry no Ethernet header
        assert_eq!(link_type_for(0xFFFE), None);
        assert_eq!(link_type_for(512), None);
        assert_eq!(link_type_for(768), None);
    }

    #[test]
    fn test_open_read_close_twice_on_loopback() {
        let mut config = CaptureConfig::new("lo");
        config.read_timeout_ms = 50;
        let mut cap = match FastRingCapture::open(&config) {
            Ok(cap) => cap,
            // needs CAP_NET_RAW
            Err(CaptureError::DeviceInit { .. }) => return,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(cap.link_type(), LinkType::Ethernet);
        cap.set_filter("port 53").unwrap();

        match cap.read_zero_copy() {
            Ok((data, info)) => assert_eq!(data.len(), info.capture_length as usize),
            Err(CaptureError::Timeout) => {}
            Err(e) => panic!("unexpected read error: {e}"),
        }
        cap.stats().unwrap();

        cap.close();
        cap.close();
        assert!(matches!(cap.read_zero_copy(), Err(CaptureError::Read { .. })));
        assert!(matches!(cap.stats(), Err(CaptureError::Read { .. })));
    }
}
