//! Frame decoder
//!
//! Link → IP → UDP/TCP → DNS header, question section and EDNS0 OPT.
//! Only what the output rows need is decoded; answer and authority records
//! are walked over, never materialized.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use contracts::{CaptureInfo, DnsMessage, DnsResult, Edns0, Question, Transport};
use thiserror::Error;

use crate::handle::LinkType;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;

const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

const TYPE_OPT: u16 = 41;

const MAX_POINTER_HOPS: usize = 32;
const MAX_NAME_LEN: usize = 255;

/// Why a frame could not be turned into a `DnsResult`
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("unsupported ethertype 0x{0:04x}")]
    EtherType(u16),

    #[error("unsupported IP version {0}")]
    IpVersion(u8),

    #[error("IP fragments are not reassembled")]
    Fragmented,

    #[error("unsupported transport protocol {0}")]
    Transport(u8),

    #[error("segment carries no DNS payload")]
    NoPayload,

    #[error("malformed name: {0}")]
    Name(&'static str),
}

type Result<T> = std::result::Result<T, DecodeError>;

/// Decode one captured frame
pub fn decode(link_type: LinkType, frame: &[u8], info: &CaptureInfo) -> Result<DnsResult> {
    let (ethertype, ip) = match link_type {
        LinkType::Ethernet => strip_ethernet(frame)?,
        LinkType::LinuxSll => {
            let proto = be16(frame, 14).ok_or(DecodeError::Truncated("sll header"))?;
            (proto, &frame[16..])
        }
        LinkType::RawIp => match frame.first().map(|b| b >> 4) {
            Some(4) => (ETHERTYPE_IPV4, frame),
            Some(6) => (ETHERTYPE_IPV6, frame),
            Some(v) => return Err(DecodeError::IpVersion(v)),
            None => return Err(DecodeError::Truncated("ip header")),
        },
    };

    let packet = match ethertype {
        ETHERTYPE_IPV4 => parse_ipv4(ip)?,
        ETHERTYPE_IPV6 => parse_ipv6(ip)?,
        other => return Err(DecodeError::EtherType(other)),
    };

    let (protocol, src_port, dst_port, payload) = match packet.protocol {
        PROTO_UDP => {
            let hdr = packet
                .payload
                .get(..8)
                .ok_or(DecodeError::Truncated("udp header"))?;
            (Transport::Udp, be16(hdr, 0).unwrap_or(0), be16(hdr, 2).unwrap_or(0), &packet.payload[8..])
        }
        PROTO_TCP => {
            let seg = packet.payload;
            let offset = usize::from(seg.get(12).ok_or(DecodeError::Truncated("tcp header"))? >> 4) * 4;
            if offset < 20 || seg.len() < offset {
                return Err(DecodeError::Truncated("tcp header"));
            }
            let data = &seg[offset..];
            if data.is_empty() {
                return Err(DecodeError::NoPayload);
            }
            let len = usize::from(be16(data, 0).ok_or(DecodeError::Truncated("tcp length prefix"))?);
            let msg = data
                .get(2..2 + len)
                .ok_or(DecodeError::Truncated("tcp dns message"))?;
            (Transport::Tcp, be16(seg, 0).unwrap_or(0), be16(seg, 2).unwrap_or(0), msg)
        }
        other => return Err(DecodeError::Transport(other)),
    };

    Ok(DnsResult {
        timestamp: info.timestamp,
        src_ip: packet.src,
        dst_ip: packet.dst,
        src_port,
        dst_port,
        protocol,
        ip_version: packet.version,
        packet_length: u16::try_from(info.length).unwrap_or(u16::MAX),
        dns: parse_dns(payload)?,
    })
}

struct IpPacket<'a> {
    version: u8,
    src: IpAddr,
    dst: IpAddr,
    protocol: u8,
    payload: &'a [u8],
}

fn strip_ethernet(frame: &[u8]) -> Result<(u16, &[u8])> {
    let mut offset = 12;
    let mut ethertype = be16(frame, offset).ok_or(DecodeError::Truncated("ethernet header"))?;
    while ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ {
        offset += 4;
        ethertype = be16(frame, offset).ok_or(DecodeError::Truncated("vlan tag"))?;
    }
    Ok((ethertype, &frame[offset + 2..]))
}

fn parse_ipv4(buf: &[u8]) -> Result<IpPacket<'_>> {
    let hdr = buf.get(..20).ok_or(DecodeError::Truncated("ipv4 header"))?;
    if hdr[0] >> 4 != 4 {
        return Err(DecodeError::IpVersion(hdr[0] >> 4));
    }
    let ihl = usize::from(hdr[0] & 0x0f) * 4;
    let total = usize::from(u16::from_be_bytes([hdr[2], hdr[3]]));
    if ihl < 20 || buf.len() < ihl {
        return Err(DecodeError::Truncated("ipv4 header"));
    }
    // MF flag or non-zero fragment offset
    if u16::from_be_bytes([hdr[6], hdr[7]]) & 0x3fff != 0 {
        return Err(DecodeError::Fragmented);
    }
    // trailing ethernet padding is not payload
    let end = total.clamp(ihl, buf.len());
    Ok(IpPacket {
        version: 4,
        src: IpAddr::V4(Ipv4Addr::new(hdr[12], hdr[13], hdr[14], hdr[15])),
        dst: IpAddr::V4(Ipv4Addr::new(hdr[16], hdr[17], hdr[18], hdr[19])),
        protocol: hdr[9],
        payload: &buf[ihl..end],
    })
}

fn parse_ipv6(buf: &[u8]) -> Result<IpPacket<'_>> {
    let hdr = buf.get(..40).ok_or(DecodeError::Truncated("ipv6 header"))?;
    if hdr[0] >> 4 != 6 {
        return Err(DecodeError::IpVersion(hdr[0] >> 4));
    }
    let payload_len = usize::from(u16::from_be_bytes([hdr[4], hdr[5]]));
    let mut next = hdr[6];
    let end = (40 + payload_len).min(buf.len());
    let mut rest = &buf[40..end];

    // hop-by-hop, routing, destination options
    while matches!(next, 0 | 43 | 60) {
        let ext = rest.get(..2).ok_or(DecodeError::Truncated("ipv6 extension header"))?;
        let len = (usize::from(ext[1]) + 1) * 8;
        next = ext[0];
        rest = rest
            .get(len..)
            .ok_or(DecodeError::Truncated("ipv6 extension header"))?;
    }
    if next == 44 {
        return Err(DecodeError::Fragmented);
    }

    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&hdr[8..24]);
    dst.copy_from_slice(&hdr[24..40]);
    Ok(IpPacket {
        version: 6,
        src: IpAddr::V6(Ipv6Addr::from(src)),
        dst: IpAddr::V6(Ipv6Addr::from(dst)),
        protocol: next,
        payload: rest,
    })
}

/// Parse the DNS header, questions and the EDNS0 OPT record
pub fn parse_dns(msg: &[u8]) -> Result<DnsMessage> {
    let hdr = msg.get(..12).ok_or(DecodeError::Truncated("dns header"))?;
    let flags = u16::from_be_bytes([hdr[2], hdr[3]]);
    let qdcount = u16::from_be_bytes([hdr[4], hdr[5]]);
    let ancount = u16::from_be_bytes([hdr[6], hdr[7]]);
    let nscount = u16::from_be_bytes([hdr[8], hdr[9]]);
    let arcount = u16::from_be_bytes([hdr[10], hdr[11]]);

    let mut pos = 12;
    let mut questions = Vec::with_capacity(usize::from(qdcount.min(16)));
    for _ in 0..qdcount {
        let (name, after) = read_name(msg, pos)?;
        let qtype = be16(msg, after).ok_or(DecodeError::Truncated("question"))?;
        let qclass = be16(msg, after + 2).ok_or(DecodeError::Truncated("question"))?;
        questions.push(Question { name, qtype, qclass });
        pos = after + 4;
    }

    Ok(DnsMessage {
        id: u16::from_be_bytes([hdr[0], hdr[1]]),
        response: flags & 0x8000 != 0,
        opcode: ((flags >> 11) & 0x0f) as u8,
        rcode: (flags & 0x0f) as u8,
        questions,
        // a damaged record section does not invalidate the questions
        edns0: find_opt(msg, pos, ancount, nscount, arcount),
    })
}

fn find_opt(msg: &[u8], mut pos: usize, ancount: u16, nscount: u16, arcount: u16) -> Option<Edns0> {
    let skip = u32::from(ancount) + u32::from(nscount);
    for i in 0..skip + u32::from(arcount) {
        pos = skip_name(msg, pos)?;
        let rtype = be16(msg, pos)?;
        let class = be16(msg, pos + 2)?;
        let ttl = be32(msg, pos + 4)?;
        let rdlen = usize::from(be16(msg, pos + 8)?);
        if i >= skip && rtype == TYPE_OPT {
            return Some(Edns0 {
                udp_payload_size: class,
                do_bit: (ttl >> 15) & 1 == 1,
            });
        }
        pos += 10 + rdlen;
        if pos > msg.len() {
            return None;
        }
    }
    None
}

/// Read a possibly compressed name starting at `pos`; returns the dotted
/// name with trailing root dot and the offset just past it.
fn read_name(msg: &[u8], mut pos: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    let mut end = None;
    let mut hops = 0;

    loop {
        let len = *msg.get(pos).ok_or(DecodeError::Truncated("name"))?;
        match len & 0xc0 {
            0x00 if len == 0 => {
                if name.is_empty() {
                    name.push('.');
                }
                return Ok((name, end.unwrap_or(pos + 1)));
            }
            0x00 => {
                let label = msg
                    .get(pos + 1..pos + 1 + usize::from(len))
                    .ok_or(DecodeError::Truncated("label"))?;
                name.push_str(&String::from_utf8_lossy(label));
                name.push('.');
                if name.len() > MAX_NAME_LEN {
                    return Err(DecodeError::Name("name too long"));
                }
                pos += 1 + usize::from(len);
            }
            0xc0 => {
                let low = *msg.get(pos + 1).ok_or(DecodeError::Truncated("pointer"))?;
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return Err(DecodeError::Name("compression loop"));
                }
                end.get_or_insert(pos + 2);
                pos = (usize::from(len & 0x3f) << 8) | usize::from(low);
            }
            _ => return Err(DecodeError::Name("reserved label type")),
        }
    }
}

fn skip_name(msg: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *msg.get(pos)?;
        match len & 0xc0 {
            0x00 if len == 0 => return Some(pos + 1),
            0x00 => pos += 1 + usize::from(len),
            0xc0 => return Some(pos + 2),
            _ => return None,
        }
    }
}

fn be16(buf: &[u8], offset: usize) -> Option<u16> {
    buf.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}

fn be32(buf: &[u8], offset: usize) -> Option<u32> {
    buf.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}
