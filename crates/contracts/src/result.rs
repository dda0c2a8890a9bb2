//! DnsResult - capture/decode output
//!
//! One decoded DNS message plus the network envelope it arrived in.
//! After hand-off to the dispatcher it is shared behind an `Arc` by every
//! sink and must never be mutated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Decoded DNS result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsResult {
    /// Capture timestamp of the frame carrying the message
    pub timestamp: DateTime<Utc>,

    /// Source address
    pub src_ip: IpAddr,

    /// Destination address
    pub dst_ip: IpAddr,

    /// Source port
    pub src_port: u16,

    /// Destination port
    pub dst_port: u16,

    /// Transport protocol
    pub protocol: Transport,

    /// IP version (4 or 6)
    pub ip_version: u8,

    /// Frame length on the wire
    pub packet_length: u16,

    /// Decoded DNS message
    pub dns: DnsMessage,
}

impl DnsResult {
    /// Source address as 16 bytes (IPv4 is mapped into IPv6)
    pub fn src_ip_16(&self) -> [u8; 16] {
        to_16(self.src_ip)
    }

    /// Destination address as 16 bytes (IPv4 is mapped into IPv6)
    pub fn dst_ip_16(&self) -> [u8; 16] {
        to_16(self.dst_ip)
    }
}

fn to_16(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    /// Three-letter column value
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded DNS message (header, question section, EDNS0)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsMessage {
    /// Transaction id
    pub id: u16,

    /// QR flag: true for responses
    pub response: bool,

    /// Opcode (4 bits)
    pub opcode: u8,

    /// Response code (4 bits of the header, extended rcode not folded in)
    pub rcode: u8,

    /// Question section
    pub questions: Vec<Question>,

    /// EDNS0 OPT pseudo-record, if present
    pub edns0: Option<Edns0>,
}

impl DnsMessage {
    /// Whether an OPT record was present
    pub fn has_edns0(&self) -> bool {
        self.edns0.is_some()
    }

    /// Whether the DNSSEC OK bit was set
    pub fn do_bit(&self) -> bool {
        self.edns0.map(|e| e.do_bit).unwrap_or(false)
    }
}

/// One entry of the question section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    /// Query name, dotted, with trailing root dot
    pub name: String,

    /// QTYPE
    pub qtype: u16,

    /// QCLASS
    pub qclass: u16,
}

/// EDNS0 OPT record summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edns0 {
    /// Advertised UDP payload size
    pub udp_payload_size: u16,

    /// DNSSEC OK
    pub do_bit: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn sample() -> DnsResult {
        DnsResult {
            timestamp: Utc::now(),
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_ip: IpAddr::V6(Ipv6Addr::LOCALHOST),
            src_port: 53000,
            dst_port: 53,
            protocol: Transport::Udp,
            ip_version: 4,
            packet_length: 74,
            dns: DnsMessage {
                id: 7,
                response: false,
                opcode: 0,
                rcode: 0,
                questions: vec![Question {
                    name: "example.com.".to_string(),
                    qtype: 1,
                    qclass: 1,
                }],
                edns0: Some(Edns0 {
                    udp_payload_size: 1232,
                    do_bit: true,
                }),
            },
        }
    }

    #[test]
    fn test_ipv4_is_mapped_to_16_bytes() {
        let result = sample();
        let src = result.src_ip_16();
        assert_eq!(&src[..12], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]);
        assert_eq!(&src[12..], &[10, 0, 0, 1]);
        assert_eq!(result.dst_ip_16(), Ipv6Addr::LOCALHOST.octets());
    }

    #[test]
    fn test_edns_flags() {
        let mut result = sample();
        assert!(result.dns.has_edns0());
        assert!(result.dns.do_bit());
        result.dns.edns0 = None;
        assert!(!result.dns.do_bit());
    }

    #[test]
    fn test_serializes_protocol_lowercase() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(json.contains("\"protocol\":\"udp\""));
        assert!(json.contains("example.com."));
    }
}
