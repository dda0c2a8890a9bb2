//! Classic BPF program model
//!
//! Filters are compiled from tcpdump syntax by libpcap, then kept in this
//! backend-neutral form so the same program can be attached to an AF_PACKET
//! socket or evaluated in userspace by the mock backend.

use std::fmt;
use std::str::FromStr;

use crate::error::{CaptureError, Result};

/// Kernel limit on program length (BPF_MAXINSNS)
pub const MAX_INSTRUCTIONS: usize = 4096;

/// Scratch memory slots (BPF_MEMWORDS)
const MEM_WORDS: usize = 16;

// instruction classes
const LD: u16 = 0x00;
const LDX: u16 = 0x01;
const ST: u16 = 0x02;
const STX: u16 = 0x03;
const ALU: u16 = 0x04;
const JMP: u16 = 0x05;
const RET: u16 = 0x06;
const MISC: u16 = 0x07;

// sizes
const W: u16 = 0x00;
const H: u16 = 0x08;
const B: u16 = 0x10;

// modes
const IMM: u16 = 0x00;
const ABS: u16 = 0x20;
const IND: u16 = 0x40;
const MEM: u16 = 0x60;
const LEN: u16 = 0x80;
const MSH: u16 = 0xa0;

// operand source
const K: u16 = 0x00;
const X: u16 = 0x08;

/// One `sock_filter` instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BpfInstruction {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl BpfInstruction {
    pub const fn new(code: u16, jt: u8, jf: u8, k: u32) -> Self {
        Self { code, jt, jf, k }
    }

    fn class(&self) -> u16 {
        self.code & 0x07
    }
}

impl fmt::Display for BpfInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.code, self.jt, self.jf, self.k)
    }
}

impl FromStr for BpfInstruction {
    type Err = String;

    /// Parses the `code jt jf k` form libpcap prints for `-ddd`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut fields = s.split_whitespace();
        let mut next = |what: &str| {
            fields
                .next()
                .ok_or_else(|| format!("missing {what} in '{s}'"))
        };
        let code = next("code")?.parse().map_err(|e| format!("code: {e}"))?;
        let jt = next("jt")?.parse().map_err(|e| format!("jt: {e}"))?;
        let jf = next("jf")?.parse().map_err(|e| format!("jf: {e}"))?;
        let k = next("k")?.parse().map_err(|e| format!("k: {e}"))?;
        Ok(Self { code, jt, jf, k })
    }
}

/// A validated classic BPF program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BpfProgram {
    instructions: Vec<BpfInstruction>,
}

impl BpfProgram {
    /// Validate and wrap a raw instruction list
    ///
    /// Rejects empty or oversized programs, out-of-range jumps, scratch
    /// indices past the last slot and programs that can fall off the end.
    pub fn new(instructions: Vec<BpfInstruction>) -> std::result::Result<Self, String> {
        let len = instructions.len();
        if len == 0 {
            return Err("empty program".to_string());
        }
        if len > MAX_INSTRUCTIONS {
            return Err(format!("{len} instructions exceeds limit of {MAX_INSTRUCTIONS}"));
        }
        for (pc, ins) in instructions.iter().enumerate() {
            match ins.class() {
                JMP => {
                    let targets: &[usize] = if ins.code & 0xf0 == 0x00 {
                        &[ins.k as usize]
                    } else {
                        &[ins.jt as usize, ins.jf as usize]
                    };
                    if targets.iter().any(|off| pc + 1 + off >= len) {
                        return Err(format!("jump out of range at {pc}"));
                    }
                }
                LD | LDX if ins.code & 0xe0 == MEM && ins.k as usize >= MEM_WORDS => {
                    return Err(format!("scratch index {} out of range at {pc}", ins.k));
                }
                ST | STX if ins.k as usize >= MEM_WORDS => {
                    return Err(format!("scratch index {} out of range at {pc}", ins.k));
                }
                _ => {}
            }
        }
        if instructions[len - 1].class() != RET {
            return Err("program does not end with a return".to_string());
        }
        Ok(Self { instructions })
    }

    /// Ethernet program equivalent to tcpdump's `port N`
    ///
    /// Matches TCP, UDP and SCTP over IPv4 (unfragmented) and IPv6 without
    /// extension headers, on either source or destination port.
    pub fn port(port: u16) -> Self {
        let p = u32::from(port);
        let instructions = vec![
            BpfInstruction::new(LD | H | ABS, 0, 0, 12),
            BpfInstruction::new(JMP | 0x10, 0, 8, 0x86dd),
            BpfInstruction::new(LD | B | ABS, 0, 0, 20),
            BpfInstruction::new(JMP | 0x10, 2, 0, 0x84),
            BpfInstruction::new(JMP | 0x10, 1, 0, 0x06),
            BpfInstruction::new(JMP | 0x10, 0, 17, 0x11),
            BpfInstruction::new(LD | H | ABS, 0, 0, 54),
            BpfInstruction::new(JMP | 0x10, 14, 0, p),
            BpfInstruction::new(LD | H | ABS, 0, 0, 56),
            BpfInstruction::new(JMP | 0x10, 12, 13, p),
            BpfInstruction::new(JMP | 0x10, 0, 12, 0x0800),
            BpfInstruction::new(LD | B | ABS, 0, 0, 23),
            BpfInstruction::new(JMP | 0x10, 2, 0, 0x84),
            BpfInstruction::new(JMP | 0x10, 1, 0, 0x06),
            BpfInstruction::new(JMP | 0x10, 0, 8, 0x11),
            BpfInstruction::new(LD | H | ABS, 0, 0, 20),
            BpfInstruction::new(JMP | 0x40, 6, 0, 0x1fff),
            BpfInstruction::new(LDX | B | MSH, 0, 0, 14),
            BpfInstruction::new(LD | H | IND, 0, 0, 14),
            BpfInstruction::new(JMP | 0x10, 2, 0, p),
            BpfInstruction::new(LD | H | IND, 0, 0, 16),
            BpfInstruction::new(JMP | 0x10, 0, 1, p),
            BpfInstruction::new(RET | K, 0, 0, 262_144),
            BpfInstruction::new(RET | K, 0, 0, 0),
        ];
        Self { instructions }
    }

    pub fn instructions(&self) -> &[BpfInstruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Whether the program accepts `packet`
    pub fn matches(&self, packet: &[u8]) -> bool {
        self.run(packet) > 0
    }

    /// Run the program and return the accepted snapshot length (0 = drop)
    ///
    /// Out-of-bounds loads and division by zero reject the packet, as the
    /// kernel interpreter does.
    pub fn run(&self, packet: &[u8]) -> u32 {
        let mut a: u32 = 0;
        let mut x: u32 = 0;
        let mut mem = [0u32; MEM_WORDS];
        let mut pc = 0usize;

        while let Some(ins) = self.instructions.get(pc) {
            pc += 1;
            let k = ins.k;
            match ins.class() {
                LD => {
                    a = match ins.code & 0xe0 {
                        IMM => k,
                        LEN => packet.len() as u32,
                        MEM => mem[k as usize],
                        ABS => match load(packet, k as usize, ins.code & 0x18) {
                            Some(v) => v,
                            None => return 0,
                        },
                        IND => match load(packet, x.wrapping_add(k) as usize, ins.code & 0x18) {
                            Some(v) => v,
                            None => return 0,
                        },
                        _ => return 0,
                    }
                }
                LDX => {
                    x = match ins.code & 0xe0 {
                        IMM => k,
                        LEN => packet.len() as u32,
                        MEM => mem[k as usize],
                        MSH => match packet.get(k as usize) {
                            Some(b) => u32::from(b & 0x0f) * 4,
                            None => return 0,
                        },
                        _ => return 0,
                    }
                }
                ST => mem[k as usize] = a,
                STX => mem[k as usize] = x,
                ALU => {
                    let operand = if ins.code & X != 0 { x } else { k };
                    a = match ins.code & 0xf0 {
                        0x00 => a.wrapping_add(operand),
                        0x10 => a.wrapping_sub(operand),
                        0x20 => a.wrapping_mul(operand),
                        0x30 => match a.checked_div(operand) {
                            Some(v) => v,
                            None => return 0,
                        },
                        0x40 => a | operand,
                        0x50 => a & operand,
                        0x60 => a.checked_shl(operand).unwrap_or(0),
                        0x70 => a.checked_shr(operand).unwrap_or(0),
                        0x80 => a.wrapping_neg(),
                        0x90 => match a.checked_rem(operand) {
                            Some(v) => v,
                            None => return 0,
                        },
                        0xa0 => a ^ operand,
                        _ => return 0,
                    }
                }
                JMP => {
                    let operand = if ins.code & X != 0 { x } else { k };
                    let taken = match ins.code & 0xf0 {
                        0x00 => {
                            pc += k as usize;
                            continue;
                        }
                        0x10 => a == operand,
                        0x20 => a > operand,
                        0x30 => a >= operand,
                        0x40 => a & operand != 0,
                        _ => return 0,
                    };
                    let offset = if taken { ins.jt } else { ins.jf };
                    pc += usize::from(offset);
                }
                RET => {
                    return match ins.code & 0x18 {
                        0x10 => a,
                        X => x,
                        _ => k,
                    };
                }
                MISC => {
                    if ins.code & 0xf8 == 0x80 {
                        a = x;
                    } else {
                        x = a;
                    }
                }
                _ => return 0,
            }
        }
        0
    }
}

fn load(packet: &[u8], offset: usize, size: u16) -> Option<u32> {
    match size {
        W => packet
            .get(offset..offset.checked_add(4)?)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
        H => packet
            .get(offset..offset.checked_add(2)?)
            .map(|b| u32::from(u16::from_be_bytes([b[0], b[1]]))),
        B => packet.get(offset).map(|b| u32::from(*b)),
        _ => None,
    }
}

/// Compile a tcpdump-syntax expression for Ethernet framing
#[cfg(feature = "pcap")]
pub fn compile(expression: &str) -> Result<BpfProgram> {
    let dead = pcap::Capture::dead(pcap::Linktype::ETHERNET)
        .map_err(|e| CaptureError::filter(expression, e.to_string()))?;
    let compiled = dead
        .compile(expression, true)
        .map_err(|e| CaptureError::filter(expression, e.to_string()))?;
    let instructions = compiled
        .get_instructions()
        .iter()
        .map(|ins| ins.to_string().parse::<BpfInstruction>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| CaptureError::filter(expression, e))?;
    BpfProgram::new(instructions).map_err(|e| CaptureError::filter(expression, e))
}

/// Compile a tcpdump-syntax expression for Ethernet framing
///
/// Without libpcap only the `port N` primitive is understood.
#[cfg(not(feature = "pcap"))]
pub fn compile(expression: &str) -> Result<BpfProgram> {
    let mut words = expression.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (Some("port"), Some(port), None) => port
            .parse::<u16>()
            .map(BpfProgram::port)
            .map_err(|e| CaptureError::filter(expression, format!("bad port: {e}"))),
        _ => Err(CaptureError::filter(
            expression,
            "built without libpcap, only 'port N' is supported",
        )),
    }
}
