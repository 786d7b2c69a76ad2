//! TCP framing: fixed 20-byte header plus TLV option parsing. Hand-rolled
//! against the wire bytes directly rather than through etherparse's
//! `TcpHeader`, so that option construction (`data_offset`,
//! MSS/NOP/SACK-permitted/window-scale) is fully within this crate's
//! control.

use crate::result::{Error, Result};

pub const FIXED_HEADER_LEN: usize = 20;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct TcpFlags {
    pub cwr: bool,
    pub ece: bool,
    pub urg: bool,
    pub ack: bool,
    pub psh: bool,
    pub rst: bool,
    pub syn: bool,
    pub fin: bool,
}

impl TcpFlags {
    fn from_byte(b: u8) -> Self {
        Self {
            cwr: b & 0x80 != 0,
            ece: b & 0x40 != 0,
            urg: b & 0x20 != 0,
            ack: b & 0x10 != 0,
            psh: b & 0x08 != 0,
            rst: b & 0x04 != 0,
            syn: b & 0x02 != 0,
            fin: b & 0x01 != 0,
        }
    }

    fn to_byte(self) -> u8 {
        (self.cwr as u8) << 7
            | (self.ece as u8) << 6
            | (self.urg as u8) << 5
            | (self.ack as u8) << 4
            | (self.psh as u8) << 3
            | (self.rst as u8) << 2
            | (self.syn as u8) << 1
            | (self.fin as u8)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub urgent_pointer: u16,
}

/// The recognized option kinds from the TLV table. Unknown kinds
/// terminate parsing for the rest of the option area.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TcpOption {
    Nop,
    MaxSegmentSize(u16),
    WindowScale(u8),
    SackPermitted,
    Timestamps,
}

const OPT_KIND_NOP: u8 = 1;
const OPT_KIND_MSS: u8 = 2;
const OPT_KIND_WINDOW_SCALE: u8 = 3;
const OPT_KIND_SACK_PERMITTED: u8 = 4;
const OPT_KIND_TIMESTAMPS: u8 = 8;

pub struct ParsedSegment<'a> {
    pub header: TcpHeader,
    pub options: Vec<TcpOption>,
    pub payload: &'a [u8],
}

/// Parses the fixed 20-byte header, then TLV-decodes the option area using
/// the header's own `data_offset` field, then returns the remaining payload.
/// The framing layer does not advance past options on its own — the TCB is
/// the one that decodes them, modeled here as part of the parse step.
pub fn parse(buf: &[u8]) -> Result<ParsedSegment<'_>> {
    if buf.len() < FIXED_HEADER_LEN {
        return Err(Error::Malformed("tcp header: too short"));
    }
    let data_offset_words = buf[12] >> 4;
    let header_len = data_offset_words as usize * 4;
    if header_len < FIXED_HEADER_LEN || buf.len() < header_len {
        return Err(Error::Malformed("tcp header: bad data offset"));
    }
    let header = TcpHeader {
        src_port: u16::from_be_bytes([buf[0], buf[1]]),
        dst_port: u16::from_be_bytes([buf[2], buf[3]]),
        seq: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        ack: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        flags: TcpFlags::from_byte(buf[13]),
        window: u16::from_be_bytes([buf[14], buf[15]]),
        urgent_pointer: u16::from_be_bytes([buf[18], buf[19]]),
    };
    let options = decode_options(&buf[FIXED_HEADER_LEN..header_len]);
    Ok(ParsedSegment {
        header,
        options,
        payload: &buf[header_len..],
    })
}

/// TLV decode over the option area; stops at the first unrecognized
/// kind.
pub fn decode_options(mut buf: &[u8]) -> Vec<TcpOption> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        match buf[0] {
            OPT_KIND_NOP => {
                out.push(TcpOption::Nop);
                buf = &buf[1..];
            }
            OPT_KIND_MSS if buf.len() >= 4 && buf[1] == 4 => {
                out.push(TcpOption::MaxSegmentSize(u16::from_be_bytes([buf[2], buf[3]])));
                buf = &buf[4..];
            }
            OPT_KIND_WINDOW_SCALE if buf.len() >= 3 && buf[1] == 3 => {
                out.push(TcpOption::WindowScale(buf[2]));
                buf = &buf[3..];
            }
            OPT_KIND_SACK_PERMITTED if buf.len() >= 2 && buf[1] == 2 => {
                out.push(TcpOption::SackPermitted);
                buf = &buf[2..];
            }
            OPT_KIND_TIMESTAMPS if buf.len() >= 10 && buf[1] == 10 => {
                out.push(TcpOption::Timestamps);
                buf = &buf[10..];
            }
            _ => break,
        }
    }
    out
}

/// Encodes options back to their wire form, padded with trailing NOPs to a
/// multiple of 4 bytes (the usual TCP option-area alignment rule).
pub fn encode_options(options: &[TcpOption]) -> Vec<u8> {
    let mut out = Vec::new();
    for opt in options {
        match opt {
            TcpOption::Nop => out.push(OPT_KIND_NOP),
            TcpOption::MaxSegmentSize(mss) => {
                out.push(OPT_KIND_MSS);
                out.push(4);
                out.extend_from_slice(&mss.to_be_bytes());
            }
            TcpOption::WindowScale(shift) => {
                out.push(OPT_KIND_WINDOW_SCALE);
                out.push(3);
                out.push(*shift);
            }
            TcpOption::SackPermitted => {
                out.push(OPT_KIND_SACK_PERMITTED);
                out.push(2);
            }
            TcpOption::Timestamps => {
                out.push(OPT_KIND_TIMESTAMPS);
                out.push(10);
                out.extend_from_slice(&[0u8; 8]);
            }
        }
    }
    while out.len() % 4 != 0 {
        out.push(OPT_KIND_NOP);
    }
    out
}

/// Writes the fixed header plus options into `out`, leaving the checksum
/// field zeroed for the caller to fill in once the pseudo-header sum is
/// known.
pub fn write(header: &TcpHeader, options: &[u8], out: &mut [u8]) {
    let header_words = (FIXED_HEADER_LEN + options.len()) / 4;
    out[0..2].copy_from_slice(&header.src_port.to_be_bytes());
    out[2..4].copy_from_slice(&header.dst_port.to_be_bytes());
    out[4..8].copy_from_slice(&header.seq.to_be_bytes());
    out[8..12].copy_from_slice(&header.ack.to_be_bytes());
    out[12] = (header_words as u8) << 4;
    out[13] = header.flags.to_byte();
    out[14..16].copy_from_slice(&header.window.to_be_bytes());
    out[16..18].copy_from_slice(&0u16.to_be_bytes());
    out[18..20].copy_from_slice(&header.urgent_pointer.to_be_bytes());
    out[FIXED_HEADER_LEN..FIXED_HEADER_LEN + options.len()].copy_from_slice(options);
}

pub fn set_checksum(out: &mut [u8], checksum: u16) {
    out[16..18].copy_from_slice(&checksum.to_be_bytes());
}
