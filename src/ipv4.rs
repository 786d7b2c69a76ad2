//! IPv4 (L3): parse/build headers, header checksum, routing + ARP-assisted
//! egress, protocol-number dispatch to ICMP/TCP.
//!
//! Ingress parsing reuses `etherparse::Ipv4HeaderSlice`
//! (`source_addr()`/`destination_addr()`/`slice()`); egress construction is
//! hand-rolled against the internet checksum in `checksum.rs` rather than
//! etherparse's header-builder API, which this crate's pinned etherparse
//! version exercises in ways too narrow to trust (see DESIGN.md).

use std::net::Ipv4Addr;

use etherparse::Ipv4HeaderSlice;

use crate::checksum::internet_checksum;
use crate::net_types::Protocol;
use crate::result::{Error, Result};

pub const MIN_HEADER_LEN: usize = 20;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Ipv4Header {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: Protocol,
    pub ttl: u8,
    pub id: u16,
}

/// A parsed ingress IPv4 datagram: header plus the payload slice starting
/// right after the (possibly option-bearing) header.
pub struct Ipv4Packet<'a> {
    pub header: Ipv4Header,
    pub payload: &'a [u8],
}

/// Accepts only version=4; parses the fixed header via etherparse,
/// then the protocol byte and header length directly off the wire bytes
/// (no assumption about accessor names beyond the three already used
/// elsewhere in this crate).
pub fn parse(buf: &[u8]) -> Result<Ipv4Packet<'_>> {
    if buf.is_empty() || (buf[0] >> 4) != 4 {
        return Err(Error::Malformed("ipv4 header: not version 4"));
    }
    let slice = Ipv4HeaderSlice::from_slice(buf).map_err(|_| Error::Malformed("ipv4 header"))?;
    let header_len = slice.slice().len();
    if buf.len() < header_len {
        return Err(Error::Malformed("ipv4 header: truncated"));
    }
    let protocol = Protocol::from(buf[9]);
    let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let end = total_len.min(buf.len());
    if end < header_len {
        return Err(Error::Malformed("ipv4 header: total_len shorter than header"));
    }
    Ok(Ipv4Packet {
        header: Ipv4Header {
            src: slice.source_addr(),
            dst: slice.destination_addr(),
            protocol,
            ttl: buf[8],
            id: u16::from_be_bytes([buf[4], buf[5]]),
        },
        payload: &buf[header_len..end],
    })
}

/// Builds a 20-byte IPv4 header (no options) with the checksum field filled
/// in: version=4, IHL=5, computed total length, `id`, TTL, protocol,
/// src/dst, header checksum over the 20 bytes with the checksum field
/// zeroed.
pub fn build(header: &Ipv4Header, payload_len: usize) -> [u8; MIN_HEADER_LEN] {
    let mut out = [0u8; MIN_HEADER_LEN];
    out[0] = 0x45; // version 4, IHL 5
    out[1] = 0; // DSCP/ECN
    let total_len = (MIN_HEADER_LEN + payload_len) as u16;
    out[2..4].copy_from_slice(&total_len.to_be_bytes());
    out[4..6].copy_from_slice(&header.id.to_be_bytes());
    out[6..8].copy_from_slice(&0u16.to_be_bytes()); // flags/fragment offset
    out[8] = header.ttl;
    out[9] = header.protocol.to_u8();
    out[10..12].copy_from_slice(&0u16.to_be_bytes()); // checksum placeholder
    out[12..16].copy_from_slice(&header.src.octets());
    out[16..20].copy_from_slice(&header.dst.octets());
    let csum = internet_checksum(&out);
    out[10..12].copy_from_slice(&csum.to_be_bytes());
    out
}

/// Monotonically increasing 16-bit identification counter, one per
/// namespace.
#[derive(Default)]
pub struct IdGenerator(u16);

impl IdGenerator {
    pub fn next(&mut self) -> u16 {
        let id = self.0;
        self.0 = self.0.wrapping_add(1);
        id
    }
}
