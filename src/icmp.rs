//! ICMP: echo-reply only.

use crate::checksum::icmp_checksum;
use crate::meta::ICMP_HEADER_SIZE;
use crate::result::{Error, Result};

const TYPE_ECHO_REQUEST: u8 = 8;
const TYPE_ECHO_REPLY: u8 = 0;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IcmpHeader {
    pub ty: u8,
    pub code: u8,
    pub id: u16,
    pub seq: u16,
}

impl IcmpHeader {
    pub const SIZE: usize = ICMP_HEADER_SIZE;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::Malformed("icmp header"));
        }
        Ok(Self {
            ty: buf[0],
            code: buf[1],
            id: u16::from_be_bytes([buf[4], buf[5]]),
            seq: u16::from_be_bytes([buf[6], buf[7]]),
        })
    }

    pub fn write(&self, out: &mut [u8], checksum: u16) {
        out[0] = self.ty;
        out[1] = self.code;
        out[2..4].copy_from_slice(&checksum.to_be_bytes());
        out[4..6].copy_from_slice(&self.id.to_be_bytes());
        out[6..8].copy_from_slice(&self.seq.to_be_bytes());
    }

    pub fn is_echo_request(&self) -> bool {
        self.ty == TYPE_ECHO_REQUEST
    }
}

/// Builds an echo reply (header + payload) for an echo request, preserving
/// `id`/`seq`/payload and computing the ICMP checksum over header+payload.
pub fn build_echo_reply(request: &IcmpHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; IcmpHeader::SIZE + payload.len()];
    let reply = IcmpHeader {
        ty: TYPE_ECHO_REPLY,
        code: 0,
        id: request.id,
        seq: request.seq,
    };
    reply.write(&mut out[..IcmpHeader::SIZE], 0);
    out[IcmpHeader::SIZE..].copy_from_slice(payload);
    let csum = icmp_checksum(&out);
    reply.write(&mut out[..IcmpHeader::SIZE], csum);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_reply_preserves_id_seq_and_payload() {
        let request = IcmpHeader {
            ty: TYPE_ECHO_REQUEST,
            code: 0,
            id: 0x1234,
            seq: 0x0001,
        };
        let payload = [0u8; 32];
        let reply_bytes = build_echo_reply(&request, &payload);
        let reply = IcmpHeader::parse(&reply_bytes).unwrap();
        assert_eq!(reply.ty, TYPE_ECHO_REPLY);
        assert_eq!(reply.id, request.id);
        assert_eq!(reply.seq, request.seq);
        assert_eq!(&reply_bytes[IcmpHeader::SIZE..], &payload[..]);
        assert_eq!(icmp_checksum(&reply_bytes), 0);
    }

    #[test]
    fn is_echo_request_detects_type_8() {
        let h = IcmpHeader {
            ty: 8,
            code: 0,
            id: 0,
            seq: 0,
        };
        assert!(h.is_echo_request());
    }
}
