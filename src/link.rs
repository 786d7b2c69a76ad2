//! L1/L2: the TUN/TAP device and Ethernet framing.

use std::collections::VecDeque;

use crate::addr::MacAddr;
use crate::buf::PacketBuffer;
use crate::meta::ETHERNET_HEADER_SIZE;
use crate::net_types::EtherType;
use crate::result::{Error, Result};

/// Fixed 14-byte Ethernet II header: DMAC, SMAC, EtherType.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EthernetHeader {
    pub dst_mac: MacAddr,
    pub src_mac: MacAddr,
    pub ethertype: EtherType,
}

impl EthernetHeader {
    pub const SIZE: usize = ETHERNET_HEADER_SIZE;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::Malformed("ethernet header"));
        }
        Ok(Self {
            dst_mac: MacAddr::from_slice(&buf[0..6]),
            src_mac: MacAddr::from_slice(&buf[6..12]),
            ethertype: EtherType::from([buf[12], buf[13]]),
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        out[0..6].copy_from_slice(&self.dst_mac.octets());
        out[6..12].copy_from_slice(&self.src_mac.octets());
        out[12..14].copy_from_slice(&self.ethertype.to_u16().to_be_bytes());
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        self.write(&mut out);
        out
    }
}

/// A frame parsed off the wire: header plus the buffer with `head` advanced
/// past it, ready for the upper-protocol dispatch table.
pub struct EthernetFrame {
    pub header: EthernetHeader,
    pub packet: PacketBuffer,
}

/// Strips the Ethernet header and returns the frame for EtherType dispatch.
/// Unknown EtherTypes are still returned here; the caller (the namespace's
/// dispatch table) is the one that drops them.
pub fn deframe(raw: &[u8]) -> Result<EthernetFrame> {
    let header = EthernetHeader::parse(raw)?;
    let packet = PacketBuffer::from_payload(EthernetHeader::SIZE, &raw[EthernetHeader::SIZE..]);
    Ok(EthernetFrame { header, packet })
}

/// Prepends an Ethernet header to an IPv4/ARP payload, producing the bytes
/// ready for `Device::enqueue_write`.
pub fn frame(src_mac: MacAddr, dst_mac: MacAddr, ethertype: EtherType, mut packet: PacketBuffer) -> Result<PacketBuffer> {
    let header = EthernetHeader {
        dst_mac,
        src_mac,
        ethertype,
    };
    packet.prepend(&header.to_bytes())?;
    Ok(packet)
}

/// Owns the file descriptor to the TUN/TAP character device: reads inbound
/// frames, and drives writes one at a time to preserve frame boundaries.
/// Generic over the raw transport so tests can substitute an
/// in-memory stand-in for `tun_tap::Iface`.
pub trait RawIo {
    fn send(&mut self, data: &[u8]) -> std::io::Result<usize>;
    fn recv(&mut self, data: &mut [u8]) -> std::io::Result<usize>;
}

impl RawIo for tun_tap::Iface {
    fn send(&mut self, data: &[u8]) -> std::io::Result<usize> {
        tun_tap::Iface::send(self, data)
    }

    fn recv(&mut self, data: &mut [u8]) -> std::io::Result<usize> {
        tun_tap::Iface::recv(self, data)
    }
}

/// Write-one-at-a-time queue discipline: outbound frames on a single
/// device are written in enqueue order.
pub struct Device<T: RawIo> {
    io: T,
    mtu: usize,
    write_queue: VecDeque<Vec<u8>>,
}

impl<T: RawIo> Device<T> {
    pub fn new(io: T, mtu: usize) -> Self {
        Self {
            io,
            mtu,
            write_queue: VecDeque::new(),
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Borrows the underlying raw transport, e.g. so a test double's
    /// recorded writes can be inspected after draining the queue.
    pub fn io(&self) -> &T {
        &self.io
    }

    /// Enqueues a frame for transmission; call `drain_one` to service it.
    pub fn enqueue_write(&mut self, frame: Vec<u8>) {
        self.write_queue.push_back(frame);
    }

    /// Writes the head-of-queue frame, if any. A write error drops the
    /// failed frame and continues rather than retrying it.
    pub fn drain_one(&mut self) {
        if let Some(frame) = self.write_queue.pop_front() {
            if let Err(e) = self.io.send(&frame) {
                log::warn!("device write failed, dropping frame: {}", e);
            }
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.write_queue.is_empty()
    }

    /// Reads one inbound frame into `buf`, returning the number of bytes
    /// read. Read errors are logged; the caller re-arms reception by calling
    /// this again.
    pub fn read_frame<'a>(&mut self, buf: &'a mut [u8]) -> Result<usize> {
        Ok(self.io.recv(buf)?)
    }
}
