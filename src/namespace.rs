//! The namespace: one instance owns a device, ARP cache, routing table,
//! TCB manager and socket fd table, and is the thing the embedder API and
//! the executor's ingress/egress loop both drive. Multiple independent
//! stacks are possible for free since nothing here is a global — an
//! embedder just constructs more than one `Namespace` over disjoint
//! devices.

use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;

use crate::addr::{Endpoint, FourTuple, MacAddr};
use crate::arp::{Arp, ArpPacket, Resolution};
use crate::buf::PacketBuffer;
use crate::checksum::tcp_checksum;
use crate::config::Config;
use crate::icmp::{self, IcmpHeader};
use crate::ipv4::{self, IdGenerator, Ipv4Header};
use crate::link::{self, Device, RawIo};
use crate::net_types::{EtherType, Protocol};
use crate::result::{Error, Result};
use crate::routing::RoutingTable;
use crate::socket::{FdState, SocketTable};
use crate::tcp::header::{self as tcp_header, FIXED_HEADER_LEN};
use crate::tcp::manager::TcpManager;
use crate::tcp::tcb::Segment;

pub struct Namespace<T: RawIo> {
    config: Config,
    device: Rc<RefCell<Device<T>>>,
    arp: Arp,
    routing: RoutingTable,
    manager: TcpManager,
    sockets: SocketTable,
    ip_id: IdGenerator,
}

impl<T: RawIo> Namespace<T> {
    pub fn new(config: Config, io: T) -> Self {
        let mtu = config.mtu;
        Self {
            config,
            device: Rc::new(RefCell::new(Device::new(io, mtu))),
            arp: Arp::new(),
            routing: RoutingTable::new(),
            manager: TcpManager::new(),
            sockets: SocketTable::new(),
            ip_id: IdGenerator::default(),
        }
    }

    pub fn routing_mut(&mut self) -> &mut RoutingTable {
        &mut self.routing
    }

    pub fn mtu(&self) -> usize {
        self.config.mtu
    }

    /// Our MSS as advertised to peers: MTU minus the fixed IPv4+TCP headers
    /// A conservative MTU-derived value.
    fn our_mss(&self) -> u16 {
        (self.config.mtu.saturating_sub(ipv4::MIN_HEADER_LEN + FIXED_HEADER_LEN)) as u16
    }

    /// One device-read's worth of bytes in, driving ethernet -> arp/ipv4
    /// -> icmp/tcp dispatch.
    pub fn on_frame(&mut self, raw: &[u8]) {
        let frame = match link::deframe(raw) {
            Ok(f) => f,
            Err(e) => {
                log::debug!("malformed ethernet frame, dropping: {}", e);
                return;
            }
        };
        match frame.header.ethertype {
            EtherType::Arp => self.on_arp(frame.packet.payload()),
            EtherType::IPv4 => self.on_ipv4(frame.packet.payload()),
            other => log::debug!("unhandled ethertype {:?}, dropping", other),
        }
    }

    fn on_arp(&mut self, payload: &[u8]) {
        let pkt = match ArpPacket::parse(payload) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("malformed arp packet, dropping: {}", e);
                return;
            }
        };
        let (reply, fired) = self
            .arp
            .handle_ingress(&pkt, self.config.local_mac, self.config.local_ipv4);
        if let Some(reply) = reply {
            self.transmit_frame(self.config.local_mac, reply.target_mac, EtherType::Arp, reply.to_bytes().to_vec());
        }
        for (cb, mac) in fired {
            cb(mac);
        }
    }

    fn on_ipv4(&mut self, buf: &[u8]) {
        let pkt = match ipv4::parse(buf) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("malformed ipv4 packet, dropping: {}", e);
                return;
            }
        };
        match pkt.header.protocol {
            Protocol::ICMP => self.on_icmp(pkt.header.src, pkt.payload),
            Protocol::TCP => self.on_tcp(pkt.header.src, pkt.header.dst, pkt.payload),
            other => log::debug!("unhandled ip protocol {:?}, dropping", other),
        }
    }

    fn on_icmp(&mut self, src: Ipv4Addr, payload: &[u8]) {
        let header = match IcmpHeader::parse(payload) {
            Ok(h) => h,
            Err(e) => {
                log::debug!("malformed icmp packet, dropping: {}", e);
                return;
            }
        };
        if !header.is_echo_request() {
            return;
        }
        let reply = icmp::build_echo_reply(&header, &payload[IcmpHeader::SIZE..]);
        self.send_ipv4(src, Protocol::ICMP, reply);
    }

    fn on_tcp(&mut self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr, payload: &[u8]) {
        let seg = match tcp_header::parse(payload) {
            Ok(s) => s,
            Err(e) => {
                log::debug!("malformed tcp segment, dropping: {}", e);
                return;
            }
        };
        let four_tuple = FourTuple::new(
            Endpoint::new(src_ip, seg.header.src_port),
            Endpoint::new(dst_ip, seg.header.dst_port),
        );
        let our_mss = self.our_mss();
        let outgoing = self
            .manager
            .on_segment(four_tuple, &seg.header, &seg.options, seg.payload, our_mss);
        for item in outgoing {
            self.transmit_segment(item.four_tuple, item.segment);
        }
    }

    fn transmit_segment(&mut self, four_tuple: FourTuple, segment: Segment) {
        let options = tcp_header::encode_options(&segment.options);
        let header_len = FIXED_HEADER_LEN + options.len();
        let mut raw = vec![0u8; header_len + segment.payload.len()];
        tcp_header::write(&segment.header, &options, &mut raw[..header_len]);
        raw[header_len..].copy_from_slice(&segment.payload);
        let checksum = tcp_checksum(four_tuple.local.addr, four_tuple.remote.addr, &raw);
        tcp_header::set_checksum(&mut raw, checksum);
        self.send_ipv4(four_tuple.remote.addr, Protocol::TCP, raw);
    }

    /// IPv4 egress: builds the header, resolves the next hop via
    /// routing + ARP, and hands off to Ethernet once the MAC is known.
    fn send_ipv4(&mut self, dst: Ipv4Addr, protocol: Protocol, payload: Vec<u8>) {
        let route = match self.routing.query(dst) {
            Some(r) => r,
            None => {
                log::warn!("no route to {}, dropping", dst);
                return;
            }
        };
        let header = Ipv4Header {
            src: self.config.local_ipv4,
            dst,
            protocol,
            ttl: self.config.time_to_live,
            id: self.ip_id.next(),
        };
        let mut packet = ipv4::build(&header, payload.len()).to_vec();
        packet.extend_from_slice(&payload);

        let src_mac = self.config.local_mac;
        let local_ip = self.config.local_ipv4;

        if let Some(mac) = self.arp.cache().get(&route.next_hop) {
            self.transmit_frame(src_mac, mac, EtherType::IPv4, packet);
            return;
        }

        let device = self.device.clone();
        let resolution = self.arp.resolve(
            src_mac,
            local_ip,
            route.next_hop,
            Box::new(move |mac| {
                if let Ok(buf) = link::frame(src_mac, mac, EtherType::IPv4, PacketBuffer::from_payload(link::EthernetHeader::SIZE, &packet)) {
                    device.borrow_mut().enqueue_write(buf.into_vec());
                }
            }),
        );
        if let Resolution::Miss { broadcast, should_broadcast } = resolution {
            if should_broadcast {
                self.transmit_frame(
                    src_mac,
                    MacAddr::BROADCAST,
                    EtherType::Arp,
                    broadcast.to_bytes().to_vec(),
                );
            }
        }
    }

    fn transmit_frame(&mut self, src_mac: MacAddr, dst_mac: MacAddr, ethertype: EtherType, payload: Vec<u8>) {
        if let Ok(buf) = link::frame(src_mac, dst_mac, ethertype, PacketBuffer::from_payload(link::EthernetHeader::SIZE, &payload)) {
            self.device.borrow_mut().enqueue_write(buf.into_vec());
        }
    }

    /// Drives one round of device I/O: reads at most one frame (if any is
    /// available) and drains at most one queued write. Intended to be
    /// called in a tight loop by the
    /// embedder's driver (see `main.rs`).
    pub fn poll_device(&mut self, read_buf: &mut [u8]) {
        let n = match self.device.borrow_mut().read_frame(read_buf) {
            Ok(0) => 0,
            Ok(n) => n,
            Err(e) => {
                log::warn!("device read failed, re-arming: {}", e);
                0
            }
        };
        if n > 0 {
            let frame = read_buf[..n].to_vec();
            self.on_frame(&frame);
        }
        if self.device.borrow().has_pending_writes() {
            self.device.borrow_mut().drain_one();
        }
    }

    // ---- embedder API ----

    pub fn socket(&mut self, local: Endpoint) -> i32 {
        self.sockets.socket(local)
    }

    pub fn listen(&mut self, fd: i32) -> Result<()> {
        let local = self.sockets.mark_listening(fd)?;
        self.manager.listen(local);
        Ok(())
    }

    /// Synchronous, non-blocking `accept`: `Ok(None)` means no
    /// completed handshake is queued yet.
    pub fn accept(&mut self, fd: i32) -> Result<Option<i32>> {
        let local = self.sockets.listening_endpoint(fd)?;
        match self.manager.try_accept(local)? {
            Some(four_tuple) => Ok(Some(self.sockets.insert_connected(four_tuple))),
            None => Ok(None),
        }
    }

    /// Synchronous, non-blocking `read`: `Ok(0)` means no data is
    /// buffered right now, not end-of-stream (this design has no
    /// half-closed-read signal beyond CLOSE_WAIT's absence of new FINs).
    pub fn read(&mut self, fd: i32, buf: &mut [u8]) -> Result<usize> {
        let four_tuple = self.sockets.connected_four_tuple(fd)?;
        match self.manager.read_ready(&four_tuple, buf.len()) {
            Some(data) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            None => Ok(0),
        }
    }

    pub fn write(&mut self, fd: i32, buf: &[u8]) -> Result<usize> {
        let four_tuple = self.sockets.connected_four_tuple(fd)?;
        let segments = self
            .manager
            .write_app_data(&four_tuple, buf)
            .ok_or(Error::UnknownFd(fd))??;
        for segment in segments {
            self.transmit_segment(four_tuple, segment);
        }
        Ok(buf.len())
    }

    /// Active open: allocates an ephemeral local port, builds and
    /// transmits the initial SYN, and fires `cb` once the handshake
    /// completes (or never, in this design — no connect timeout).
    pub fn async_connect(
        &mut self,
        remote: Endpoint,
        cb: Box<dyn FnOnce(Result<i32>)>,
    ) -> i32 {
        let local_port = self.sockets.allocate_ephemeral_port();
        let local = Endpoint::new(self.config.local_ipv4, local_port);
        let four_tuple = FourTuple::new(remote, local);
        let fd = self.sockets.insert_connected(four_tuple);
        let our_mss = self.our_mss();
        let syn = self.manager.connect(
            four_tuple,
            our_mss,
            Box::new(move |result| cb(result.map(|()| fd))),
        );
        self.transmit_segment(four_tuple, syn);
        fd
    }

    pub fn close(&mut self, fd: i32) -> Result<()> {
        let prev = self.sockets.close(fd)?;
        if let FdState::Connected { four_tuple } = prev {
            if let Some(fin) = self.manager.close(&four_tuple) {
                self.transmit_segment(four_tuple, fin);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::header::{self as th, TcpFlags};
    use std::collections::VecDeque;

    struct LoopbackIo {
        inbound: VecDeque<Vec<u8>>,
        outbound: Vec<Vec<u8>>,
    }

    impl RawIo for LoopbackIo {
        fn send(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.outbound.push(data.to_vec());
            Ok(data.len())
        }

        fn recv(&mut self, data: &mut [u8]) -> std::io::Result<usize> {
            match self.inbound.pop_front() {
                Some(frame) => {
                    let n = frame.len().min(data.len());
                    data[..n].copy_from_slice(&frame[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        }
    }

    fn test_namespace() -> Namespace<LoopbackIo> {
        let io = LoopbackIo { inbound: VecDeque::new(), outbound: Vec::new() };
        Namespace::new(Config::default(), io)
    }

    #[test]
    fn arp_request_for_local_address_is_answered() {
        let mut ns = test_namespace();
        let sender_mac = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
        let sender_ip = Ipv4Addr::new(192, 168, 1, 1);
        let req = ArpPacket::request(sender_mac, sender_ip, ns.config.local_ipv4);
        let mut frame = Vec::new();
        let eth = link::EthernetHeader {
            dst_mac: MacAddr::BROADCAST,
            src_mac: sender_mac,
            ethertype: EtherType::Arp,
        };
        frame.extend_from_slice(&eth.to_bytes());
        frame.extend_from_slice(&req.to_bytes());

        ns.on_frame(&frame);

        assert!(ns.device.borrow().has_pending_writes());
        assert_eq!(ns.arp.cache().get(&sender_ip), Some(sender_mac));
    }

    #[test]
    fn socket_listen_unknown_fd_on_unbound_socket_errors() {
        let mut ns = test_namespace();
        assert!(matches!(ns.listen(42), Err(Error::UnknownFd(42))));
    }

    #[test]
    fn listen_then_accept_with_nothing_pending_returns_none() {
        let mut ns = test_namespace();
        let fd = ns.socket(Endpoint::new(ns.config.local_ipv4, 9000));
        ns.listen(fd).unwrap();
        assert_eq!(ns.accept(fd).unwrap(), None);
    }

    fn eth_frame(dst_mac: MacAddr, src_mac: MacAddr, ethertype: EtherType, payload: &[u8]) -> Vec<u8> {
        let header = link::EthernetHeader { dst_mac, src_mac, ethertype };
        let mut frame = header.to_bytes().to_vec();
        frame.extend_from_slice(payload);
        frame
    }

    fn ipv4_payload(src: Ipv4Addr, dst: Ipv4Addr, protocol: Protocol, payload: &[u8]) -> Vec<u8> {
        let header = Ipv4Header { src, dst, protocol, ttl: 64, id: 1 };
        let mut out = ipv4::build(&header, payload.len()).to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn tcp_segment(
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        window: u16,
        options: &[crate::tcp::header::TcpOption],
        payload: &[u8],
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
    ) -> Vec<u8> {
        let header = crate::tcp::header::TcpHeader {
            src_port,
            dst_port,
            seq,
            ack,
            flags,
            window,
            urgent_pointer: 0,
        };
        let encoded_options = th::encode_options(options);
        let header_len = th::FIXED_HEADER_LEN + encoded_options.len();
        let mut raw = vec![0u8; header_len + payload.len()];
        th::write(&header, &encoded_options, &mut raw[..header_len]);
        raw[header_len..].copy_from_slice(payload);
        let csum = tcp_checksum(src_ip, dst_ip, &raw);
        th::set_checksum(&mut raw, csum);
        raw
    }

    /// Feeds an ARP request from `peer` so the namespace learns its MAC
    /// letting subsequent ICMP/TCP replies in
    /// these scenario tests transmit immediately instead of parking behind
    /// an ARP resolution.
    fn seed_arp(ns: &mut Namespace<LoopbackIo>, peer_mac: MacAddr, peer_ip: Ipv4Addr) {
        let req = ArpPacket::request(peer_mac, peer_ip, ns.config.local_ipv4);
        let frame = eth_frame(MacAddr::BROADCAST, peer_mac, EtherType::Arp, &req.to_bytes());
        ns.on_frame(&frame);
    }

    fn drain_outbound(ns: &Namespace<LoopbackIo>) -> Vec<Vec<u8>> {
        while ns.device.borrow().has_pending_writes() {
            ns.device.borrow_mut().drain_one();
        }
        ns.device.borrow().io().outbound.clone()
    }

    /// Scenario: ICMP echo.
    #[test]
    fn icmp_echo_request_gets_a_matching_reply() {
        let mut ns = test_namespace();
        let peer_mac = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02]);
        let peer_ip = Ipv4Addr::new(192, 168, 1, 1);
        seed_arp(&mut ns, peer_mac, peer_ip);
        drain_outbound(&ns);

        let mut icmp_payload = vec![0u8; IcmpHeader::SIZE];
        icmp_payload[0] = 8; // echo request
        icmp_payload[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
        icmp_payload[6..8].copy_from_slice(&0x0001u16.to_be_bytes());
        let csum = crate::checksum::icmp_checksum(&icmp_payload);
        icmp_payload[2..4].copy_from_slice(&csum.to_be_bytes());
        icmp_payload.extend_from_slice(&[0u8; 32]);

        let ip = ipv4_payload(peer_ip, ns.config.local_ipv4, Protocol::ICMP, &icmp_payload);
        let frame = eth_frame(ns.config.local_mac, peer_mac, EtherType::IPv4, &ip);
        ns.on_frame(&frame);

        let sent = drain_outbound(&ns);
        assert_eq!(sent.len(), 1);
        let eth = link::EthernetHeader::parse(&sent[0]).unwrap();
        assert_eq!(eth.dst_mac, peer_mac);
        let ip_reply = ipv4::parse(&sent[0][link::EthernetHeader::SIZE..]).unwrap();
        assert_eq!(ip_reply.header.src, ns.config.local_ipv4);
        assert_eq!(ip_reply.header.dst, peer_ip);
        let reply = IcmpHeader::parse(ip_reply.payload).unwrap();
        assert_eq!(reply.ty, 0); // echo reply
        assert_eq!(reply.id, 0x1234);
        assert_eq!(reply.seq, 0x0001);
        assert_eq!(&ip_reply.payload[IcmpHeader::SIZE..], &[0u8; 32][..]);
    }

    /// Scenarios chained on one connection: passive open + transfer,
    /// an out-of-window segment triggering a bare ACK with no delivery, then
    /// a passive close.
    #[test]
    fn tcp_passive_open_transfer_then_stale_segment_then_close() {
        let mut ns = test_namespace();
        let peer_mac = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x03]);
        let peer_ip = Ipv4Addr::new(192, 168, 1, 1);
        seed_arp(&mut ns, peer_mac, peer_ip);
        drain_outbound(&ns);

        let local_ip = ns.config.local_ipv4;
        let fd = ns.socket(Endpoint::new(local_ip, 9000));
        ns.listen(fd).unwrap();

        // peer SYN, MSS=1460
        let peer_isn: u32 = 1000;
        let syn = tcp_segment(
            5000, 9000, peer_isn, 0,
            TcpFlags { syn: true, ..Default::default() },
            4000,
            &[crate::tcp::header::TcpOption::MaxSegmentSize(1460)],
            &[],
            peer_ip, local_ip,
        );
        let frame = eth_frame(ns.config.local_mac, peer_mac, EtherType::IPv4, &ipv4_payload(peer_ip, local_ip, Protocol::TCP, &syn));
        ns.on_frame(&frame);

        let sent = drain_outbound(&ns);
        assert_eq!(sent.len(), 1);
        let synack_ip = ipv4::parse(&sent[0][link::EthernetHeader::SIZE..]).unwrap();
        let synack = th::parse(synack_ip.payload).unwrap();
        assert!(synack.header.flags.syn && synack.header.flags.ack);
        assert_eq!(synack.header.ack, peer_isn.wrapping_add(1));
        let our_isn = synack.header.seq;

        // peer ACKs the handshake.
        let ack = tcp_segment(
            5000, 9000, peer_isn.wrapping_add(1), our_isn.wrapping_add(1),
            TcpFlags { ack: true, ..Default::default() },
            4000, &[], &[], peer_ip, local_ip,
        );
        ns.on_frame(&eth_frame(ns.config.local_mac, peer_mac, EtherType::IPv4, &ipv4_payload(peer_ip, local_ip, Protocol::TCP, &ack)));
        assert_eq!(drain_outbound(&ns).len(), 0); // pure ack completing handshake, nothing to send back

        let connected_fd = ns.accept(fd).unwrap().expect("handshake completed");

        // peer sends 1024 bytes with PSH.
        let data = vec![7u8; 1024];
        let push = tcp_segment(
            5000, 9000, peer_isn.wrapping_add(1), our_isn.wrapping_add(1),
            TcpFlags { ack: true, psh: true, ..Default::default() },
            4000, &[], &data, peer_ip, local_ip,
        );
        ns.on_frame(&eth_frame(ns.config.local_mac, peer_mac, EtherType::IPv4, &ipv4_payload(peer_ip, local_ip, Protocol::TCP, &push)));
        let sent = drain_outbound(&ns);
        assert_eq!(sent.len(), 1); // cumulative ack
        let data_ack_ip = ipv4::parse(&sent[0][link::EthernetHeader::SIZE..]).unwrap();
        let data_ack = th::parse(data_ack_ip.payload).unwrap();
        assert_eq!(data_ack.header.ack, peer_isn.wrapping_add(1).wrapping_add(1024));

        let mut buf = [0u8; 2048];
        let n = ns.read(connected_fd, &mut buf).unwrap();
        assert_eq!(n, 1024);
        assert_eq!(&buf[..n], &data[..]);

        // a stale segment (seq = rcv.next - 100) delivers nothing and gets a bare ack.
        let rcv_next = peer_isn.wrapping_add(1).wrapping_add(1024);
        let stale = tcp_segment(
            5000, 9000, rcv_next.wrapping_sub(100), our_isn.wrapping_add(1),
            TcpFlags { ack: true, ..Default::default() },
            4000, &[], &[1, 2, 3], peer_ip, local_ip,
        );
        ns.on_frame(&eth_frame(ns.config.local_mac, peer_mac, EtherType::IPv4, &ipv4_payload(peer_ip, local_ip, Protocol::TCP, &stale)));
        let sent = drain_outbound(&ns);
        assert_eq!(sent.len(), 1);
        let stale_ack_ip = ipv4::parse(&sent[0][link::EthernetHeader::SIZE..]).unwrap();
        let stale_ack = th::parse(stale_ack_ip.payload).unwrap();
        assert!(stale_ack.payload.is_empty());
        assert_eq!(stale_ack.header.ack, rcv_next);
        let mut buf2 = [0u8; 16];
        assert_eq!(ns.read(connected_fd, &mut buf2).unwrap(), 0);

        // peer closes.
        let fin = tcp_segment(
            5000, 9000, rcv_next, our_isn.wrapping_add(1),
            TcpFlags { ack: true, fin: true, ..Default::default() },
            4000, &[], &[], peer_ip, local_ip,
        );
        ns.on_frame(&eth_frame(ns.config.local_mac, peer_mac, EtherType::IPv4, &ipv4_payload(peer_ip, local_ip, Protocol::TCP, &fin)));
        let sent = drain_outbound(&ns);
        assert_eq!(sent.len(), 1);
        let fin_ack_ip = ipv4::parse(&sent[0][link::EthernetHeader::SIZE..]).unwrap();
        let fin_ack = th::parse(fin_ack_ip.payload).unwrap();
        assert_eq!(fin_ack.header.ack, rcv_next.wrapping_add(1));
    }
}
