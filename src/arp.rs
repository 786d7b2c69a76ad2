//! ARP resolution with pending-request coalescing, hand-rolled since
//! etherparse has no ARP support.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::addr::MacAddr;
use crate::meta::ARP_PACKET_SIZE;
use crate::result::{Error, Result};

const HTYPE_ETHERNET: u16 = 1;
const PTYPE_IPV4: u16 = 0x0800;
const HLEN: u8 = 6;
const PLEN: u8 = 4;
const OPER_REQUEST: u16 = 1;
const OPER_REPLY: u16 = 2;

/// Fixed 28-byte ARP packet for Ethernet/IPv4: htype, ptype, hlen, plen,
/// oper, sender/target hw+proto addr.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ArpPacket {
    pub is_reply: bool,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub const SIZE: usize = ARP_PACKET_SIZE;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::Malformed("arp packet"));
        }
        let htype = u16::from_be_bytes([buf[0], buf[1]]);
        let ptype = u16::from_be_bytes([buf[2], buf[3]]);
        let hlen = buf[4];
        let plen = buf[5];
        if htype != HTYPE_ETHERNET || ptype != PTYPE_IPV4 || hlen != HLEN || plen != PLEN {
            return Err(Error::Malformed("arp packet: unsupported hw/proto type"));
        }
        let oper = u16::from_be_bytes([buf[6], buf[7]]);
        let sender_mac = MacAddr::from_slice(&buf[8..14]);
        let sender_ip = Ipv4Addr::new(buf[14], buf[15], buf[16], buf[17]);
        let target_mac = MacAddr::from_slice(&buf[18..24]);
        let target_ip = Ipv4Addr::new(buf[24], buf[25], buf[26], buf[27]);
        let is_reply = match oper {
            OPER_REQUEST => false,
            OPER_REPLY => true,
            _ => return Err(Error::Malformed("arp packet: unsupported oper")),
        };
        Ok(Self {
            is_reply,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&HTYPE_ETHERNET.to_be_bytes());
        out[2..4].copy_from_slice(&PTYPE_IPV4.to_be_bytes());
        out[4] = HLEN;
        out[5] = PLEN;
        let oper = if self.is_reply { OPER_REPLY } else { OPER_REQUEST };
        out[6..8].copy_from_slice(&oper.to_be_bytes());
        out[8..14].copy_from_slice(&self.sender_mac.octets());
        out[14..18].copy_from_slice(&self.sender_ip.octets());
        out[18..24].copy_from_slice(&self.target_mac.octets());
        out[24..28].copy_from_slice(&self.target_ip.octets());
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        self.write(&mut out);
        out
    }

    pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            is_reply: false,
            sender_mac,
            sender_ip,
            target_mac: MacAddr::UNSPECIFIED,
            target_ip,
        }
    }

    pub fn reply_to(&self, sender_mac: MacAddr, sender_ip: Ipv4Addr) -> Self {
        Self {
            is_reply: true,
            sender_mac,
            sender_ip,
            target_mac: self.sender_mac,
            target_ip: self.sender_ip,
        }
    }
}

/// IPv4 -> MAC, no TTL: entries are added on learn and may be replaced.
#[derive(Default)]
pub struct ArpCache {
    table: HashMap<Ipv4Addr, MacAddr>,
}

impl ArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ip: &Ipv4Addr) -> Option<MacAddr> {
        self.table.get(ip).copied()
    }

    /// Never caches the broadcast or zero MAC.
    pub fn learn(&mut self, ip: Ipv4Addr, mac: MacAddr) {
        if mac.is_broadcast() || mac.is_unspecified() {
            return;
        }
        self.table.insert(ip, mac);
    }

    pub fn contains(&self, ip: &Ipv4Addr) -> bool {
        self.table.contains_key(ip)
    }
}

type ResolveCallback = Box<dyn FnOnce(MacAddr)>;

/// One broadcast request services every concurrent resolver waiting on the
/// same target IPv4; callbacks fire in registration order on the first
/// reply.
#[derive(Default)]
pub struct Arp {
    cache: ArpCache,
    pending: HashMap<Ipv4Addr, Vec<ResolveCallback>>,
}

/// What the caller of `resolve` must do in response: either the callback
/// fires immediately (cache hit), or a broadcast request must be sent on the
/// device (cache miss, first waiter for this target).
pub enum Resolution {
    Hit(MacAddr),
    /// `should_broadcast` is true only for the first waiter registered for
    /// this target; later concurrent resolvers coalesce onto that request
    /// and must not send a second one.
    Miss {
        broadcast: ArpPacket,
        should_broadcast: bool,
    },
}

impl Arp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(&self) -> &ArpCache {
        &self.cache
    }

    /// Registers `cb` against `target_ip`. Returns `Resolution::Hit` if the
    /// cache already has an answer (the caller posts `cb` on the executor
    /// immediately); returns `Resolution::Miss` with the broadcast request to
    /// send the *first* time a given target has no pending waiters.
    pub fn resolve(
        &mut self,
        from_mac: MacAddr,
        from_ip: Ipv4Addr,
        target_ip: Ipv4Addr,
        cb: ResolveCallback,
    ) -> Resolution {
        if let Some(mac) = self.cache.get(&target_ip) {
            return Resolution::Hit(mac);
        }
        let waiters = self.pending.entry(target_ip).or_default();
        let should_broadcast = waiters.is_empty();
        waiters.push(cb);
        Resolution::Miss {
            broadcast: ArpPacket::request(from_mac, from_ip, target_ip),
            should_broadcast,
        }
    }

    /// Processes an ingress ARP packet. For a request directed at `local_ip`
    /// with a cache hit, returns the reply to transmit. Always returns the
    /// callbacks to fire (possibly empty) for a reply that resolves pending
    /// waiters, in registration order.
    pub fn handle_ingress(
        &mut self,
        pkt: &ArpPacket,
        local_mac: MacAddr,
        local_ip: Ipv4Addr,
    ) -> (Option<ArpPacket>, Vec<(ResolveCallback, MacAddr)>) {
        self.cache.learn(pkt.sender_ip, pkt.sender_mac);

        if !pkt.is_reply {
            let reply = if pkt.target_ip == local_ip {
                Some(pkt.reply_to(local_mac, local_ip))
            } else {
                None
            };
            return (reply, Vec::new());
        }

        let fired = match self.pending.remove(&pkt.sender_ip) {
            Some(waiters) => waiters
                .into_iter()
                .map(|cb| (cb, pkt.sender_mac))
                .collect(),
            None => Vec::new(),
        };
        (None, fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u8) -> MacAddr {
        MacAddr::new([0, 0, 0, 0, 0, n])
    }

    #[test]
    fn cache_never_learns_broadcast_or_zero() {
        let mut cache = ArpCache::new();
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        cache.learn(ip, MacAddr::BROADCAST);
        assert!(!cache.contains(&ip));
        cache.learn(ip, MacAddr::UNSPECIFIED);
        assert!(!cache.contains(&ip));
        cache.learn(ip, mac(7));
        assert_eq!(cache.get(&ip), Some(mac(7)));
    }

    #[test]
    fn arp_packet_round_trips() {
        let pkt = ArpPacket::request(mac(2), Ipv4Addr::new(192, 168, 1, 2), Ipv4Addr::new(192, 168, 1, 1));
        let bytes = pkt.to_bytes();
        let parsed = ArpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed, pkt);
    }

    #[test]
    fn request_answered_only_when_target_matches_local() {
        let mut arp = Arp::new();
        let local_ip = Ipv4Addr::new(192, 168, 1, 2);
        let local_mac = mac(2);
        let req = ArpPacket::request(mac(1), Ipv4Addr::new(192, 168, 1, 1), local_ip);
        let (reply, fired) = arp.handle_ingress(&req, local_mac, local_ip);
        assert!(fired.is_empty());
        let reply = reply.expect("should answer request for our own address");
        assert_eq!(reply.sender_mac, local_mac);
        assert_eq!(reply.target_mac, mac(1));
        assert_eq!(arp.cache().get(&Ipv4Addr::new(192, 168, 1, 1)), Some(mac(1)));
    }

    #[test]
    fn concurrent_resolves_for_same_target_fire_in_registration_order() {
        let mut arp = Arp::new();
        let from_ip = Ipv4Addr::new(192, 168, 1, 2);
        let from_mac = mac(2);
        let target = Ipv4Addr::new(192, 168, 1, 1);

        let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();

        match arp.resolve(from_mac, from_ip, target, Box::new(move |_mac| o1.borrow_mut().push(1))) {
            Resolution::Miss { should_broadcast, .. } => assert!(should_broadcast),
            Resolution::Hit(_) => panic!("expected miss on first resolve"),
        }
        match arp.resolve(from_mac, from_ip, target, Box::new(move |_mac| o2.borrow_mut().push(2))) {
            Resolution::Miss { should_broadcast, .. } => assert!(!should_broadcast),
            Resolution::Hit(_) => panic!("expected miss on coalesced resolve"),
        }

        let reply = ArpPacket {
            is_reply: true,
            sender_mac: mac(1),
            sender_ip: target,
            target_mac: from_mac,
            target_ip: from_ip,
        };
        let (no_reply, fired) = arp.handle_ingress(&reply, from_mac, from_ip);
        assert!(no_reply.is_none());
        assert_eq!(fired.len(), 2);
        for (cb, mac_addr) in fired {
            cb(mac_addr);
        }
        assert_eq!(*order.borrow(), vec![1, 2]);
    }
}
