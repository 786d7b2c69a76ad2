pub const ETHERNET_MTU: usize = 1500;
pub const FDDI_MTU: usize = 4352;
pub const PPP_MTU: usize = 296;
pub const TUN_SIZE: usize = 4;
pub const TCP_HEADER_MAXIMUM_SIZE: usize = 20;
pub const IP_HEADER_MAXIMUM_SIZE: usize = 20;
pub const TCP_IP_PAYLOAD_MAXIMUM_SIZE: usize =
    ETHERNET_MTU - TCP_HEADER_MAXIMUM_SIZE - IP_HEADER_MAXIMUM_SIZE;

pub const ETHERNET_HEADER_SIZE: usize = 14;
pub const ARP_PACKET_SIZE: usize = 28;
pub const ICMP_HEADER_SIZE: usize = 8;

/// Conservative MSS advertised on an ETHERNET_MTU-sized link: MTU minus the
/// fixed IPv4 and TCP header sizes, rounded down a little further to leave
/// headroom (`1446` on a 1500-MTU link).
pub const DEFAULT_MSS: u16 = 1446;

/// Default per-TCB send/receive ring capacity floor before the peer's own
/// advertised window raises it.
pub const DEFAULT_WINDOW_SIZE: u16 = 1024;

pub const DEFAULT_TIME_TO_LIVE: u8 = 64;

/// Egress heartbeat period: re-checks pending per-TCB send data when no
/// device write is already in flight.
pub const EGRESS_HEARTBEAT_MS: u64 = 100;
