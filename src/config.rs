use std::net::Ipv4Addr;

use crate::addr::MacAddr;
use crate::meta::{DEFAULT_TIME_TO_LIVE, DEFAULT_WINDOW_SIZE, ETHERNET_MTU};

/// Per-namespace configuration an embedder fills in once, instead of
/// editing constants: device name, this stack's own address on the
/// capture link, MTU, default route, and the handful of per-connection
/// defaults (window size, TTL).
#[derive(Clone, Debug)]
pub struct Config {
    /// name passed to `TUNSETIFF`, e.g. `"tcp0"`
    pub device_name: String,
    pub mtu: usize,
    /// this stack's own address on the capture link
    pub local_ipv4: Ipv4Addr,
    pub local_mac: MacAddr,
    /// optional default route next-hop, used when the routing table has no
    /// specific match
    pub default_gateway: Option<Ipv4Addr>,
    pub default_window_size: u16,
    pub time_to_live: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: "tcp0".to_string(),
            mtu: ETHERNET_MTU,
            local_ipv4: Ipv4Addr::new(192, 168, 1, 2),
            local_mac: MacAddr::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]),
            default_gateway: None,
            default_window_size: DEFAULT_WINDOW_SIZE,
            time_to_live: DEFAULT_TIME_TO_LIVE,
        }
    }
}

impl Config {
    /// Builds a `Config` from a handful of positional `argv` entries
    /// (device name, local address), leaving everything else at its
    /// default.
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Self {
        let mut cfg = Self::default();
        let mut it = args.into_iter().skip(1);
        if let Some(name) = it.next() {
            cfg.device_name = name;
        }
        if let Some(ip) = it.next().and_then(|s| s.parse().ok()) {
            cfg.local_ipv4 = ip;
        }
        cfg
    }
}
