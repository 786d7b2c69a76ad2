extern crate userspace_tcp_stack;

use std::thread;
use std::time::Duration;

use tun_tap::{Iface, Mode};

use userspace_tcp_stack::config::Config;
use userspace_tcp_stack::meta::{EGRESS_HEARTBEAT_MS, ETHERNET_MTU};
use userspace_tcp_stack::namespace::Namespace;
use userspace_tcp_stack::result::Result;

/// Drives one `Namespace` off a real TAP device. An embedder drives the
/// executor; this crate never spawns its own thread. The frames this
/// stack builds and parses carry a full Ethernet header, so the device
/// must be opened in TAP rather than TUN mode.
fn main() -> Result<()> {
    userspace_tcp_stack::init_log();

    let config = Config::from_args(std::env::args());
    let default_gateway = config.default_gateway;
    let device_name = config.device_name.clone();
    let local_ipv4 = config.local_ipv4;
    let local_mac = config.local_mac;
    let mtu = config.mtu;

    let iface = Iface::new(&device_name, Mode::Tap)?;
    log::info!("{} up: {} ({}), mtu {}", device_name, local_ipv4, local_mac, mtu);

    let mut ns = Namespace::new(config, iface);
    if let Some(gateway) = default_gateway {
        ns.routing_mut().set_default(gateway);
    }

    let mut read_buf = vec![0u8; ETHERNET_MTU];
    let heartbeat = Duration::from_millis(EGRESS_HEARTBEAT_MS);
    loop {
        ns.poll_device(&mut read_buf);
        // A small, bounded sleep stands in for the executor's timer
        // registration this crate doesn't own.
        thread::sleep(heartbeat / 10);
    }
}
