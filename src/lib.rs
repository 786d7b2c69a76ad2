#[macro_use]
extern crate log;
extern crate pretty_env_logger;

pub mod addr;
pub mod arp;
pub mod buf;
pub mod checksum;
pub mod config;
pub mod icmp;
pub mod ipv4;
pub mod link;
pub mod meta;
pub mod namespace;
pub mod net_types;
pub mod result;
pub mod routing;
pub mod socket;
pub mod tcp;

pub fn init_log() {
    pretty_env_logger::init();
}
