//! Destination IPv4 -> next-hop route. Read-only from the core; populated
//! by the embedder.

use std::collections::HashMap;
use std::net::Ipv4Addr;

/// `{next-hop IPv4, outgoing device}`. This crate drives a single device per
/// namespace, so the "outgoing device" is implicit; the route only needs to
/// resolve the next-hop address that ARP should target.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Route {
    pub next_hop: Ipv4Addr,
}

#[derive(Default)]
pub struct RoutingTable {
    routes: HashMap<Ipv4Addr, Route>,
    default_route: Option<Route>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, dst: Ipv4Addr, next_hop: Ipv4Addr) {
        self.routes.insert(dst, Route { next_hop });
    }

    pub fn set_default(&mut self, next_hop: Ipv4Addr) {
        self.default_route = Some(Route { next_hop });
    }

    pub fn reset(&mut self) {
        self.routes.clear();
        self.default_route = None;
    }

    /// Exact match first, falling back to the default route.
    pub fn query(&self, dst: Ipv4Addr) -> Option<Route> {
        self.routes
            .get(&dst)
            .copied()
            .or(self.default_route)
    }
}
