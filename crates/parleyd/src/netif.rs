//! Local address probing.
//!
//! A node recognises itself by listen port plus one of these addresses.
//! The routed interface address is found by "connecting" a UDP socket to a
//! documentation-range address. No packet is sent; the kernel only picks a
//! source address for the route.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, UdpSocket};

const PROBE_V4: &str = "192.0.2.1:9";
const PROBE_V6: &str = "[2001:db8::1]:9";

/// Loopback, plus this host's routed IPv4/IPv6 source addresses when present.
pub fn local_addresses() -> Vec<IpAddr> {
    let mut out = vec![IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)];

    for (bind, dest) in [("0.0.0.0:0", PROBE_V4), ("[::]:0", PROBE_V6)] {
        match probe(bind, dest) {
            Some(ip) if !out.contains(&ip) => out.push(ip),
            Some(_) => {}
            None => tracing::trace!(dest, "no route for local address probe"),
        }
    }

    tracing::debug!(addrs = ?out, "local addresses");
    out
}

fn probe(bind: &str, dest: &str) -> Option<IpAddr> {
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(dest).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
