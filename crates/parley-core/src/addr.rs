//! Peer addresses: `(resolved host, port)` identity values.
//!
//! The host is normalized to a canonical IP string when the value is built,
//! so equality and hashing compare resolved hosts. Names that do not resolve
//! are kept verbatim (lowercased).

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrError {
    #[error("empty peer address")]
    Empty,
    #[error("invalid peer address '{0}'")]
    Malformed(String),
    #[error("invalid port in peer address '{0}'")]
    InvalidPort(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress {
    host: String,
    port: u16,
}

impl PeerAddress {
    /// Build an address, resolving `host` to its canonical form.
    ///
    /// May block on DNS for names that are not IP literals.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: normalize_host(host),
            port,
        }
    }

    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        Self {
            host: canonical_ip(ip).to_string(),
            port,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::from_ip(addr.ip(), addr.port())
    }

    /// Keep `host` as given (trimmed, unbracketed, lowercased) without DNS.
    /// IP literals are still canonicalized.
    pub fn unresolved(host: &str, port: u16) -> Self {
        let bare = host.trim().trim_start_matches('[').trim_end_matches(']');
        let host = match bare.parse::<IpAddr>() {
            Ok(ip) => canonical_ip(ip).to_string(),
            Err(_) => bare.to_ascii_lowercase(),
        };
        Self { host, port }
    }

    /// Parse `host:port`. IPv6 hosts may be bracketed (`[::1]:5000`).
    pub fn parse(s: &str) -> Result<Self, AddrError> {
        let (host, port) = split_host_port(s)?;
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The host as an IP, if it resolved to one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    pub fn is_loopback(&self) -> bool {
        self.ip().map(|ip| ip.is_loopback()).unwrap_or(false)
    }

    /// Same port, different host.
    pub fn with_host(&self, host: &str) -> Self {
        Self::new(host, self.port)
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Split `host:port` without resolving. Brackets around IPv6 hosts are
/// stripped.
pub fn split_host_port(s: &str) -> Result<(&str, u16), AddrError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(AddrError::Empty);
    }
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| AddrError::Malformed(s.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(AddrError::Malformed(s.to_string()));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| AddrError::InvalidPort(s.to_string()))?;
    Ok((host, port))
}

// ── Normalization ─────────────────────────────────────────────────────────────

/// Resolve a host to its canonical IP string. Idempotent.
///
/// IP literals are canonicalized without touching DNS; IPv4-mapped IPv6
/// addresses collapse to plain IPv4. Names prefer an IPv4 result.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');

    if let Ok(ip) = host.parse::<IpAddr>() {
        return canonical_ip(ip).to_string();
    }

    match (host, 0u16).to_socket_addrs() {
        Ok(addrs) => {
            let addrs: Vec<SocketAddr> = addrs.collect();
            addrs
                .iter()
                .find(|a| a.is_ipv4())
                .or_else(|| addrs.first())
                .map(|a| canonical_ip(a.ip()).to_string())
                .unwrap_or_else(|| host.to_ascii_lowercase())
        }
        Err(_) => host.to_ascii_lowercase(),
    }
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// True for hosts a remote uses to mean "myself": `localhost`, loopback
/// IPs, and the unspecified address.
pub fn is_self_placeholder(host: &str) -> bool {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>()
        .map(|ip| {
            let ip = canonical_ip(ip);
            ip.is_loopback() || ip.is_unspecified()
        })
        .unwrap_or(false)
}
