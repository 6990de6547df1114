//! Address helpers shared by request validation and destination building

use std::net::IpAddr;

/// Address part of a CIDR (`10.0.0.1/24` -> `10.0.0.1`)
pub fn cidr_address(cidr: &str) -> &str {
    cidr.split('/').next().unwrap_or(cidr)
}

/// Whether `value` is an IP address with a prefix length valid for its family
pub fn is_valid_cidr(value: &str) -> bool {
    let Some((addr, prefix)) = value.split_once('/') else {
        return false;
    };
    let Ok(addr) = addr.parse::<IpAddr>() else {
        return false;
    };
    let Ok(prefix) = prefix.parse::<u8>() else {
        return false;
    };
    match addr {
        IpAddr::V4(_) => prefix <= 32,
        IpAddr::V6(_) => prefix <= 128,
    }
}

/// Split `host:port` (or `[v6]:port`) into host and port
pub fn split_endpoint(endpoint: &str) -> Option<(&str, u16)> {
    let (host, port) = endpoint.rsplit_once(':')?;
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port.parse().ok()?))
}

/// Host-only CIDR (`/32` or `/128`) for a subnet's address
pub fn host_cidr(subnet: &str) -> String {
    let addr = cidr_address(subnet);
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("{}/128", addr),
        _ => format!("{}/32", addr),
    }
}

/// Subnet a resource destination routes to
///
/// A CIDR is used as-is and a bare address becomes a host route. Hostnames
/// and anything else unparseable yield `None`.
pub fn destination_subnet(destination: &str) -> Option<String> {
    let destination = destination.trim();
    if is_valid_cidr(destination) {
        return Some(destination.to_string());
    }
    destination.parse::<IpAddr>().ok().map(|_| host_cidr(destination))
}
