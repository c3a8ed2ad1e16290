use std::net::{IpAddr, Ipv6Addr};

use anyhow::bail;
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;

/// Returns a private (RFC 1918) IPv4 address of this host. Used to pick an advertise address
///  when the transport is bound to `0.0.0.0` and the user supplied no explicit hint.
pub fn preferred_private_ipv4() -> anyhow::Result<IpAddr> {
    for ifaddr in getifaddrs()? {
        if !is_usable_interface(ifaddr.flags) {
            continue;
        }
        if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            let ip = sin.ip();
            if ip.is_private() {
                return Ok(IpAddr::V4(ip));
            }
        }
    }
    bail!("no private IP address found, and explicit IP not provided");
}

/// Returns the first usable IPv6 address of this host, for the `::` bind case. Loopback and
///  link-local addresses do not identify the node to peers and are skipped.
pub fn preferred_ipv6() -> anyhow::Result<IpAddr> {
    for ifaddr in getifaddrs()? {
        if !is_usable_interface(ifaddr.flags) {
            continue;
        }
        if let Some(sin6) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in6()) {
            let ip = sin6.ip();
            if !ip.is_loopback() && !is_unicast_link_local(&ip) {
                return Ok(IpAddr::V6(ip));
            }
        }
    }
    bail!("no usable IPv6 address found, and explicit IP not provided");
}

fn is_usable_interface(flags: InterfaceFlags) -> bool {
    flags.contains(InterfaceFlags::IFF_UP) && !flags.contains(InterfaceFlags::IFF_LOOPBACK)
}

// fe80::/10
fn is_unicast_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}
