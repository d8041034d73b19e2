use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::Error;

/// Network utilities
pub struct NetUtils;

impl NetUtils {
    /// Enumerate non-loopback addresses of the host's interfaces.
    ///
    /// With `add_localhost` the IPv4 and IPv6 loopback addresses are placed first.
    pub fn local_ip_addresses(add_localhost: bool) -> Result<Vec<IpAddr>, Error> {
        let interfaces = if_addrs::get_if_addrs()
            .map_err(|e| Error::Internal(format!("Failed to enumerate interfaces: {}", e)))?;

        let mut addresses = Vec::new();
        if add_localhost {
            addresses.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
            addresses.push(IpAddr::V6(Ipv6Addr::LOCALHOST));
        }

        for iface in interfaces {
            if iface.is_loopback() {
                continue;
            }
            let ip = iface.ip();
            if !addresses.contains(&ip) {
                addresses.push(ip);
            }
        }

        Ok(addresses)
    }

    /// Check if an IP address is publicly routable
    pub fn is_public_ip(ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => {
                !v4.is_loopback()
                    && !v4.is_private()
                    && !v4.is_link_local()
                    && !v4.is_unspecified()
                    && !v4.is_broadcast()
            }
            IpAddr::V6(v6) => {
                let first = v6.segments()[0];
                !v6.is_loopback()
                    && !v6.is_unspecified()
                    // fe80::/10 link-local, fc00::/7 unique local
                    && (first & 0xffc0) != 0xfe80
                    && (first & 0xfe00) != 0xfc00
            }
        }
    }

    /// DNS record type for an address
    pub fn record_type(ip: &IpAddr) -> &'static str {
        match ip {
            IpAddr::V4(_) => "A",
            IpAddr::V6(_) => "AAAA",
        }
    }
}
