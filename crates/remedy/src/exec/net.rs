//! Local interface addresses, used to pick the in-process transport.

use std::net::IpAddr;

use nix::ifaddrs::getifaddrs;

/// Every IPv4 and IPv6 address configured on this machine's interfaces.
pub fn local_addresses() -> std::io::Result<Vec<IpAddr>> {
    let mut addresses = Vec::new();
    for ifaddr in getifaddrs()? {
        let Some(address) = ifaddr.address else {
            continue;
        };
        let ip = if let Some(v4) = address.as_sockaddr_in() {
            IpAddr::V4(v4.ip())
        } else if let Some(v6) = address.as_sockaddr_in6() {
            IpAddr::V6(v6.ip())
        } else {
            continue;
        };
        if !addresses.contains(&ip) {
            addresses.push(ip);
        }
    }
    Ok(addresses)
}

pub fn is_local(host: IpAddr, local_addresses: &[IpAddr]) -> bool {
    local_addresses.contains(&host)
}
