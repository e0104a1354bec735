use std::net::IpAddr;
use anyhow::{Context, Result};

/// Best-effort discovery of this host's non-loopback IPv4 address, used as
/// the "claimed network address" a client reports at handshake. Clients
/// behind NAT still claim their LAN-local address; NAT traversal is out
/// of scope.
pub fn detect_local_ip() -> Result<IpAddr> {
    let ifaces = get_if_addrs::get_if_addrs().context("enumerating network interfaces")?;
    ifaces
        .into_iter()
        .map(|i| i.ip())
        .find(|ip| ip.is_ipv4() && !ip.is_loopback())
        .context("no non-loopback IPv4 interface found")
}
