//! Shared data-model types: the session registry's view of a connected
//! peer and a named group.
use std::net::SocketAddr;

use crossbeam_channel::Sender;

/// One line to be written to a peer's control connection.
pub type OutboundLine = String;

/// A connected, registered client as the server sees it.
///
/// `outbound` is the bounded per-peer queue a dedicated writer thread
/// drains: broadcasting to one slow or wedged peer must never stall
/// fan-out to the rest.
pub struct Peer {
    pub name: String,
    pub control_addr: SocketAddr,
    pub claimed_ip: std::net::IpAddr,
    pub outbound: Sender<OutboundLine>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.name)
            .field("control_addr", &self.control_addr)
            .field("claimed_ip", &self.claimed_ip)
            .finish()
    }
}

/// A named group. Membership is a `Vec`, not a `HashSet`, so that the
/// deterministic call-port allocation in [`crate::call::allocate_ports`]
/// can rely on registry (insertion) order.
#[derive(Debug, Clone, Default)]
pub struct Group {
    pub name: String,
    pub members: Vec<String>,
}

impl Group {
    pub fn new(name: String, members: Vec<String>) -> Self {
        Self { name, members }
    }

    pub fn contains(&self, member: &str) -> bool {
        self.members.iter().any(|m| m == member)
    }
}
