//! In-memory cryptokey routing table
//!
//! Longest-prefix match over each peer's allowed prefixes, one table per
//! address family. Entries are kept sorted by prefix length, longest first,
//! so the first hit wins.

use std::net::IpAddr;

use ipnet::IpNet;
use parking_lot::RwLock;

use crate::device::external::Router;

#[derive(Debug, Default)]
struct Table {
    entries: Vec<(IpNet, [u8; 32])>,
}

impl Table {
    fn insert(&mut self, net: IpNet, peer: [u8; 32]) {
        // a prefix belongs to at most one peer
        self.entries.retain(|(existing, _)| *existing != net);
        let at = self
            .entries
            .partition_point(|(existing, _)| existing.prefix_len() >= net.prefix_len());
        self.entries.insert(at, (net, peer));
    }

    fn lookup(&self, addr: IpAddr) -> Option<[u8; 32]> {
        self.entries
            .iter()
            .find(|(net, _)| net.contains(&addr))
            .map(|(_, peer)| *peer)
    }

    fn remove_peer(&mut self, peer: &[u8; 32]) {
        self.entries.retain(|(_, owner)| owner != peer);
    }
}

/// Allowed-IPs table shared by the device and its tunnel side
#[derive(Debug, Default)]
pub struct AllowedIps {
    v4: RwLock<Table>,
    v6: RwLock<Table>,
}

impl AllowedIps {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, net: &IpNet) -> &RwLock<Table> {
        match net {
            IpNet::V4(_) => &self.v4,
            IpNet::V6(_) => &self.v6,
        }
    }

    pub fn insert(&self, net: IpNet, peer: [u8; 32]) {
        self.table(&net).write().insert(net.trunc(), peer);
    }

    /// All prefixes currently routed to `peer`
    pub fn nets_of(&self, peer: &[u8; 32]) -> Vec<IpNet> {
        let mut nets: Vec<IpNet> = Vec::new();
        for table in [&self.v4, &self.v6] {
            nets.extend(
                table
                    .read()
                    .entries
                    .iter()
                    .filter(|(_, owner)| owner == peer)
                    .map(|(net, _)| *net),
            );
        }
        nets
    }
}

impl Router for AllowedIps {
    fn lookup_peer(&self, destination: IpAddr) -> Option<[u8; 32]> {
        match destination {
            IpAddr::V4(_) => self.v4.read().lookup(destination),
            IpAddr::V6(_) => self.v6.read().lookup(destination),
        }
    }

    fn peer_owns(&self, peer: &[u8; 32], source: IpAddr) -> bool {
        self.lookup_peer(source).as_ref() == Some(peer)
    }

    fn set_allowed_ips(&self, peer: &[u8; 32], nets: &[IpNet]) {
        self.remove_peer(peer);
        for net in nets {
            self.insert(*net, *peer);
        }
    }

    fn remove_peer(&self, peer: &[u8; 32]) {
        self.v4.write().remove_peer(peer);
        self.v6.write().remove_peer(peer);
    }
}
