//! Services the device consumes
//!
//! The engine never owns a socket, a routing table or a thread pool. It is
//! handed one implementation of each trait at construction; see
//! [`crate::driver`] for the tokio ones and [`crate::routing`] for the
//! in-memory routing table.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use ipnet::IpNet;

use crate::device::peer::Peer;
use crate::error::NetworkError;

/// Outbound datagram service
pub trait Transport: Send + Sync {
    fn send_datagram(&self, endpoint: SocketAddr, data: &[u8]) -> Result<(), NetworkError>;
}

/// Cryptokey routing
///
/// Peers are named by their static public key.
pub trait Router: Send + Sync {
    /// Peer whose allowed prefixes best match `destination`
    fn lookup_peer(&self, destination: IpAddr) -> Option<[u8; 32]>;

    /// Whether `source` routes back to `peer`
    fn peer_owns(&self, peer: &[u8; 32], source: IpAddr) -> bool;

    /// Replace the prefixes routed to `peer`
    fn set_allowed_ips(&self, peer: &[u8; 32], nets: &[IpNet]);

    fn remove_peer(&self, peer: &[u8; 32]);
}

/// Background work queue
///
/// Called once each time a peer goes from no pending tasks to some. The
/// implementation must eventually call
/// [`Device::run_peer_tasks`](crate::device::Device::run_peer_tasks) for it.
pub trait TaskScheduler: Send + Sync {
    fn schedule_peer(&self, peer: Arc<Peer>);
}
