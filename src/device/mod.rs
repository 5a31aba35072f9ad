//! The WireGuard device
//!
//! A [`Device`] owns the local identity, the peer set (by public key and by
//! name), and the session index. Inbound datagrams enter through
//! [`Device::handle_datagram`], outbound tunnel packets through
//! [`Device::send_packet`]. Follow-up work is queued per peer and executed by
//! [`Device::run_peer_tasks`]; deadlines are polled with [`Device::tick`].
//!
//! Data-path calls may run on any number of threads at once.

pub mod external;
pub mod index;
pub mod peer;
mod receive;
mod send;
mod timers;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ipnet::IpNet;
use parking_lot::RwLock;

use crate::config::{DeviceConfig, PeerConfig, Timing};
use crate::crypto::x25519;
use crate::error::{ConfigError, WgError};
use crate::protocol::handshake::StaticKeys;
use crate::protocol::session::{Session, SessionState};

use self::external::{Router, TaskScheduler, Transport};
use self::index::SessionIndex;
use self::peer::{Peer, PeerState, PeerTask};

/// Point-in-time view of one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub name: Option<String>,
    pub public_key: [u8; 32],
    pub has_preshared_key: bool,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    pub state: PeerState,
    pub last_handshake: Option<SystemTime>,
    pub stable: SessionState,
    pub unstable: SessionState,
}

/// Point-in-time view of the device
///
/// Private and pre-shared keys are never part of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub public_key: [u8; 32],
    pub listen_port: u16,
    pub peers: Vec<PeerStatus>,
}

/// WireGuard engine
pub struct Device {
    local: RwLock<Arc<StaticKeys>>,
    listen_port: AtomicU16,
    peers: DashMap<[u8; 32], Arc<Peer>>,
    peers_by_name: DashMap<String, Arc<Peer>>,
    index: SessionIndex,
    timing: Timing,
    transport: Arc<dyn Transport>,
    router: Arc<dyn Router>,
    scheduler: Arc<dyn TaskScheduler>,
}

fn key_label(key: &[u8; 32]) -> String {
    BASE64.encode(&key[..8])
}

impl Device {
    pub fn new(
        private_key: [u8; 32],
        timing: Timing,
        transport: Arc<dyn Transport>,
        router: Arc<dyn Router>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Self {
        let local = StaticKeys::new(private_key);
        tracing::info!("Device public key: {}", BASE64.encode(local.public));
        Self {
            local: RwLock::new(Arc::new(local)),
            listen_port: AtomicU16::new(0),
            peers: DashMap::new(),
            peers_by_name: DashMap::new(),
            index: SessionIndex::new(),
            timing,
            transport,
            router,
            scheduler,
        }
    }

    /// Build a device and add every configured peer
    pub fn from_config(
        config: &DeviceConfig,
        transport: Arc<dyn Transport>,
        router: Arc<dyn Router>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Result<Self, WgError> {
        let device = Self::new(
            config.private_key,
            config.timing.clone(),
            transport,
            router,
            scheduler,
        );
        device.set_listen_port(config.listen_port);
        for peer in &config.peers {
            device.add_peer(peer.clone())?;
        }
        Ok(device)
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub(crate) fn local_keys(&self) -> Arc<StaticKeys> {
        Arc::clone(&self.local.read())
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.local.read().public
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::Relaxed)
    }

    pub fn set_listen_port(&self, port: u16) {
        self.listen_port.store(port, Ordering::Relaxed);
    }

    pub fn peer(&self, public_key: &[u8; 32]) -> Option<Arc<Peer>> {
        self.peers.get(public_key).map(|p| Arc::clone(p.value()))
    }

    pub fn peer_by_name(&self, name: &str) -> Option<Arc<Peer>> {
        self.peers_by_name.get(name).map(|p| Arc::clone(p.value()))
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn all_peers(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|p| Arc::clone(p.value())).collect()
    }

    /// Add a peer; fails on an unusable key, a duplicate key or name, or our
    /// own public key
    pub fn add_peer(&self, config: PeerConfig) -> Result<Arc<Peer>, ConfigError> {
        config.validate()?;
        let label = key_label(&config.public_key);

        if !x25519::is_valid_public_key(&config.public_key) {
            return Err(ConfigError::InvalidPublicKey { peer: label });
        }
        if config.public_key == self.public_key() {
            return Err(ConfigError::SelfPeer);
        }

        let peer = Arc::new(Peer::new(&config));

        if let Some(name) = &config.name {
            match self.peers_by_name.entry(name.clone()) {
                Entry::Occupied(_) => {
                    return Err(ConfigError::DuplicateName { name: name.clone() })
                }
                Entry::Vacant(slot) => {
                    slot.insert(Arc::clone(&peer));
                }
            }
        }

        match self.peers.entry(config.public_key) {
            Entry::Occupied(_) => {
                if let Some(name) = &config.name {
                    self.peers_by_name.remove(name);
                }
                return Err(ConfigError::DuplicatePeer { peer: label });
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&peer));
            }
        }

        self.router.set_allowed_ips(&config.public_key, &config.allowed_ips);

        tracing::info!(
            "Added peer {} ({} allowed IPs, endpoint {:?})",
            peer,
            config.allowed_ips.len(),
            config.endpoint
        );
        Ok(peer)
    }

    pub fn remove_peer(&self, public_key: &[u8; 32]) -> Result<(), ConfigError> {
        let (_, peer) = self
            .peers
            .remove(public_key)
            .ok_or_else(|| ConfigError::UnknownPeer {
                peer: key_label(public_key),
            })?;
        if let Some(name) = peer.name() {
            self.peers_by_name.remove(name);
        }
        self.destroy_peer(&peer);
        tracing::info!("Removed peer {}", peer);
        Ok(())
    }

    pub fn remove_peer_by_name(&self, name: &str) -> Result<(), ConfigError> {
        let peer = self
            .peer_by_name(name)
            .ok_or_else(|| ConfigError::UnknownPeer {
                peer: name.to_string(),
            })?;
        self.remove_peer(peer.public_key())
    }

    /// Replace the local identity; every session of every peer is dropped
    pub fn set_private_key(&self, private_key: [u8; 32]) {
        let local = Arc::new(StaticKeys::new(private_key));
        tracing::info!("Device public key changed: {}", BASE64.encode(local.public));
        *self.local.write() = local;

        for peer in self.all_peers() {
            {
                let mut inner = peer.lock();
                inner.timers.clear();
                inner.cookie.clear();
                inner.issuer.clear_sent_cookie();
                inner.handshake_started = None;
                if inner.state != PeerState::Destroying {
                    inner.state = PeerState::Init;
                }
            }
            self.drop_sessions(&peer);
        }
    }

    pub fn status(&self) -> DeviceStatus {
        let mut peers: Vec<PeerStatus> = self
            .all_peers()
            .iter()
            .map(|peer| {
                let inner = peer.lock();
                PeerStatus {
                    name: peer.name().map(str::to_string),
                    public_key: *peer.public_key(),
                    has_preshared_key: peer.has_preshared_key(),
                    endpoint: peer.endpoint(),
                    allowed_ips: peer.allowed_ips().to_vec(),
                    state: inner.state,
                    last_handshake: inner.last_handshake,
                    stable: peer.stable_session().state(),
                    unstable: peer.unstable_session().state(),
                }
            })
            .collect();
        peers.sort_by(|a, b| a.public_key.cmp(&b.public_key));

        DeviceStatus {
            public_key: self.public_key(),
            listen_port: self.listen_port(),
            peers,
        }
    }

    /// Tear down a peer that is no longer reachable through the maps
    fn destroy_peer(&self, peer: &Arc<Peer>) {
        {
            let mut inner = peer.lock();
            inner.state = PeerState::Destroying;
            inner.timers.clear();
            inner.pending = None;
            inner.cookie.clear();
        }
        self.router.remove_peer(peer.public_key());
        self.drop_sessions(peer);
    }

    fn drop_sessions(&self, peer: &Arc<Peer>) {
        let closed: Vec<(Arc<Session>, u64)> = {
            let _inner = peer.lock();
            peer.sessions()
                .iter()
                .map(|session| (Arc::clone(session), self.close_session(session)))
                .collect()
        };
        self.finish_teardown(peer, &closed);
    }

    /// Unregister `session` and stop admitting readers
    ///
    /// Caller holds the peer lock. Returns the generation to hand to
    /// [`finish_teardown`](Self::finish_teardown).
    pub(crate) fn close_session(&self, session: &Arc<Session>) -> u64 {
        if session.state() != SessionState::Unknown {
            self.index.remove(session.local_index(), session);
            session.set_state(SessionState::Destroying);
        }
        session.close();
        session.generation()
    }

    /// Drain closed sessions and wipe the ones nobody restarted meanwhile
    ///
    /// Must be called without the peer lock held.
    pub(crate) fn finish_teardown(&self, peer: &Arc<Peer>, closed: &[(Arc<Session>, u64)]) {
        for (session, _) in closed {
            session.drain();
        }
        let _inner = peer.lock();
        for (session, generation) in closed {
            if session.generation() == *generation {
                session.clear();
            }
        }
    }

    /// Return a session that never carried established traffic to UNKNOWN
    pub(crate) fn abort_session(&self, session: &Arc<Session>) {
        if session.state() != SessionState::Unknown {
            self.index.remove(session.local_index(), session);
        }
        session.clear();
    }

    pub(crate) fn schedule_task(&self, peer: &Arc<Peer>, task: PeerTask) {
        if peer.add_tasks(task) {
            self.scheduler.schedule_peer(Arc::clone(peer));
        }
    }

    pub fn session_count(&self) -> usize {
        self.index.len()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("public_key", &key_label(&self.public_key()))
            .field("listen_port", &self.listen_port())
            .field("peers", &self.peers.len())
            .field("sessions", &self.index.len())
            .finish()
    }
}
