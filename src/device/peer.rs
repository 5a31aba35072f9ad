//! Peer state
//!
//! Immutable identity, the two session slots, the current endpoint, the
//! pending task bits, and everything the handshake needs under one lock
//! ([`PeerInner`]).

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::IpNet;
use parking_lot::{Mutex, MutexGuard, RwLock};
use zeroize::Zeroize;

use crate::config::PeerConfig;
use crate::crypto::timestamp::{Timestamp, TimestampGenerator};
use crate::protocol::cookie::{CookieIssuer, CookieState};
use crate::protocol::session::{Session, SessionGuard, SessionState};

/// Coalesced background work for one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerTask(u32);

impl PeerTask {
    pub const NONE: Self = Self(0);
    pub const SEND_INIT: Self = Self(1 << 0);
    pub const ENDPOINT_CHANGED: Self = Self(1 << 1);
    pub const SEND_KEEPALIVE: Self = Self(1 << 2);
    pub const DESTROY_PREV_SESSION: Self = Self(1 << 3);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for PeerTask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Peer-level handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No session yet, or rekeying
    Init,
    Established,
    /// Retry budget exhausted; the next outbound packet starts over
    GiveUp,
    /// Being removed; timers and tasks are ignored
    Destroying,
}

impl PeerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Established => "established",
            Self::GiveUp => "give-up",
            Self::Destroying => "destroying",
        }
    }
}

/// Armed deadlines, polled by [`Device::tick`](crate::device::Device::tick)
#[derive(Debug, Default, Clone, Copy)]
pub struct Timers {
    pub rekey: Option<Instant>,
    pub handshake_timeout: Option<Instant>,
    pub session_dtor: Option<Instant>,
}

impl Timers {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Take a deadline if it has passed
pub(crate) fn fire(slot: &mut Option<Instant>, now: Instant) -> bool {
    match *slot {
        Some(at) if now >= at => {
            *slot = None;
            true
        }
        _ => false,
    }
}

/// Handshake, cookie and timer state, serialized by the peer lock
#[derive(Debug)]
pub struct PeerInner {
    pub state: PeerState,
    /// Greatest initiation timestamp accepted from this peer
    pub latest_timestamp: Option<Timestamp>,
    pub timestamps: TimestampGenerator,
    pub cookie: CookieState,
    pub issuer: CookieIssuer,
    /// First attempt of the current handshake round
    pub handshake_started: Option<Instant>,
    pub last_handshake: Option<SystemTime>,
    /// One outbound packet waiting for a session
    pub pending: Option<Vec<u8>>,
    pub timers: Timers,
    /// Set between an endpoint change and its ENDPOINT_CHANGED task
    pub endpoint_changing: bool,
    pub previous_endpoint: Option<SocketAddr>,
}

impl PeerInner {
    fn new() -> Self {
        Self {
            state: PeerState::Init,
            latest_timestamp: None,
            timestamps: TimestampGenerator::new(),
            cookie: CookieState::new(),
            issuer: CookieIssuer::new(),
            handshake_started: None,
            last_handshake: None,
            pending: None,
            timers: Timers::default(),
            endpoint_changing: false,
            previous_endpoint: None,
        }
    }
}

/// A configured remote peer
pub struct Peer {
    public_key: [u8; 32],
    name: Option<String>,
    preshared_key: [u8; 32],
    has_preshared_key: bool,
    allowed_ips: Vec<IpNet>,

    sessions: [Arc<Session>; 2],
    /// Which of `sessions` is stable
    stable: AtomicUsize,

    endpoint: RwLock<Option<SocketAddr>>,

    tasks: AtomicU32,
    queued: AtomicBool,

    inner: Mutex<PeerInner>,
}

impl Peer {
    pub fn new(config: &PeerConfig) -> Self {
        Self {
            public_key: config.public_key,
            name: config.name.clone(),
            preshared_key: config.preshared_key.unwrap_or([0u8; 32]),
            has_preshared_key: config.preshared_key.is_some(),
            allowed_ips: config.allowed_ips.clone(),
            sessions: [Arc::new(Session::new()), Arc::new(Session::new())],
            stable: AtomicUsize::new(0),
            endpoint: RwLock::new(config.endpoint),
            tasks: AtomicU32::new(0),
            queued: AtomicBool::new(false),
            inner: Mutex::new(PeerInner::new()),
        }
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn preshared_key(&self) -> &[u8; 32] {
        &self.preshared_key
    }

    pub fn has_preshared_key(&self) -> bool {
        self.has_preshared_key
    }

    pub fn allowed_ips(&self) -> &[IpNet] {
        &self.allowed_ips
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        *self.endpoint.read()
    }

    pub(crate) fn set_endpoint(&self, endpoint: SocketAddr) {
        *self.endpoint.write() = Some(endpoint);
    }

    pub fn lock(&self) -> MutexGuard<'_, PeerInner> {
        self.inner.lock()
    }

    pub fn stable_session(&self) -> &Arc<Session> {
        &self.sessions[self.stable.load(Ordering::Acquire)]
    }

    pub fn unstable_session(&self) -> &Arc<Session> {
        &self.sessions[1 - self.stable.load(Ordering::Acquire)]
    }

    /// Reader handle on the stable session if it is ESTABLISHED
    pub fn acquire_stable(&self) -> Option<SessionGuard> {
        loop {
            let slot = self.stable.load(Ordering::Acquire);
            if let Some(guard) = self.sessions[slot].acquire(|s| s == SessionState::Established) {
                return Some(guard);
            }
            // a swap in between: look at the new stable slot
            if self.stable.load(Ordering::Acquire) == slot {
                return None;
            }
        }
    }

    /// Publish the unstable slot as stable; returns the displaced session
    ///
    /// Requires the peer lock and an ESTABLISHED unstable slot.
    pub(crate) fn swap_sessions(&self, _inner: &mut PeerInner) -> Arc<Session> {
        let old = self.stable.load(Ordering::Acquire);
        debug_assert_eq!(self.sessions[1 - old].state(), SessionState::Established);
        self.stable.store(1 - old, Ordering::Release);
        Arc::clone(&self.sessions[old])
    }

    pub(crate) fn sessions(&self) -> &[Arc<Session>; 2] {
        &self.sessions
    }

    /// Set task bits; true if the caller must wake the scheduler
    pub(crate) fn add_tasks(&self, task: PeerTask) -> bool {
        self.tasks.fetch_or(task.bits(), Ordering::AcqRel);
        !self.queued.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn take_tasks(&self) -> PeerTask {
        PeerTask(self.tasks.swap(0, Ordering::AcqRel))
    }

    /// Leave the runner; false if new work slipped in and this runner
    /// should go on
    pub(crate) fn finish_run(&self) -> bool {
        self.queued.store(false, Ordering::SeqCst);
        if self.tasks.load(Ordering::SeqCst) == 0 {
            return true;
        }
        self.queued.swap(true, Ordering::SeqCst)
    }

    pub fn pending_tasks(&self) -> PeerTask {
        PeerTask(self.tasks.load(Ordering::Acquire))
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.preshared_key.zeroize();
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => f.write_str(name),
            None => f.write_str(&BASE64.encode(&self.public_key[..8])),
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("peer", &self.to_string())
            .field("endpoint", &self.endpoint())
            .field("stable", &self.stable_session().state())
            .field("unstable", &self.unstable_session().state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::noise::TransportKeys;
    use std::thread;
    use std::time::Duration;

    fn peer() -> Peer {
        Peer::new(&PeerConfig::new([4u8; 32]))
    }

    fn establish(session: &Session, generation: u8, now: Instant) {
        session.begin(SessionState::InitActive, u32::from(generation) + 1);
        session.install_keys(TransportKeys {
            sending_key: [generation; 32],
            receiving_key: [generation; 32],
        });
        session.establish(true, now);
    }

    #[test]
    fn test_task_bits_coalesce() {
        let peer = peer();
        assert!(peer.add_tasks(PeerTask::SEND_INIT));
        assert!(!peer.add_tasks(PeerTask::SEND_KEEPALIVE));

        let tasks = peer.take_tasks();
        assert!(tasks.contains(PeerTask::SEND_INIT));
        assert!(tasks.contains(PeerTask::SEND_KEEPALIVE));
        assert!(!tasks.contains(PeerTask::DESTROY_PREV_SESSION));

        assert!(peer.finish_run());
        assert!(peer.add_tasks(PeerTask::ENDPOINT_CHANGED));
    }

    #[test]
    fn test_finish_run_sees_late_task() {
        let peer = peer();
        assert!(peer.add_tasks(PeerTask::SEND_INIT));
        let _ = peer.take_tasks();
        // arrives while the runner is still marked queued: no wake-up
        assert!(!peer.add_tasks(PeerTask::SEND_KEEPALIVE));
        assert!(!peer.finish_run());
        assert_eq!(peer.take_tasks(), PeerTask::SEND_KEEPALIVE);
        assert!(peer.finish_run());
    }

    #[test]
    fn test_fire_consumes_deadline() {
        let now = Instant::now();
        let mut slot = Some(now + Duration::from_secs(1));
        assert!(!fire(&mut slot, now));
        assert!(fire(&mut slot, now + Duration::from_secs(1)));
        assert!(slot.is_none());
        assert!(!fire(&mut slot, now + Duration::from_secs(5)));
    }

    #[test]
    fn test_display_uses_name_or_key_prefix() {
        let unnamed = peer();
        assert_eq!(unnamed.to_string(), BASE64.encode([4u8; 8]));

        let named = Peer::new(&PeerConfig::new([4u8; 32]).with_name("gw"));
        assert_eq!(named.to_string(), "gw");
    }

    #[test]
    fn test_acquire_stable_requires_established() {
        let peer = peer();
        assert!(peer.acquire_stable().is_none());

        let now = Instant::now();
        establish(peer.unstable_session(), 1, now);
        let displaced = peer.swap_sessions(&mut peer.lock());
        assert_eq!(displaced.state(), SessionState::Unknown);

        let guard = peer.acquire_stable().unwrap();
        assert_eq!(guard.with_keys(|k| k.sending_key), [1; 32]);
    }

    #[test]
    fn test_swap_is_atomic_for_readers() {
        let peer = Arc::new(peer());
        let now = Instant::now();
        establish(peer.unstable_session(), 1, now);
        peer.swap_sessions(&mut peer.lock());

        let stop = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let peer = Arc::clone(&peer);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let mut seen = 0u64;
                    while !stop.load(Ordering::Relaxed) || seen == 0 {
                        if let Some(guard) = peer.acquire_stable() {
                            assert_eq!(guard.state(), SessionState::Established);
                            let key = guard.with_keys(|k| k.sending_key);
                            assert_ne!(key, [0u8; 32], "observed a wiped session");
                            assert!(key.iter().all(|&b| b == key[0]), "torn keys");
                            seen += 1;
                        }
                    }
                    seen
                })
            })
            .collect();

        for round in 2..200u8 {
            let next = Arc::clone(peer.unstable_session());
            establish(&next, round, now);
            let previous = peer.swap_sessions(&mut peer.lock());
            previous.close();
            previous.drain();
            previous.clear();
        }

        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
    }
}
