//! Session slots
//!
//! A peer owns exactly two [`Session`]s for its whole lifetime. Each slot is
//! cleared and reused across handshake generations instead of reallocated.
//!
//! Data-path threads never take a peer lock. They hold a [`SessionGuard`]
//! while they read keys or the replay window; whoever retires a slot bumps
//! its generation and waits for the reader count to drain before wiping it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use zeroize::Zeroize;

use crate::crypto::noise::TransportKeys;
use crate::error::ProtocolError;
use crate::protocol::handshake::HandshakeScratch;
use crate::protocol::replay::ReplayWindow;

/// Rekey after this much time (120 seconds)
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);

/// Reject session after this much time (180 seconds)
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

/// Keep retrying a handshake for this long (90 seconds)
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);

/// Handshake retry interval (5 seconds)
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);

/// Keepalive interval (10 seconds)
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of a session slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    Unknown = 0,
    /// We sent an initiation
    InitActive = 1,
    /// We answered an initiation and wait for the first data message
    InitPassive = 2,
    Established = 3,
    /// Superseded; drained and cleared after a grace period
    Destroying = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::InitActive,
            2 => Self::InitPassive,
            3 => Self::Established,
            4 => Self::Destroying,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::InitActive => "init-active",
            Self::InitPassive => "init-passive",
            Self::Established => "established",
            Self::Destroying => "destroying",
        }
    }

    /// States whose keys may open inbound data
    pub fn can_receive(&self) -> bool {
        matches!(self, Self::InitPassive | Self::Established | Self::Destroying)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SessionTimes {
    established_at: Option<Instant>,
    last_data_sent: Option<Instant>,
}

/// One reusable cryptographic context
#[derive(Debug)]
pub struct Session {
    state: AtomicU8,
    /// Bumped whenever the slot leaves or re-enters UNKNOWN
    generation: AtomicU64,
    /// Set once transport keys are installed; readers only get in while set
    open: AtomicBool,
    readers: AtomicUsize,

    local_index: AtomicU32,
    remote_index: AtomicU32,
    is_initiator: AtomicBool,

    /// Next nonce to use
    send_counter: AtomicU64,
    keys: RwLock<TransportKeys>,
    replay: ReplayWindow,

    handshake: Mutex<Option<HandshakeScratch>>,
    times: Mutex<SessionTimes>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Unknown as u8),
            generation: AtomicU64::new(0),
            open: AtomicBool::new(false),
            readers: AtomicUsize::new(0),
            local_index: AtomicU32::new(0),
            remote_index: AtomicU32::new(0),
            is_initiator: AtomicBool::new(false),
            send_counter: AtomicU64::new(0),
            keys: RwLock::new(TransportKeys::default()),
            replay: ReplayWindow::new(),
            handshake: Mutex::new(None),
            times: Mutex::new(SessionTimes::default()),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn local_index(&self) -> u32 {
        self.local_index.load(Ordering::Acquire)
    }

    pub fn remote_index(&self) -> u32 {
        self.remote_index.load(Ordering::Acquire)
    }

    pub fn set_remote_index(&self, index: u32) {
        self.remote_index.store(index, Ordering::Release);
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator.load(Ordering::Acquire)
    }

    /// Leave UNKNOWN for `state` under a freshly allocated `local_index`
    ///
    /// Counters and the replay window restart from zero here and nowhere
    /// else. The slot stays closed to readers until
    /// [`install_keys`](Self::install_keys).
    pub fn begin(&self, state: SessionState, local_index: u32) {
        debug_assert!(matches!(
            state,
            SessionState::InitActive | SessionState::InitPassive
        ));
        self.open.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.send_counter.store(0, Ordering::Release);
        self.replay.reset();
        *self.times.lock() = SessionTimes::default();
        self.local_index.store(local_index, Ordering::Release);
        self.remote_index.store(0, Ordering::Release);
        self.is_initiator
            .store(state == SessionState::InitActive, Ordering::Release);
        self.set_state(state);
    }

    pub fn set_scratch(&self, scratch: HandshakeScratch) {
        let mut slot = self.handshake.lock();
        if let Some(old) = slot.as_mut() {
            old.zeroize();
        }
        *slot = Some(scratch);
    }

    /// Run `f` on the handshake scratch, if any
    pub fn with_scratch<R>(&self, f: impl FnOnce(&HandshakeScratch) -> R) -> Option<R> {
        self.handshake.lock().as_ref().map(f)
    }

    /// Wipe the handshake scratch (once transport keys exist)
    pub fn clear_scratch(&self) {
        if let Some(mut scratch) = self.handshake.lock().take() {
            scratch.zeroize();
        }
    }

    /// Install transport keys and admit readers
    pub fn install_keys(&self, keys: TransportKeys) {
        {
            let mut slot = self.keys.write();
            slot.zeroize();
            *slot = keys;
        }
        self.open.store(true, Ordering::SeqCst);
    }

    /// Mark ESTABLISHED as of `now`
    ///
    /// Keys must already be installed; readers that see the state see them.
    pub fn establish(&self, is_initiator: bool, now: Instant) {
        {
            let mut times = self.times.lock();
            times.established_at = Some(now);
            times.last_data_sent = None;
        }
        self.is_initiator.store(is_initiator, Ordering::Release);
        self.set_state(SessionState::Established);
    }

    pub fn established_at(&self) -> Option<Instant> {
        self.times.lock().established_at
    }

    pub fn last_data_sent(&self) -> Option<Instant> {
        self.times.lock().last_data_sent
    }

    /// Record a data send; true if it was the first on this session
    pub fn note_data_sent(&self, now: Instant) -> bool {
        let mut times = self.times.lock();
        let first = times.last_data_sent.is_none();
        times.last_data_sent = Some(now);
        first
    }

    pub fn send_counter(&self) -> u64 {
        self.send_counter.load(Ordering::Acquire)
    }

    /// Take the next nonce
    ///
    /// The counter never reaches `reject_after_messages`: the last nonce below
    /// it is refused, so a refused call never consumes a value.
    pub fn next_send_counter(&self, reject_after_messages: u64) -> Result<u64, ProtocolError> {
        self.send_counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |counter| {
                let next = counter.checked_add(1)?;
                (next < reject_after_messages).then_some(next)
            })
            .map_err(|_| ProtocolError::MessageLimit)
    }

    /// Too old or too used to send on
    pub fn hit_limits(&self, now: Instant, reject_after_time: Duration, reject_after_messages: u64) -> bool {
        let aged = match self.established_at() {
            Some(at) => now.saturating_duration_since(at) > reject_after_time,
            None => true,
        };
        aged || self.send_counter().saturating_add(1) >= reject_after_messages
    }

    /// Initiator that has received but never sent, close to the reject age
    pub fn needs_rekey_on_receive(&self, now: Instant, threshold: Duration) -> bool {
        if !self.is_initiator() {
            return false;
        }
        let times = *self.times.lock();
        match (times.established_at, times.last_data_sent) {
            (Some(at), None) => now.saturating_duration_since(at) >= threshold,
            _ => false,
        }
    }

    pub fn replay(&self) -> &ReplayWindow {
        &self.replay
    }

    /// Read access to the transport keys
    pub fn with_keys<R>(&self, f: impl FnOnce(&TransportKeys) -> R) -> R {
        f(&self.keys.read())
    }

    /// Enter as a reader if the current state satisfies `accept`
    ///
    /// The counter is raised before the state is checked; a retirer closes
    /// the slot before it reads the counter, so one of the two always sees
    /// the other.
    pub fn acquire(
        self: &Arc<Self>,
        accept: impl Fn(SessionState) -> bool,
    ) -> Option<SessionGuard> {
        self.readers.fetch_add(1, Ordering::SeqCst);
        let generation = self.generation();
        if self.open.load(Ordering::SeqCst) && accept(self.state()) {
            Some(SessionGuard {
                session: Arc::clone(self),
                generation,
            })
        } else {
            self.readers.fetch_sub(1, Ordering::Release);
            None
        }
    }

    /// Wait for the readers inside to leave
    ///
    /// Spins; only the per-peer task runner and configuration calls use
    /// this, never the data path or a holder of the peer lock.
    pub fn drain(&self) {
        let mut spins = 0u32;
        while self.readers.load(Ordering::SeqCst) != 0 {
            spins = spins.wrapping_add(1);
            if spins % 64 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Close to new readers without waiting
    ///
    /// In-flight readers are fenced off by the generation bump; follow with
    /// [`drain`](Self::drain) before wiping a slot that carried traffic.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Wipe everything and return to UNKNOWN
    pub fn clear(&self) {
        self.close();
        self.clear_scratch();
        self.keys.write().zeroize();
        *self.times.lock() = SessionTimes::default();
        self.is_initiator.store(false, Ordering::Release);
        self.set_state(SessionState::Unknown);
    }

    /// Test hook: move the send counter
    #[cfg(test)]
    pub(crate) fn force_send_counter(&self, counter: u64) {
        self.send_counter.store(counter, Ordering::Release);
    }
}

/// A reader's claim on a session
///
/// While any guard is alive the slot's keys are not wiped.
#[derive(Debug)]
pub struct SessionGuard {
    session: Arc<Session>,
    generation: u64,
}

impl SessionGuard {
    /// False once the slot was retired or restarted after this guard was taken
    pub fn is_current(&self) -> bool {
        self.session.generation() == self.generation
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl std::ops::Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.readers.fetch_sub(1, Ordering::Release);
    }
}
