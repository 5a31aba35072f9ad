//! Deadlines and the per-peer task runner

use std::sync::Arc;
use std::time::Instant;

use super::peer::{fire, Peer, PeerState, PeerTask};
use super::Device;
use crate::error::{ProtocolError, WgError};
use crate::protocol::session::SessionState;

impl Device {
    /// Fire every deadline that has passed at `now`
    ///
    /// Expired deadlines only set task bits; the work happens in
    /// [`run_peer_tasks`](Self::run_peer_tasks).
    pub fn tick(&self, now: Instant) {
        for peer in self.all_peers() {
            self.tick_peer(&peer, now);
        }
    }

    fn tick_peer(&self, peer: &Arc<Peer>, now: Instant) {
        let mut tasks = PeerTask::NONE;
        let mut inner = peer.lock();
        if inner.state == PeerState::Destroying {
            return;
        }

        if fire(&mut inner.timers.rekey, now) {
            tracing::debug!("Rekey timer fired for {}", peer);
            tasks = tasks | PeerTask::SEND_INIT;
        }

        if inner.cookie.scrub(now, self.timing.cookie_time) {
            tracing::trace!("Expired cookie from {} scrubbed", peer);
        }

        if fire(&mut inner.timers.session_dtor, now) {
            tasks = tasks | PeerTask::DESTROY_PREV_SESSION;
        }

        if fire(&mut inner.timers.handshake_timeout, now) {
            let session = Arc::clone(peer.unstable_session());
            if session.state() == SessionState::InitActive {
                self.abort_session(&session);
                let elapsed = inner
                    .handshake_started
                    .map(|started| now.saturating_duration_since(started))
                    .unwrap_or_default();
                if elapsed > self.timing.rekey_attempt_time {
                    inner.state = PeerState::GiveUp;
                    inner.handshake_started = None;
                    inner.pending = None;
                    tracing::info!(
                        "Giving up on handshake with {} after {}s",
                        peer,
                        elapsed.as_secs()
                    );
                } else {
                    tracing::debug!("Handshake with {} timed out, retrying", peer);
                    tasks = tasks | PeerTask::SEND_INIT;
                }
            }
        }
        drop(inner);

        if !tasks.is_empty() {
            self.schedule_task(peer, tasks);
        }
    }

    /// Run the queued tasks of `peer` until none are left
    ///
    /// Called by the [`TaskScheduler`](super::external::TaskScheduler)
    /// implementation, one runner per peer at a time.
    pub fn run_peer_tasks(&self, peer: &Arc<Peer>, now: Instant) {
        loop {
            let tasks = peer.take_tasks();
            if !tasks.is_empty() && peer.lock().state != PeerState::Destroying {
                self.run_tasks(peer, tasks, now);
            }
            if peer.finish_run() {
                break;
            }
        }
    }

    fn run_tasks(&self, peer: &Arc<Peer>, tasks: PeerTask, now: Instant) {
        if tasks.contains(PeerTask::ENDPOINT_CHANGED) {
            let mut inner = peer.lock();
            if let Some(old) = inner.previous_endpoint.take() {
                tracing::trace!("Retired previous endpoint {} of {}", old, peer);
            }
            inner.endpoint_changing = false;
        }

        if tasks.contains(PeerTask::SEND_INIT) {
            match self.send_initiation(peer, now) {
                Ok(()) => {}
                Err(WgError::Protocol(ProtocolError::HandshakeBusy)) => {
                    tracing::trace!("Handshake with {} already in progress", peer);
                }
                Err(e) => tracing::debug!("Initiation to {} failed: {}", peer, e),
            }
        }

        if tasks.contains(PeerTask::SEND_KEEPALIVE) {
            if let Some(guard) = peer.acquire_stable() {
                if let Err(e) = self.send_data(peer, &guard, &[], now) {
                    tracing::debug!("Keepalive to {} failed: {}", peer, e);
                }
            }
        }

        if tasks.contains(PeerTask::DESTROY_PREV_SESSION) {
            let closed = {
                let _inner = peer.lock();
                let session = Arc::clone(peer.unstable_session());
                if session.state() == SessionState::Destroying {
                    let generation = self.close_session(&session);
                    Some((session, generation))
                } else {
                    None
                }
            };
            if let Some(closed) = closed {
                self.finish_teardown(peer, std::slice::from_ref(&closed));
                tracing::debug!("Destroyed previous session of {}", peer);
            }
        }
    }
}
