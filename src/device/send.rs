//! Outbound packets and handshake initiations

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use super::peer::{Peer, PeerState, PeerTask};
use super::Device;
use crate::error::{NetworkError, ProtocolError, WgError};
use crate::protocol::handshake;
use crate::protocol::session::{SessionGuard, SessionState};
use crate::protocol::transport;

impl Device {
    /// Route an outbound IP packet to its peer and send it
    ///
    /// Without a usable session the packet is held (one per peer, newest
    /// wins) and a handshake is requested.
    pub fn send_packet(&self, packet: &[u8], now: Instant) -> Result<(), WgError> {
        let destination: IpAddr =
            transport::destination_of(packet).ok_or(ProtocolError::InvalidInnerPacket)?;
        let key = self
            .router
            .lookup_peer(destination)
            .ok_or_else(|| NetworkError::NoRoute {
                destination: destination.to_string(),
            })?;
        let peer = self.peer(&key).ok_or(ProtocolError::UnknownPeer)?;
        self.send_to_peer(&peer, packet, now)
    }

    pub fn send_to_peer(&self, peer: &Arc<Peer>, packet: &[u8], now: Instant) -> Result<(), WgError> {
        if let Some(guard) = peer.acquire_stable() {
            if !guard.hit_limits(
                now,
                self.timing.reject_after_time,
                self.timing.reject_after_messages,
            ) {
                return self.send_data(peer, &guard, packet, now);
            }
        }

        {
            let mut inner = peer.lock();
            if inner.state == PeerState::Destroying {
                return Err(ProtocolError::UnknownPeer.into());
            }
            if inner.pending.replace(packet.to_vec()).is_some() {
                tracing::trace!("Replaced queued packet for {}", peer);
            }
        }
        self.schedule_task(peer, PeerTask::SEND_INIT);
        Ok(())
    }

    /// Seal `plaintext` on the session held by `guard` and send it
    ///
    /// An empty `plaintext` sends a keepalive.
    pub(crate) fn send_data(
        &self,
        peer: &Arc<Peer>,
        guard: &SessionGuard,
        plaintext: &[u8],
        now: Instant,
    ) -> Result<(), WgError> {
        let endpoint = peer.endpoint().ok_or(NetworkError::NoEndpoint)?;
        let reject_after_messages = self.timing.reject_after_messages;

        if guard.hit_limits(now, self.timing.reject_after_time, reject_after_messages) {
            self.schedule_task(peer, PeerTask::SEND_INIT);
            let exhausted = guard.send_counter().saturating_add(1) >= reject_after_messages;
            return Err(if exhausted {
                ProtocolError::MessageLimit
            } else {
                ProtocolError::SessionExpired
            }
            .into());
        }

        let counter = match guard.next_send_counter(reject_after_messages) {
            Ok(counter) => counter,
            Err(e) => {
                self.schedule_task(peer, PeerTask::SEND_INIT);
                return Err(e.into());
            }
        };

        let key = guard.with_keys(|keys| keys.sending_key);
        let datagram = transport::encrypt_packet(&key, counter, guard.remote_index(), plaintext)?;
        self.transport.send_datagram(endpoint, &datagram)?;

        let first = guard.note_data_sent(now);
        if first && guard.is_initiator() {
            let mut inner = peer.lock();
            if inner.timers.rekey.is_none() {
                inner.timers.rekey = Some(now + self.timing.rekey_after_time);
            }
        }
        if counter.saturating_add(1) >= self.timing.rekey_after_messages {
            self.schedule_task(peer, PeerTask::SEND_INIT);
        }

        if plaintext.is_empty() {
            tracing::trace!("Sent keepalive to {} (counter {})", peer, counter);
        }
        Ok(())
    }

    /// Start a handshake in the unstable slot
    ///
    /// Refused while the slot is mid-handshake as initiator or still
    /// draining a superseded session; a half-finished responder attempt is
    /// abandoned.
    pub(crate) fn send_initiation(&self, peer: &Arc<Peer>, now: Instant) -> Result<(), WgError> {
        let endpoint = peer.endpoint().ok_or(NetworkError::NoEndpoint)?;
        let local = self.local_keys();

        let mut inner = peer.lock();
        if inner.state == PeerState::Destroying {
            return Err(ProtocolError::UnknownPeer.into());
        }

        let session = Arc::clone(peer.unstable_session());
        match session.state() {
            SessionState::Destroying | SessionState::InitActive => {
                return Err(ProtocolError::HandshakeBusy.into());
            }
            SessionState::InitPassive => self.abort_session(&session),
            SessionState::Unknown | SessionState::Established => {}
        }

        let local_index = self.index.allocate(peer, &session);
        session.begin(SessionState::InitActive, local_index);

        let timestamp = inner.timestamps.next();
        let cookie = inner.cookie.cookie_at(now, self.timing.cookie_time).copied();
        let (msg, scratch) = match handshake::create_initiation(
            &local,
            peer.public_key(),
            local_index,
            &timestamp,
            cookie.as_ref(),
        ) {
            Ok(built) => built,
            Err(e) => {
                self.abort_session(&session);
                return Err(e);
            }
        };
        session.set_scratch(scratch);
        inner.cookie.record_sent_mac1(msg.mac1);

        if let Err(e) = self.transport.send_datagram(endpoint, &msg.to_bytes()) {
            self.abort_session(&session);
            return Err(e.into());
        }

        if inner.handshake_started.is_none() {
            inner.handshake_started = Some(now);
        }
        if inner.state == PeerState::GiveUp {
            inner.state = PeerState::Init;
        }
        inner.timers.handshake_timeout = Some(now + self.timing.rekey_timeout);
        drop(inner);

        tracing::debug!(
            "Sent handshake initiation to {} ({}, index {:#010x}, cookie: {})",
            peer,
            endpoint,
            local_index,
            cookie.is_some()
        );
        Ok(())
    }
}
