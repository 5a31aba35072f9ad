//! Inbound datagrams
//!
//! Handshake messages are gated on mac1 before anything else happens, then
//! on the peer's load check. Data messages go through the session index, the
//! replay window and the AEAD before the inner packet is looked at.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use super::peer::{Peer, PeerInner, PeerState, PeerTask};
use super::Device;
use crate::crypto::timestamp::is_newer;
use crate::error::{ProtocolError, WgError};
use crate::protocol::cookie::LoadVerdict;
use crate::protocol::handshake::{self, verify_mac1};
use crate::protocol::messages::{
    get_message_type, CookieReply, HandshakeInitiation, HandshakeResponse, MessageType,
    TransportHeader,
};
use crate::protocol::session::{Session, SessionGuard, SessionState};
use crate::protocol::transport::{self, InnerPacket};

impl Device {
    /// Process one datagram, logging and dropping anything that fails
    ///
    /// Returns the decrypted inner packet when there is one to deliver.
    pub fn handle_datagram(&self, data: &[u8], src: SocketAddr, now: Instant) -> Option<Vec<u8>> {
        match self.receive(data, src, now) {
            Ok(packet) => packet,
            Err(e) if e.is_recoverable() => {
                tracing::debug!("Dropped datagram from {}: {}", src, e);
                None
            }
            Err(e) => {
                tracing::warn!("Datagram from {} failed: {}", src, e);
                None
            }
        }
    }

    /// Process one datagram
    pub fn receive(
        &self,
        data: &[u8],
        src: SocketAddr,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, WgError> {
        match get_message_type(data)? {
            MessageType::HandshakeInitiation => {
                self.handle_initiation(data, src, now)?;
                Ok(None)
            }
            MessageType::HandshakeResponse => {
                self.handle_response(data, src, now)?;
                Ok(None)
            }
            MessageType::CookieReply => {
                self.handle_cookie_reply(data, now)?;
                Ok(None)
            }
            MessageType::TransportData => self.handle_data(data, src, now),
        }
    }

    fn handle_initiation(&self, data: &[u8], src: SocketAddr, now: Instant) -> Result<(), WgError> {
        let msg = HandshakeInitiation::from_bytes(data)?;
        let message = &data[..HandshakeInitiation::SIZE];
        let local = self.local_keys();
        verify_mac1(message, HandshakeInitiation::MAC1_OFFSET, &local.mac1_key)?;

        let mut received = handshake::open_initiation(&local, &msg)?;
        let peer = self
            .peer(&received.peer_public)
            .ok_or(ProtocolError::UnknownPeer)?;

        let mut inner = peer.lock();
        if inner.state == PeerState::Destroying {
            return Err(ProtocolError::UnknownPeer.into());
        }

        match inner.issuer.verdict(
            MessageType::HandshakeInitiation,
            message,
            HandshakeInitiation::MAC2_OFFSET,
            now,
            self.timing.under_load_window,
        ) {
            LoadVerdict::Proceed => {}
            LoadVerdict::SendCookie => {
                let reply = inner.issuer.seal_reply(
                    &local.cookie_key,
                    msg.sender_index,
                    &msg.mac1,
                    src,
                    now,
                    self.timing.randval_time,
                )?;
                drop(inner);
                self.transport.send_datagram(src, &reply.to_bytes())?;
                tracing::debug!("Under load: sent cookie reply to {} for {}", src, peer);
                return Ok(());
            }
            LoadVerdict::Drop => return Err(ProtocolError::MacVerificationFailed.into()),
        }

        let timestamp = received.open_timestamp(&local)?;
        if let Some(latest) = &inner.latest_timestamp {
            if !is_newer(&timestamp, latest) {
                return Err(ProtocolError::StaleTimestamp.into());
            }
        }

        let session = Arc::clone(peer.unstable_session());
        match session.state() {
            SessionState::InitActive => return Err(ProtocolError::HandshakeBusy.into()),
            SessionState::Destroying => {
                // the peer rekeyed inside our grace period
                inner.timers.session_dtor = None;
                self.abort_session(&session);
                tracing::debug!(
                    "Previous session of {} force-cleared for a new handshake",
                    peer
                );
            }
            SessionState::InitPassive => self.abort_session(&session),
            SessionState::Unknown | SessionState::Established => {}
        }
        inner.latest_timestamp = Some(timestamp);

        let local_index = self.index.allocate(&peer, &session);
        session.begin(SessionState::InitPassive, local_index);
        session.set_remote_index(received.sender_index);

        let cookie = inner.cookie.cookie_at(now, self.timing.cookie_time).copied();
        let (response, keys) = match handshake::create_response(
            &mut received,
            local_index,
            peer.preshared_key(),
            cookie.as_ref(),
        ) {
            Ok(built) => built,
            Err(e) => {
                self.abort_session(&session);
                return Err(e);
            }
        };
        session.install_keys(keys);
        inner.cookie.record_sent_mac1(response.mac1);

        self.update_endpoint(&peer, &mut inner, src);
        drop(inner);

        self.transport.send_datagram(src, &response.to_bytes())?;
        tracing::debug!(
            "Sent handshake response to {} ({}, index {:#010x})",
            peer,
            src,
            local_index
        );
        Ok(())
    }

    fn handle_response(&self, data: &[u8], src: SocketAddr, now: Instant) -> Result<(), WgError> {
        let msg = HandshakeResponse::from_bytes(data)?;
        let message = &data[..HandshakeResponse::SIZE];
        let local = self.local_keys();
        verify_mac1(message, HandshakeResponse::MAC1_OFFSET, &local.mac1_key)?;

        let entry = self
            .index
            .get(msg.receiver_index)
            .ok_or(ProtocolError::InvalidSenderIndex {
                index: msg.receiver_index,
            })?;
        let (peer, session) = (entry.peer, entry.session);

        let mut inner = peer.lock();
        if inner.state == PeerState::Destroying {
            return Err(ProtocolError::UnknownPeer.into());
        }

        match inner.issuer.verdict(
            MessageType::HandshakeResponse,
            message,
            HandshakeResponse::MAC2_OFFSET,
            now,
            self.timing.under_load_window,
        ) {
            LoadVerdict::Proceed => {}
            LoadVerdict::SendCookie => {
                let reply = inner.issuer.seal_reply(
                    &local.cookie_key,
                    msg.sender_index,
                    &msg.mac1,
                    src,
                    now,
                    self.timing.randval_time,
                )?;
                drop(inner);
                self.transport.send_datagram(src, &reply.to_bytes())?;
                tracing::debug!("Under load: sent cookie reply to {} for {}", src, peer);
                return Ok(());
            }
            LoadVerdict::Drop => return Err(ProtocolError::MacVerificationFailed.into()),
        }

        let state = session.state();
        if state != SessionState::InitActive || !Arc::ptr_eq(&session, peer.unstable_session()) {
            return Err(ProtocolError::InvalidSessionState {
                index: msg.receiver_index,
                state: state.as_str(),
            }
            .into());
        }

        let keys = session
            .with_scratch(|scratch| {
                handshake::consume_response(scratch, &local, peer.preshared_key(), &msg)
            })
            .ok_or(ProtocolError::NoSession)??;

        session.install_keys(keys);
        session.clear_scratch();
        session.set_remote_index(msg.sender_index);
        session.establish(true, now);

        inner.timers.handshake_timeout = None;
        let previous = peer.swap_sessions(&mut inner);
        Self::finish_handshake(&mut inner);
        inner.timers.rekey = Some(now + self.timing.rekey_after_time);
        self.update_endpoint(&peer, &mut inner, src);
        self.retire_previous(&mut inner, &previous, now);

        let pending = inner.pending.take();
        drop(inner);

        tracing::info!(
            "Handshake with {} complete (initiator, index {:#010x})",
            peer,
            session.local_index()
        );

        let payload = pending.unwrap_or_default();
        if let Some(guard) = peer.acquire_stable() {
            if let Err(e) = self.send_data(&peer, &guard, &payload, now) {
                tracing::debug!("First send to {} failed: {}", peer, e);
            }
        }
        Ok(())
    }

    fn handle_cookie_reply(&self, data: &[u8], now: Instant) -> Result<(), WgError> {
        let reply = CookieReply::from_bytes(data)?;
        let entry = self
            .index
            .get(reply.receiver_index)
            .ok_or(ProtocolError::InvalidSenderIndex {
                index: reply.receiver_index,
            })?;

        let peer = entry.peer;
        let mut inner = peer.lock();
        inner
            .cookie
            .process_cookie_reply(&reply, peer.public_key(), now)?;
        drop(inner);

        tracing::debug!("Received cookie from {}", peer);
        Ok(())
    }

    fn handle_data(
        &self,
        data: &[u8],
        src: SocketAddr,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, WgError> {
        let header = TransportHeader::from_bytes(data)?;
        let entry = self
            .index
            .get(header.receiver_index)
            .ok_or(ProtocolError::InvalidSenderIndex {
                index: header.receiver_index,
            })?;
        let peer = entry.peer;

        let guard = entry
            .session
            .acquire(|state| state.can_receive())
            .ok_or(ProtocolError::NoSession)?;

        if !guard.replay().check_fast(header.counter) {
            return Err(ProtocolError::ReplayDetected {
                counter: header.counter,
            }
            .into());
        }

        let key = guard.with_keys(|keys| keys.receiving_key);
        let mut decrypted = transport::decrypt_packet(&key, &header, data)?;

        // the slot restarted under us; its window belongs to a new handshake
        if !guard.is_current() {
            return Err(ProtocolError::NoSession.into());
        }
        if !guard.replay().update(header.counter) {
            return Err(ProtocolError::ReplayDetected {
                counter: header.counter,
            }
            .into());
        }

        let inner_packet = transport::parse_inner_packet(&decrypted)?;
        self.update_endpoint_if_necessary(&peer, src);

        let mut route_mismatch = false;
        let delivered = match inner_packet {
            InnerPacket::Keepalive => {
                tracing::trace!("Keepalive from {}", peer);
                None
            }
            InnerPacket::Ip { source, len } => {
                if self.router.peer_owns(peer.public_key(), source) {
                    decrypted.truncate(len);
                    Some(decrypted)
                } else {
                    tracing::debug!("Dropped packet from {}: source {} not allowed", peer, source);
                    route_mismatch = true;
                    None
                }
            }
        };

        match guard.state() {
            SessionState::InitPassive => self.promote_passive(&peer, &guard, now),
            SessionState::Established | SessionState::Destroying => {
                if guard.needs_rekey_on_receive(now, self.timing.receive_rekey_threshold()) {
                    self.schedule_task(&peer, PeerTask::SEND_INIT);
                }
                let idle = match guard.last_data_sent() {
                    Some(at) => now.saturating_duration_since(at) >= self.timing.keepalive_timeout,
                    None => true,
                };
                if idle {
                    self.schedule_task(&peer, PeerTask::SEND_KEEPALIVE);
                }
            }
            _ => {}
        }
        drop(guard);

        if route_mismatch {
            return Err(ProtocolError::RouteMismatch.into());
        }
        Ok(delivered)
    }

    /// First authenticated data on a responder session: make it stable
    fn promote_passive(&self, peer: &Arc<Peer>, guard: &SessionGuard, now: Instant) {
        let mut inner = peer.lock();
        let session = guard.session();
        if !guard.is_current()
            || session.state() != SessionState::InitPassive
            || !Arc::ptr_eq(session, peer.unstable_session())
        {
            // someone else promoted or replaced it first
            return;
        }

        session.establish(false, now);
        inner.timers.handshake_timeout = None;
        let previous = peer.swap_sessions(&mut inner);
        Self::finish_handshake(&mut inner);
        self.retire_previous(&mut inner, &previous, now);

        let pending = inner.pending.take();
        drop(inner);

        tracing::info!(
            "Handshake with {} complete (responder, index {:#010x})",
            peer,
            session.local_index()
        );

        if let Some(packet) = pending {
            if let Some(stable) = peer.acquire_stable() {
                if let Err(e) = self.send_data(peer, &stable, &packet, now) {
                    tracing::debug!("Queued send to {} failed: {}", peer, e);
                }
            }
        }
    }

    /// Peer bookkeeping shared by both ways of completing a handshake
    fn finish_handshake(inner: &mut PeerInner) {
        inner.state = PeerState::Established;
        inner.last_handshake = Some(SystemTime::now());
        inner.handshake_started = None;
        inner.cookie.clear();
        inner.issuer.clear_sent_cookie();
    }

    /// Deal with the session displaced by a swap
    fn retire_previous(&self, inner: &mut PeerInner, previous: &Arc<Session>, now: Instant) {
        if previous.state() == SessionState::Established {
            previous.set_state(SessionState::Destroying);
            inner.timers.session_dtor = Some(now + self.timing.session_destroy_grace);
        } else {
            self.abort_session(previous);
        }
    }

    fn update_endpoint_if_necessary(&self, peer: &Arc<Peer>, src: SocketAddr) {
        if peer.endpoint() == Some(src) {
            return;
        }
        let mut inner = peer.lock();
        self.update_endpoint(peer, &mut inner, src);
    }

    /// Switch to `src`, at most once per ENDPOINT_CHANGED round
    fn update_endpoint(&self, peer: &Arc<Peer>, inner: &mut PeerInner, src: SocketAddr) {
        let current = peer.endpoint();
        if current == Some(src) || inner.endpoint_changing {
            return;
        }
        inner.previous_endpoint = current;
        inner.endpoint_changing = true;
        peer.set_endpoint(src);
        self.schedule_task(peer, PeerTask::ENDPOINT_CHANGED);
        tracing::debug!("Endpoint of {} changed: {:?} -> {}", peer, current, src);
    }
}
