//! Cookie handling for WireGuard DoS protection
//!
//! A responder that believes it is under load answers a handshake message with
//! a Cookie Reply instead of processing it. The initiator decrypts the cookie
//! and uses it as the mac2 key on its next attempt.
//!
//! - [`CookieState`]: initiator side, the last mac1 we sent and the latest
//!   cookie we were given.
//! - [`CookieIssuer`]: responder side, the rotating secret, the last cookie we
//!   handed out, and the per-message-type load tracker.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::{rngs::OsRng, Rng, RngCore};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::crypto::{aead, blake2s, noise};
use crate::error::{CryptoError, ProtocolError, WgError};
use crate::protocol::handshake::compute_mac2;
use crate::protocol::messages::{CookieReply, MessageType};

/// Cookie validity duration (120 seconds per WireGuard spec)
pub const COOKIE_TIME: Duration = Duration::from_secs(120);

/// Lifetime of the secret cookies are derived from
pub const RANDVAL_TIME: Duration = Duration::from_secs(120);

/// Initiator-side cookie state for one peer
#[derive(Debug, Clone, Default)]
pub struct CookieState {
    /// Decrypted cookie value (16 bytes)
    cookie: Option<[u8; 16]>,
    /// When the cookie was received
    received_at: Option<Instant>,
    /// mac1 of the last handshake message we sent to this peer
    last_sent_mac1: Option<[u8; 16]>,
}

impl CookieState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the mac1 of a message we just sent
    pub fn record_sent_mac1(&mut self, mac1: [u8; 16]) {
        self.last_sent_mac1 = Some(mac1);
    }

    pub fn last_sent_mac1(&self) -> Option<&[u8; 16]> {
        self.last_sent_mac1.as_ref()
    }

    /// Current cookie if it is younger than `validity`
    pub fn cookie_at(&self, now: Instant, validity: Duration) -> Option<&[u8; 16]> {
        match (&self.cookie, self.received_at) {
            (Some(cookie), Some(received)) if now.saturating_duration_since(received) < validity => {
                Some(cookie)
            }
            _ => None,
        }
    }

    /// Decrypt a Cookie Reply and store the cookie
    ///
    /// Only accepted while a sent mac1 is on record; that mac1 is the
    /// associated data the responder sealed against.
    pub fn process_cookie_reply(
        &mut self,
        reply: &CookieReply,
        peer_public: &[u8; 32],
        now: Instant,
    ) -> Result<(), WgError> {
        let Some(mac1) = self.last_sent_mac1 else {
            return Err(ProtocolError::CookieRequired.into());
        };

        let key = noise::cookie_key(peer_public);
        let decrypted = aead::xdecrypt(&key, &reply.nonce, &reply.encrypted_cookie, &mac1)?;
        let cookie: [u8; 16] = decrypted
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Malformed {
                len: decrypted.len(),
            })?;

        self.cookie = Some(cookie);
        self.received_at = Some(now);

        tracing::debug!("Stored new cookie (valid for {}s)", COOKIE_TIME.as_secs());

        Ok(())
    }

    /// Wipe the cookie once it is older than `validity`
    ///
    /// Returns true if a cookie was dropped.
    pub fn scrub(&mut self, now: Instant, validity: Duration) -> bool {
        match self.received_at {
            Some(received) if now.saturating_duration_since(received) >= validity => {
                if let Some(cookie) = self.cookie.as_mut() {
                    cookie.zeroize();
                }
                self.cookie = None;
                self.received_at = None;
                true
            }
            _ => false,
        }
    }

    /// Forget the sent mac1 and the cookie (after a completed handshake)
    pub fn clear(&mut self) {
        if let Some(cookie) = self.cookie.as_mut() {
            cookie.zeroize();
        }
        self.cookie = None;
        self.received_at = None;
        self.last_sent_mac1 = None;
    }
}

/// What to do with a handshake message after the load check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadVerdict {
    /// Not under load, or mac2 proves a recent cookie round-trip
    Proceed,
    /// Answer with a cookie reply and stop
    SendCookie,
    /// mac2 present but wrong: drop silently
    Drop,
}

/// Responder-side cookie state for one peer
#[derive(Debug, Default)]
pub struct CookieIssuer {
    randval: u32,
    randval_at: Option<Instant>,
    last_sent_cookie: Option<[u8; 16]>,
    last_initiation: Option<Instant>,
    last_response: Option<Instant>,
}

impl CookieIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the arrival of `msg_type` and report whether the previous one
    /// arrived less than `window` ago
    pub fn note_arrival(&mut self, msg_type: MessageType, now: Instant, window: Duration) -> bool {
        let slot = match msg_type {
            MessageType::HandshakeInitiation => &mut self.last_initiation,
            MessageType::HandshakeResponse => &mut self.last_response,
            _ => return false,
        };
        let under_load = matches!(*slot, Some(prev) if now.saturating_duration_since(prev) < window);
        *slot = Some(now);
        under_load
    }

    /// Apply the under-load policy to a handshake message whose mac1 passed
    pub fn verdict(
        &mut self,
        msg_type: MessageType,
        message: &[u8],
        mac2_offset: usize,
        now: Instant,
        window: Duration,
    ) -> LoadVerdict {
        if !self.note_arrival(msg_type, now, window) {
            return LoadVerdict::Proceed;
        }

        let mac2 = &message[mac2_offset..mac2_offset + blake2s::MAC_LEN];
        if mac2.iter().all(|&b| b == 0) {
            return LoadVerdict::SendCookie;
        }
        let Some(cookie) = self.last_sent_cookie.as_ref() else {
            return LoadVerdict::SendCookie;
        };

        let expected = compute_mac2(message, mac2_offset, cookie);
        if bool::from(expected[..].ct_eq(mac2)) {
            LoadVerdict::Proceed
        } else {
            LoadVerdict::Drop
        }
    }

    /// cookie = MAC(randval, source address || source port), rotating
    /// randval every `randval_time`
    pub fn make_cookie(&mut self, src: SocketAddr, now: Instant, randval_time: Duration) -> [u8; 16] {
        let stale = match self.randval_at {
            Some(at) => now.saturating_duration_since(at) > randval_time,
            None => true,
        };
        if stale {
            self.randval = OsRng.gen();
            self.randval_at = Some(now);
        }

        let port = src.port().to_be_bytes();
        let key = self.randval.to_le_bytes();
        match src {
            SocketAddr::V4(v4) => blake2s::mac_parts(&key, &[&v4.ip().octets(), &port]),
            SocketAddr::V6(v6) => blake2s::mac_parts(&key, &[&v6.ip().octets(), &port]),
        }
    }

    /// Seal a fresh cookie for `src` against the peer's mac1
    ///
    /// `cookie_key` is HASH("cookie--" || our static public).
    pub fn seal_reply(
        &mut self,
        cookie_key: &[u8; 32],
        receiver_index: u32,
        their_mac1: &[u8; 16],
        src: SocketAddr,
        now: Instant,
        randval_time: Duration,
    ) -> Result<CookieReply, WgError> {
        let cookie = self.make_cookie(src, now, randval_time);

        let mut nonce = [0u8; aead::XNONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = aead::xencrypt(cookie_key, &nonce, &cookie, their_mac1)?;
        let encrypted_cookie: [u8; 32] = sealed
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Encryption)?;

        self.last_sent_cookie = Some(cookie);

        Ok(CookieReply {
            receiver_index,
            nonce,
            encrypted_cookie,
        })
    }

    /// Forget the last issued cookie
    pub fn clear_sent_cookie(&mut self) {
        self.last_sent_cookie = None;
    }

    pub fn has_sent_cookie(&self) -> bool {
        self.last_sent_cookie.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::x25519;
    use crate::protocol::messages::HandshakeInitiation;

    fn addr() -> SocketAddr {
        "192.0.2.7:51820".parse().unwrap()
    }

    #[test]
    fn test_cookie_state_empty() {
        let state = CookieState::new();
        assert!(state.cookie_at(Instant::now(), COOKIE_TIME).is_none());
        assert!(state.last_sent_mac1().is_none());
    }

    #[test]
    fn test_scrub_drops_expired_cookie() {
        let (_, responder_public) = x25519::generate_keypair();
        let cookie_key = noise::cookie_key(&responder_public);
        let now = Instant::now();

        let mac1 = [0x21u8; 16];
        let mut issuer = CookieIssuer::new();
        let reply = issuer
            .seal_reply(&cookie_key, 9, &mac1, addr(), now, RANDVAL_TIME)
            .unwrap();
        let mut state = CookieState::new();
        state.record_sent_mac1(mac1);
        state.process_cookie_reply(&reply, &responder_public, now).unwrap();

        assert!(!state.scrub(now + Duration::from_secs(1), COOKIE_TIME));
        assert!(state.cookie_at(now, COOKIE_TIME).is_some());

        assert!(state.scrub(now + COOKIE_TIME, COOKIE_TIME));
        assert!(state.cookie_at(now, COOKIE_TIME).is_none());
        assert!(!state.scrub(now + COOKIE_TIME, COOKIE_TIME));
    }

    #[test]
    fn test_cookie_round_trip() {
        let (_, responder_public) = x25519::generate_keypair();
        let cookie_key = noise::cookie_key(&responder_public);
        let now = Instant::now();

        let mac1 = [0x11u8; 16];
        let mut issuer = CookieIssuer::new();
        let reply = issuer
            .seal_reply(&cookie_key, 7, &mac1, addr(), now, RANDVAL_TIME)
            .unwrap();
        assert_eq!(reply.receiver_index, 7);

        // opens under the same mac1
        let mut state = CookieState::new();
        state.record_sent_mac1(mac1);
        state.process_cookie_reply(&reply, &responder_public, now).unwrap();
        let cookie = *state.cookie_at(now, COOKIE_TIME).unwrap();
        assert_eq!(Some(cookie), issuer.last_sent_cookie);

        // and not under any other
        let mut other = CookieState::new();
        other.record_sent_mac1([0x12u8; 16]);
        assert!(other
            .process_cookie_reply(&reply, &responder_public, now)
            .is_err());
        assert!(other.cookie_at(now, COOKIE_TIME).is_none());
    }

    #[test]
    fn test_cookie_reply_needs_sent_mac1() {
        let (_, responder_public) = x25519::generate_keypair();
        let mut issuer = CookieIssuer::new();
        let now = Instant::now();
        let reply = issuer
            .seal_reply(&noise::cookie_key(&responder_public), 1, &[0u8; 16], addr(), now, RANDVAL_TIME)
            .unwrap();

        let mut state = CookieState::new();
        assert!(matches!(
            state.process_cookie_reply(&reply, &responder_public, now),
            Err(WgError::Protocol(ProtocolError::CookieRequired))
        ));
    }

    #[test]
    fn test_cookie_expiry() {
        let now = Instant::now();
        let mut state = CookieState::new();
        state.cookie = Some([42u8; 16]);
        state.received_at = Some(now);

        assert!(state.cookie_at(now + Duration::from_secs(119), COOKIE_TIME).is_some());
        assert!(state.cookie_at(now + COOKIE_TIME, COOKIE_TIME).is_none());

        state.clear();
        assert!(state.cookie_at(now, COOKIE_TIME).is_none());
    }

    #[test]
    fn test_cookie_binds_source_and_rotates() {
        let now = Instant::now();
        let mut issuer = CookieIssuer::new();

        let a = issuer.make_cookie(addr(), now, RANDVAL_TIME);
        assert_eq!(a, issuer.make_cookie(addr(), now + Duration::from_secs(1), RANDVAL_TIME));

        let other_port: SocketAddr = "192.0.2.7:51821".parse().unwrap();
        assert_ne!(a, issuer.make_cookie(other_port, now, RANDVAL_TIME));

        let later = now + RANDVAL_TIME + Duration::from_secs(1);
        assert_ne!(a, issuer.make_cookie(addr(), later, RANDVAL_TIME));
    }

    #[test]
    fn test_load_verdicts() {
        let window = Duration::from_secs(1);
        let now = Instant::now();
        let mut issuer = CookieIssuer::new();
        let mut msg = [0u8; HandshakeInitiation::SIZE];
        let offset = HandshakeInitiation::MAC2_OFFSET;
        let init = MessageType::HandshakeInitiation;

        // first arrival is never under load
        assert_eq!(issuer.verdict(init, &msg, offset, now, window), LoadVerdict::Proceed);

        // a second one in the same window with zero mac2 asks for a cookie
        let now = now + Duration::from_millis(200);
        assert_eq!(issuer.verdict(init, &msg, offset, now, window), LoadVerdict::SendCookie);

        // nonzero mac2 but no cookie issued yet
        msg[offset] = 1;
        assert_eq!(issuer.verdict(init, &msg, offset, now, window), LoadVerdict::SendCookie);

        // issued cookie, wrong mac2
        let cookie = issuer.make_cookie(addr(), now, RANDVAL_TIME);
        issuer.last_sent_cookie = Some(cookie);
        assert_eq!(issuer.verdict(init, &msg, offset, now, window), LoadVerdict::Drop);

        // correct mac2
        let mac2 = compute_mac2(&msg, offset, &cookie);
        msg[offset..offset + 16].copy_from_slice(&mac2);
        assert_eq!(issuer.verdict(init, &msg, offset, now, window), LoadVerdict::Proceed);

        // responses are tracked separately
        assert_eq!(
            issuer.verdict(MessageType::HandshakeResponse, &msg, offset, now, window),
            LoadVerdict::Proceed
        );

        // quiet period resets
        let now = now + Duration::from_secs(2);
        msg[offset..offset + 16].fill(0);
        assert_eq!(issuer.verdict(init, &msg, offset, now, window), LoadVerdict::Proceed);
    }
}
