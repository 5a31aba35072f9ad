//! WireGuard handshake messages (Noise IKpsk2)
//!
//! Pure construction and consumption of the two handshake messages. Nothing
//! here touches sessions, peers or clocks; the device layer decides when each
//! step runs and what happens to its output.
//!
//! Initiator: [`create_initiation`], later [`consume_response`].
//! Responder: [`open_initiation`], [`ReceivedInitiation::open_timestamp`],
//! then [`create_response`].

use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::crypto::timestamp::Timestamp;
use crate::crypto::{blake2s, noise, x25519};
use crate::crypto::noise::{HandshakeState, TransportKeys};
use crate::error::{CryptoError, ProtocolError, WgError};
use crate::protocol::messages::{HandshakeInitiation, HandshakeResponse};

/// Local static identity with its derived mac1 and cookie keys
#[derive(Clone)]
pub struct StaticKeys {
    pub private: [u8; 32],
    pub public: [u8; 32],
    /// HASH("mac1----" || public): verifies mac1 on messages sent to us
    pub mac1_key: [u8; 32],
    /// HASH("cookie--" || public): seals cookie replies we send
    pub cookie_key: [u8; 32],
}

impl StaticKeys {
    pub fn new(private: [u8; 32]) -> Self {
        let public = x25519::public_key(&private);
        Self {
            private,
            public,
            mac1_key: noise::mac1_key(&public),
            cookie_key: noise::cookie_key(&public),
        }
    }
}

impl Drop for StaticKeys {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

impl std::fmt::Debug for StaticKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeys")
            .field("public", &hex::encode(&self.public[..4]))
            .finish_non_exhaustive()
    }
}

/// Handshake scratch state kept by a session until it has transport keys
#[derive(Clone)]
pub struct HandshakeScratch {
    pub noise: HandshakeState,
    pub local_ephemeral: [u8; 32],
    pub remote_ephemeral: [u8; 32],
}

impl std::fmt::Debug for HandshakeScratch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HandshakeScratch { .. }")
    }
}

impl Zeroize for HandshakeScratch {
    fn zeroize(&mut self) {
        self.noise.zeroize();
        self.local_ephemeral.zeroize();
        self.remote_ephemeral.zeroize();
    }
}

/// Compute mac1 over `message[..offset]` and compare in constant time
pub fn verify_mac1(message: &[u8], offset: usize, mac1_key: &[u8; 32]) -> Result<(), ProtocolError> {
    if message.len() < offset + blake2s::MAC_LEN {
        return Err(ProtocolError::InvalidMessageLength {
            expected: offset + blake2s::MAC_LEN,
            got: message.len(),
        });
    }
    let expected = blake2s::mac(mac1_key, &message[..offset]);
    let actual = &message[offset..offset + blake2s::MAC_LEN];
    if bool::from(expected[..].ct_eq(actual)) {
        Ok(())
    } else {
        Err(ProtocolError::MacVerificationFailed)
    }
}

/// mac2 = MAC(cookie, message[..offset])
pub fn compute_mac2(message: &[u8], offset: usize, cookie: &[u8; 16]) -> [u8; 16] {
    blake2s::mac_with_cookie(cookie, &message[..offset])
}

/// Build an initiation to `peer_public`
///
/// Returns the message with mac1 (and mac2 if a cookie is given) filled in,
/// plus the scratch state needed to consume the response.
pub fn create_initiation(
    local: &StaticKeys,
    peer_public: &[u8; 32],
    sender_index: u32,
    timestamp: &Timestamp,
    cookie: Option<&[u8; 16]>,
) -> Result<(HandshakeInitiation, HandshakeScratch), WgError> {
    let mut state = HandshakeState::new(peer_public);

    // e
    let (ephemeral_private, ephemeral_public) = x25519::generate_keypair();
    state.mix_ephemeral(&ephemeral_public);

    // es, then s
    let shared_es = x25519::dh(&ephemeral_private, peer_public)?;
    let key = state.mix_key(&shared_es);
    let encrypted_static: [u8; 48] = state
        .encrypt_and_hash(&key, &local.public)?
        .try_into()
        .map_err(|_| CryptoError::Encryption)?;

    // ss, then timestamp
    let shared_ss = x25519::dh(&local.private, peer_public)?;
    let key = state.mix_key(&shared_ss);
    let encrypted_timestamp: [u8; 28] = state
        .encrypt_and_hash(&key, timestamp)?
        .try_into()
        .map_err(|_| CryptoError::Encryption)?;

    let mut msg = HandshakeInitiation {
        sender_index,
        ephemeral_public,
        encrypted_static,
        encrypted_timestamp,
        mac1: [0u8; 16],
        mac2: [0u8; 16],
    };

    let bytes = msg.to_bytes();
    msg.mac1 = noise::compute_mac1(peer_public, &bytes[..HandshakeInitiation::MAC1_OFFSET]);
    if let Some(cookie) = cookie {
        let bytes = msg.to_bytes();
        msg.mac2 = compute_mac2(&bytes, HandshakeInitiation::MAC2_OFFSET, cookie);
    }

    tracing::trace!(sender_index, with_cookie = cookie.is_some(), "built handshake initiation");

    Ok((
        msg,
        HandshakeScratch {
            noise: state,
            local_ephemeral: ephemeral_private,
            remote_ephemeral: [0u8; 32],
        },
    ))
}

/// An initiation whose static key has been decrypted
///
/// The sender is identified but not yet authenticated: that needs the
/// timestamp to open under the static-static key.
pub struct ReceivedInitiation {
    pub peer_public: [u8; 32],
    pub sender_index: u32,
    state: HandshakeState,
    remote_ephemeral: [u8; 32],
    encrypted_timestamp: [u8; 28],
    timestamp_opened: bool,
}

impl ReceivedInitiation {
    /// Open the timestamp with DH(our static, their static)
    pub fn open_timestamp(&mut self, local: &StaticKeys) -> Result<Timestamp, WgError> {
        let shared_ss = x25519::dh(&local.private, &self.peer_public)?;
        let key = self.state.mix_key(&shared_ss);
        let plaintext = self.state.decrypt_and_hash(&key, &self.encrypted_timestamp)?;

        let timestamp: Timestamp = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Malformed { len: plaintext.len() })?;
        self.timestamp_opened = true;
        Ok(timestamp)
    }
}

impl Drop for ReceivedInitiation {
    fn drop(&mut self) {
        self.state.zeroize();
    }
}

/// Responder side: decrypt the initiator's static key
///
/// mac1 must already have been verified by the caller.
pub fn open_initiation(
    local: &StaticKeys,
    msg: &HandshakeInitiation,
) -> Result<ReceivedInitiation, WgError> {
    let mut state = HandshakeState::new(&local.public);

    state.mix_ephemeral(&msg.ephemeral_public);

    let shared_es = x25519::dh(&local.private, &msg.ephemeral_public)?;
    let key = state.mix_key(&shared_es);
    let plaintext = state.decrypt_and_hash(&key, &msg.encrypted_static)?;
    let peer_public: [u8; 32] = plaintext
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::Malformed { len: plaintext.len() })?;

    Ok(ReceivedInitiation {
        peer_public,
        sender_index: msg.sender_index,
        state,
        remote_ephemeral: msg.ephemeral_public,
        encrypted_timestamp: msg.encrypted_timestamp,
        timestamp_opened: false,
    })
}

/// Responder side: build the response and derive our transport keys
///
/// `received` must have had its timestamp opened and checked.
pub fn create_response(
    received: &mut ReceivedInitiation,
    sender_index: u32,
    psk: &[u8; 32],
    cookie: Option<&[u8; 16]>,
) -> Result<(HandshakeResponse, TransportKeys), WgError> {
    if !received.timestamp_opened {
        return Err(ProtocolError::StaleTimestamp.into());
    }
    let state = &mut received.state;

    // e
    let (ephemeral_private, ephemeral_public) = x25519::generate_keypair();
    state.mix_ephemeral(&ephemeral_public);

    // ee, se
    state.mix_chain(&x25519::dh(&ephemeral_private, &received.remote_ephemeral)?);
    state.mix_chain(&x25519::dh(&ephemeral_private, &received.peer_public)?);

    // psk, then the empty confirmation payload
    let key = state.mix_key_and_hash(psk);
    let encrypted_nothing: [u8; 16] = state
        .encrypt_and_hash(&key, &[])?
        .try_into()
        .map_err(|_| CryptoError::Encryption)?;

    let mut msg = HandshakeResponse {
        sender_index,
        receiver_index: received.sender_index,
        ephemeral_public,
        encrypted_nothing,
        mac1: [0u8; 16],
        mac2: [0u8; 16],
    };

    let bytes = msg.to_bytes();
    msg.mac1 = noise::compute_mac1(
        &received.peer_public,
        &bytes[..HandshakeResponse::MAC1_OFFSET],
    );
    if let Some(cookie) = cookie {
        let bytes = msg.to_bytes();
        msg.mac2 = compute_mac2(&bytes, HandshakeResponse::MAC2_OFFSET, cookie);
    }

    let keys = TransportKeys::derive(&state.chaining_key, false);
    state.zeroize();

    Ok((msg, keys))
}

/// Initiator side: consume the response to our initiation
///
/// mac1 must already have been verified by the caller. `scratch` is left
/// untouched on failure so a forged response cannot disturb the attempt.
pub fn consume_response(
    scratch: &HandshakeScratch,
    local: &StaticKeys,
    psk: &[u8; 32],
    msg: &HandshakeResponse,
) -> Result<TransportKeys, WgError> {
    let mut state = scratch.noise.clone();

    state.mix_ephemeral(&msg.ephemeral_public);
    state.mix_chain(&x25519::dh(&scratch.local_ephemeral, &msg.ephemeral_public)?);
    state.mix_chain(&x25519::dh(&local.private, &msg.ephemeral_public)?);

    let key = state.mix_key_and_hash(psk);
    let plaintext = state.decrypt_and_hash(&key, &msg.encrypted_nothing)?;
    if !plaintext.is_empty() {
        state.zeroize();
        return Err(CryptoError::Decryption.into());
    }

    let keys = TransportKeys::derive(&state.chaining_key, true);
    state.zeroize();
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::timestamp::TimestampGenerator;

    fn identities() -> (StaticKeys, StaticKeys) {
        let (a, _) = x25519::generate_keypair();
        let (b, _) = x25519::generate_keypair();
        (StaticKeys::new(a), StaticKeys::new(b))
    }

    fn full_handshake(psk_i: [u8; 32], psk_r: [u8; 32]) -> Result<(TransportKeys, TransportKeys), WgError> {
        let (initiator, responder) = identities();
        let ts = TimestampGenerator::new().next();

        let (init, scratch) = create_initiation(&initiator, &responder.public, 11, &ts, None)?;
        let bytes = init.to_bytes();
        verify_mac1(&bytes, HandshakeInitiation::MAC1_OFFSET, &responder.mac1_key)?;

        let mut received = open_initiation(&responder, &init)?;
        assert_eq!(received.peer_public, initiator.public);
        assert_eq!(received.open_timestamp(&responder)?, ts);

        let (resp, responder_keys) = create_response(&mut received, 22, &psk_r, None)?;
        assert_eq!(resp.receiver_index, 11);
        let bytes = resp.to_bytes();
        verify_mac1(&bytes, HandshakeResponse::MAC1_OFFSET, &initiator.mac1_key)?;

        let initiator_keys = consume_response(&scratch, &initiator, &psk_i, &resp)?;
        Ok((initiator_keys, responder_keys))
    }

    #[test]
    fn test_handshake_key_agreement() {
        let (i, r) = full_handshake([0u8; 32], [0u8; 32]).unwrap();
        assert_eq!(i.sending_key, r.receiving_key);
        assert_eq!(i.receiving_key, r.sending_key);
    }

    #[test]
    fn test_handshake_with_psk() {
        let psk = [0x42u8; 32];
        let (i, r) = full_handshake(psk, psk).unwrap();
        assert_eq!(i.sending_key, r.receiving_key);
    }

    #[test]
    fn test_psk_mismatch_fails_confirmation() {
        assert!(full_handshake([1u8; 32], [2u8; 32]).is_err());
    }

    #[test]
    fn test_initiation_mac_fields() {
        let (initiator, responder) = identities();
        let ts = TimestampGenerator::new().next();

        let (init, _) = create_initiation(&initiator, &responder.public, 1, &ts, None).unwrap();
        assert!(init.mac2.iter().all(|&b| b == 0));

        let cookie = [42u8; 16];
        let (init, _) = create_initiation(&initiator, &responder.public, 1, &ts, Some(&cookie)).unwrap();
        let bytes = init.to_bytes();
        assert_eq!(
            init.mac2,
            compute_mac2(&bytes, HandshakeInitiation::MAC2_OFFSET, &cookie)
        );
    }

    #[test]
    fn test_mac1_rejects_any_flip() {
        let (initiator, responder) = identities();
        let ts = TimestampGenerator::new().next();
        let (init, _) = create_initiation(&initiator, &responder.public, 1, &ts, None).unwrap();
        let bytes = init.to_bytes();

        for i in 0..HandshakeInitiation::MAC2_OFFSET {
            let mut tampered = bytes;
            tampered[i] ^= 0x01;
            assert!(matches!(
                verify_mac1(&tampered, HandshakeInitiation::MAC1_OFFSET, &responder.mac1_key),
                Err(ProtocolError::MacVerificationFailed)
            ));
        }

        // mac1 is keyed on the receiver, so a third party's key fails too
        assert!(verify_mac1(&bytes, HandshakeInitiation::MAC1_OFFSET, &initiator.mac1_key).is_err());
    }

    #[test]
    fn test_wrong_responder_cannot_open() {
        let (initiator, responder) = identities();
        let (other, _) = x25519::generate_keypair();
        let other = StaticKeys::new(other);
        let ts = TimestampGenerator::new().next();

        let (init, _) = create_initiation(&initiator, &responder.public, 1, &ts, None).unwrap();
        assert!(open_initiation(&other, &init).is_err());
    }

    #[test]
    fn test_response_requires_opened_timestamp() {
        let (initiator, responder) = identities();
        let ts = TimestampGenerator::new().next();
        let (init, _) = create_initiation(&initiator, &responder.public, 1, &ts, None).unwrap();

        let mut received = open_initiation(&responder, &init).unwrap();
        assert!(create_response(&mut received, 2, &[0u8; 32], None).is_err());
    }

    #[test]
    fn test_forged_response_leaves_scratch_usable() {
        let (initiator, responder) = identities();
        let ts = TimestampGenerator::new().next();
        let (init, scratch) = create_initiation(&initiator, &responder.public, 5, &ts, None).unwrap();

        let mut received = open_initiation(&responder, &init).unwrap();
        received.open_timestamp(&responder).unwrap();
        let (resp, responder_keys) = create_response(&mut received, 6, &[0u8; 32], None).unwrap();

        let mut forged = resp.clone();
        forged.encrypted_nothing[0] ^= 0x80;
        assert!(consume_response(&scratch, &initiator, &[0u8; 32], &forged).is_err());

        let keys = consume_response(&scratch, &initiator, &[0u8; 32], &resp).unwrap();
        assert_eq!(keys.sending_key, responder_keys.receiving_key);
    }
}
