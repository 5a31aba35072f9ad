//! Noise IKpsk2 symmetric state for WireGuard
//!
//! Pattern: Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s
//!
//! [`HandshakeState`] carries the chaining key `ck` and transcript hash `h`
//! through both handshake messages. The message layouts themselves live in
//! `protocol::handshake`.

use zeroize::Zeroize;

use super::{aead, blake2s};
use crate::error::CryptoError;

/// Noise protocol construction string
pub const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";

/// WireGuard identifier string
pub const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";

/// Label for MAC1 key derivation
pub const LABEL_MAC1: &[u8] = b"mac1----";

/// Label for cookie key derivation
pub const LABEL_COOKIE: &[u8] = b"cookie--";

/// Hash length (also chaining key length)
pub const HASH_LEN: usize = 32;

/// Running `ck`/`h` pair of one handshake
#[derive(Clone)]
pub struct HandshakeState {
    /// Chaining key for key derivation
    pub chaining_key: [u8; HASH_LEN],
    /// Hash accumulator
    pub hash: [u8; HASH_LEN],
}

impl HandshakeState {
    /// ck = HASH(CONSTRUCTION)
    pub fn initial_chain_key() -> [u8; HASH_LEN] {
        blake2s::hash(CONSTRUCTION)
    }

    /// h = HASH(HASH(ck || IDENTIFIER) || responder_static_public)
    pub fn initial_hash(responder_static: &[u8; 32]) -> [u8; HASH_LEN] {
        let ck = Self::initial_chain_key();
        let h = blake2s::hash_two(&ck, IDENTIFIER);
        blake2s::hash_two(&h, responder_static)
    }

    /// Both sides start from the responder's static public key.
    pub fn new(responder_static: &[u8; 32]) -> Self {
        Self {
            chaining_key: Self::initial_chain_key(),
            hash: Self::initial_hash(responder_static),
        }
    }

    /// MixHash: h = HASH(h || data)
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.hash = blake2s::hash_two(&self.hash, data);
    }

    /// Mix an ephemeral public key: ck = KDF1(ck, e), h = HASH(h || e)
    pub fn mix_ephemeral(&mut self, ephemeral_public: &[u8; 32]) {
        self.chaining_key = blake2s::kdf1(&self.chaining_key, ephemeral_public);
        self.mix_hash(ephemeral_public);
    }

    /// ck = KDF1(ck, input) with no cipher key output
    pub fn mix_chain(&mut self, input: &[u8]) {
        self.chaining_key = blake2s::kdf1(&self.chaining_key, input);
    }

    /// MixKey: (ck, k) = KDF2(ck, input), returning k
    pub fn mix_key(&mut self, input: &[u8]) -> [u8; 32] {
        let (ck, key) = blake2s::kdf2(&self.chaining_key, input);
        self.chaining_key = ck;
        key
    }

    /// MixKeyAndHash: (ck, t, k) = KDF3(ck, psk), h = HASH(h || t), returning k
    pub fn mix_key_and_hash(&mut self, psk: &[u8; 32]) -> [u8; 32] {
        let (ck, mut temp_h, key) = blake2s::kdf3(&self.chaining_key, psk);
        self.chaining_key = ck;
        self.mix_hash(&temp_h);
        temp_h.zeroize();
        key
    }

    /// c = AEAD(k, 0, plaintext, h); h = HASH(h || c)
    pub fn encrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = aead::encrypt(key, 0, plaintext, &self.hash)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    /// p = AEAD-Open(k, 0, c, h); h = HASH(h || c)
    pub fn decrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let plaintext = aead::decrypt(key, 0, ciphertext, &self.hash)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }
}

impl Zeroize for HandshakeState {
    fn zeroize(&mut self) {
        self.chaining_key.zeroize();
        self.hash.zeroize();
    }
}

/// Transport keys derived from a completed handshake
#[derive(Clone, Default)]
pub struct TransportKeys {
    /// Key for sealing outgoing data
    pub sending_key: [u8; 32],
    /// Key for opening incoming data
    pub receiving_key: [u8; 32],
}

impl TransportKeys {
    /// Derive from the final chaining key: (T_send, T_recv) = KDF2(ck, "")
    ///
    /// The responder uses the same pair with the roles swapped.
    pub fn derive(chaining_key: &[u8; 32], is_initiator: bool) -> Self {
        let (first, second) = blake2s::kdf2(chaining_key, &[]);
        if is_initiator {
            Self {
                sending_key: first,
                receiving_key: second,
            }
        } else {
            Self {
                sending_key: second,
                receiving_key: first,
            }
        }
    }
}

impl Zeroize for TransportKeys {
    fn zeroize(&mut self) {
        self.sending_key.zeroize();
        self.receiving_key.zeroize();
    }
}

impl std::fmt::Debug for TransportKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TransportKeys { .. }")
    }
}

/// mac1_key = HASH(LABEL_MAC1 || public_key)
pub fn mac1_key(public_key: &[u8; 32]) -> [u8; 32] {
    blake2s::hash_two(LABEL_MAC1, public_key)
}

/// mac1 = MAC(HASH(LABEL_MAC1 || receiver_public), message)
pub fn compute_mac1(receiver_public: &[u8; 32], message: &[u8]) -> [u8; 16] {
    blake2s::mac(&mac1_key(receiver_public), message)
}

/// cookie_key = HASH(LABEL_COOKIE || public_key)
pub fn cookie_key(public_key: &[u8; 32]) -> [u8; 32] {
    blake2s::hash_two(LABEL_COOKIE, public_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_chain_key_vector() {
        let expected = [
            96, 226, 109, 174, 243, 39, 239, 192, 46, 195, 53, 226, 160, 37, 210, 208, 22, 235,
            66, 6, 248, 114, 119, 245, 45, 56, 209, 152, 139, 120, 205, 54,
        ];
        assert_eq!(HandshakeState::initial_chain_key(), expected);
    }

    #[test]
    fn test_identifier_hash_vector() {
        let expected = [
            34, 17, 179, 97, 8, 26, 197, 102, 105, 18, 67, 219, 69, 138, 213, 50, 45, 156, 108,
            102, 34, 147, 232, 183, 14, 225, 156, 101, 186, 7, 158, 243,
        ];
        let ck = HandshakeState::initial_chain_key();
        assert_eq!(blake2s::hash_two(&ck, IDENTIFIER), expected);
    }

    #[test]
    fn test_initial_hash_binds_responder_key() {
        assert_ne!(
            HandshakeState::initial_hash(&[0u8; 32]),
            HandshakeState::initial_hash(&[1u8; 32])
        );
    }

    #[test]
    fn test_mix_ephemeral_updates_both() {
        let mut state = HandshakeState::new(&[0u8; 32]);
        let before = state.clone();

        state.mix_ephemeral(&[7u8; 32]);
        assert_ne!(state.hash, before.hash);
        assert_ne!(state.chaining_key, before.chaining_key);
    }

    #[test]
    fn test_mix_key_and_hash_changes_hash() {
        let mut state = HandshakeState::new(&[0u8; 32]);
        let before = state.hash;

        let key = state.mix_key_and_hash(&[0u8; 32]);
        assert_ne!(state.hash, before);
        assert_ne!(key, [0u8; 32]);
    }

    #[test]
    fn test_encrypt_decrypt_and_hash() {
        let mut state1 = HandshakeState::new(&[0u8; 32]);
        let mut state2 = state1.clone();

        let key = [42u8; 32];
        let ciphertext = state1.encrypt_and_hash(&key, b"secret message").unwrap();
        let decrypted = state2.decrypt_and_hash(&key, &ciphertext).unwrap();

        assert_eq!(decrypted, b"secret message");
        assert_eq!(state1.hash, state2.hash);
    }

    #[test]
    fn test_decrypt_and_hash_failure_keeps_hash() {
        let mut state = HandshakeState::new(&[0u8; 32]);
        let before = state.hash;

        assert!(state.decrypt_and_hash(&[1u8; 32], &[0u8; 16]).is_err());
        assert_eq!(state.hash, before);
    }

    #[test]
    fn test_transport_keys_mirror() {
        let ck = [0u8; 32];

        let initiator = TransportKeys::derive(&ck, true);
        let responder = TransportKeys::derive(&ck, false);

        assert_eq!(initiator.sending_key, responder.receiving_key);
        assert_eq!(initiator.receiving_key, responder.sending_key);
        assert_ne!(initiator.sending_key, initiator.receiving_key);
    }

    #[test]
    fn test_mac1_and_cookie_keys_differ() {
        let public = [9u8; 32];
        assert_ne!(mac1_key(&public), cookie_key(&public));
        assert_eq!(
            compute_mac1(&public, b"msg"),
            blake2s::mac(&mac1_key(&public), b"msg")
        );
    }
}
