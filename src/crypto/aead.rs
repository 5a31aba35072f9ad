//! AEAD constructions used by WireGuard
//!
//! ChaCha20-Poly1305 with a counter-derived nonce seals handshake fields and
//! transport data. XChaCha20-Poly1305 with a random 24-byte nonce is used only
//! for cookie replies.
//!
//! Opening distinguishes exactly two failures: input too short to carry a tag
//! ([`CryptoError::Malformed`]) and authentication failure
//! ([`CryptoError::Decryption`]). Callers must not try to tell more apart.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce,
};

use crate::error::CryptoError;

/// Authentication tag length
pub const TAG_LEN: usize = 16;

/// ChaCha20-Poly1305 key length
pub const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 12;

/// XChaCha20-Poly1305 nonce length
pub const XNONCE_LEN: usize = 24;

/// Nonce layout: 4 zero bytes followed by the 64-bit counter, little-endian
fn counter_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Seal `plaintext` under `key` with the nonce derived from `counter`
pub fn encrypt(
    key: &[u8; KEY_LEN],
    counter: u64,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = counter_nonce(counter);

    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

/// Open `ciphertext` (payload followed by its tag)
pub fn decrypt(
    key: &[u8; KEY_LEN],
    counter: u64,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Malformed {
            len: ciphertext.len(),
        });
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = counter_nonce(counter);

    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

/// Seal with XChaCha20-Poly1305 (cookie replies)
pub fn xencrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));

    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

/// Open with XChaCha20-Poly1305 (cookie replies)
pub fn xdecrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Malformed {
            len: ciphertext.len(),
        });
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));

    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = [3u8; 32];
        let plaintext = b"Hello, WireGuard!";
        let aad = b"additional data";

        let ciphertext = encrypt(&key, 42, plaintext, aad).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_LEN);

        let decrypted = decrypt(&key, 42, &ciphertext, aad).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_every_ciphertext_bit_flip_fails() {
        let key = [9u8; 32];
        let ciphertext = encrypt(&key, 7, b"sixteen byte msg", b"hdr").unwrap();

        for byte in 0..ciphertext.len() {
            for bit in 0..8 {
                let mut tampered = ciphertext.clone();
                tampered[byte] ^= 1 << bit;
                assert!(matches!(
                    decrypt(&key, 7, &tampered, b"hdr"),
                    Err(CryptoError::Decryption)
                ));
            }
        }
    }

    #[test]
    fn test_every_aad_bit_flip_fails() {
        let key = [9u8; 32];
        let aad = *b"associated";
        let ciphertext = encrypt(&key, 0, b"payload", &aad).unwrap();

        for byte in 0..aad.len() {
            for bit in 0..8 {
                let mut tampered = aad;
                tampered[byte] ^= 1 << bit;
                assert!(decrypt(&key, 0, &ciphertext, &tampered).is_err());
            }
        }
    }

    #[test]
    fn test_decrypt_wrong_key_or_counter() {
        let key = [0u8; 32];
        let ciphertext = encrypt(&key, 42, b"data", &[]).unwrap();

        assert!(decrypt(&[1u8; 32], 42, &ciphertext, &[]).is_err());
        assert!(decrypt(&key, 43, &ciphertext, &[]).is_err());
    }

    #[test]
    fn test_short_input_is_malformed() {
        let key = [0u8; 32];
        assert!(matches!(
            decrypt(&key, 0, &[0u8; 15], &[]),
            Err(CryptoError::Malformed { len: 15 })
        ));
        assert!(matches!(
            xdecrypt(&key, &[0u8; 24], &[], &[]),
            Err(CryptoError::Malformed { len: 0 })
        ));
    }

    #[test]
    fn test_xchacha_roundtrip_and_aad_binding() {
        let key = [5u8; 32];
        let nonce = [8u8; 24];
        let cookie = [0xC0u8; 16];

        let sealed = xencrypt(&key, &nonce, &cookie, b"mac1-a").unwrap();
        assert_eq!(sealed.len(), 32);
        assert_eq!(xdecrypt(&key, &nonce, &sealed, b"mac1-a").unwrap(), cookie);
        assert!(xdecrypt(&key, &nonce, &sealed, b"mac1-b").is_err());
    }

    #[test]
    fn test_empty_plaintext() {
        // the handshake response seals an empty payload
        let key = [0u8; 32];
        let ciphertext = encrypt(&key, 0, &[], &[]).unwrap();
        assert_eq!(ciphertext.len(), TAG_LEN);
        assert!(decrypt(&key, 0, &ciphertext, &[]).unwrap().is_empty());
    }
}
