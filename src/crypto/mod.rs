//! Cryptographic primitives for WireGuard
//!
//! Stateless building blocks for the protocol layer:
//! - BLAKE2s hashing, keyed MAC, HMAC and key derivation (blake2s)
//! - ChaCha20-Poly1305 / XChaCha20-Poly1305 AEAD (aead)
//! - X25519 Diffie-Hellman key exchange (x25519)
//! - Noise IKpsk2 symmetric state and transport key split (noise)
//! - Monotonic TAI64N handshake timestamps (timestamp)

pub mod aead;
pub mod blake2s;
pub mod noise;
pub mod timestamp;
pub mod x25519;
