//! BLAKE2s primitives for the WireGuard handshake
//!
//! Provides the hash, the 16-byte keyed MAC, HMAC-BLAKE2s and the
//! HKDF-style `kdf1`/`kdf2`/`kdf3` chain-key expansion.

use blake2::{
    digest::{consts::U16, FixedOutput, Mac as MacTrait, Update},
    Blake2s256, Blake2sMac, Digest,
};
use hmac::SimpleHmac;

/// RFC 2104 HMAC instantiated with BLAKE2s-256 (64-byte block)
type HmacBlake2s = SimpleHmac<Blake2s256>;

/// Length of BLAKE2s-256 hash output
pub const HASH_LEN: usize = 32;

/// Length of BLAKE2s MAC output (16 bytes for WireGuard)
pub const MAC_LEN: usize = 16;

/// BLAKE2s-256 hash of a single input
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, data);
    hasher.finalize().into()
}

/// BLAKE2s-256 hash of two concatenated inputs: HASH(a || b)
pub fn hash_two(a: &[u8], b: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, a);
    Digest::update(&mut hasher, b);
    hasher.finalize().into()
}

/// Keyed BLAKE2s over the concatenation of `parts`
///
/// Keys of 16 and 32 bytes are both within the BLAKE2s key limit.
pub fn mac_parts(key: &[u8], parts: &[&[u8]]) -> [u8; MAC_LEN] {
    let mut mac = Blake2sMac::<U16>::new_from_slice(key).expect("key within BLAKE2s limit");
    for part in parts {
        MacTrait::update(&mut mac, part);
    }
    mac.finalize_fixed().into()
}

/// BLAKE2s keyed MAC with a 32-byte key (mac1)
pub fn mac(key: &[u8; HASH_LEN], data: &[u8]) -> [u8; MAC_LEN] {
    mac_parts(key, &[data])
}

/// BLAKE2s keyed MAC with a 16-byte cookie as key (mac2)
pub fn mac_with_cookie(cookie: &[u8; MAC_LEN], data: &[u8]) -> [u8; MAC_LEN] {
    mac_parts(cookie, &[data])
}

/// HMAC-BLAKE2s: H((K ^ opad) || H((K ^ ipad) || M))
pub fn hmac(key: &[u8], data: &[u8]) -> [u8; HASH_LEN] {
    hmac_parts(key, &[data])
}

fn hmac_parts(key: &[u8], parts: &[&[u8]]) -> [u8; HASH_LEN] {
    let mut mac = HmacBlake2s::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        Update::update(&mut mac, part);
    }
    mac.finalize_fixed().into()
}

/// Expand `N` outputs from a chaining key and input key material
///
/// t0 = HMAC(key, input), t1 = HMAC(t0, 0x01), ti = HMAC(t0, t(i-1) || i)
fn expand<const N: usize>(key: &[u8; HASH_LEN], input: &[u8]) -> [[u8; HASH_LEN]; N] {
    let prk = hmac(key, input);
    let mut out = [[0u8; HASH_LEN]; N];
    let mut prev: Option<[u8; HASH_LEN]> = None;
    for (i, slot) in out.iter_mut().enumerate() {
        let counter = [i as u8 + 1];
        let next = match prev {
            None => hmac_parts(&prk, &[&counter]),
            Some(p) => hmac_parts(&prk, &[&p, &counter]),
        };
        *slot = next;
        prev = Some(next);
    }
    out
}

/// KDF1: single-output key derivation
pub fn kdf1(key: &[u8; HASH_LEN], input: &[u8]) -> [u8; HASH_LEN] {
    let [t1] = expand::<1>(key, input);
    t1
}

/// KDF2: two-output key derivation
pub fn kdf2(key: &[u8; HASH_LEN], input: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let [t1, t2] = expand::<2>(key, input);
    (t1, t2)
}

/// KDF3: three-output key derivation (pre-shared key mixing)
pub fn kdf3(
    key: &[u8; HASH_LEN],
    input: &[u8],
) -> ([u8; HASH_LEN], [u8; HASH_LEN], [u8; HASH_LEN]) {
    let [t1, t2, t3] = expand::<3>(key, input);
    (t1, t2, t3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_known_vectors() {
        // RFC 7693 Appendix B
        let abc = hash(b"abc");
        assert_eq!(
            hex::encode(abc),
            "508c5e8c327c14e2e1a72ba34eeb452f37458b209ed63a294d999b4c86675982"
        );

        let empty = hash(&[]);
        assert_eq!(
            hex::encode(empty),
            "69217a3079908094e11121d042354a7c1f55b6482ca1a51e1b250dfd1ed0eef9"
        );
    }

    #[test]
    fn test_hash_two() {
        let a = b"hello";
        let b = b"world";

        let mut combined = Vec::new();
        combined.extend_from_slice(a);
        combined.extend_from_slice(b);

        assert_eq!(hash_two(a, b), hash(&combined));
    }

    #[test]
    fn test_mac_parts_matches_concatenation() {
        let key = [7u8; 16];
        let joined = mac_with_cookie(&key, b"192.0.2.1\x00\x35");
        let split = mac_parts(&key, &[b"192.0.2.1", &[0x00, 0x35]]);
        assert_eq!(joined, split);
    }

    #[test]
    fn test_mac_depends_on_key() {
        let data = b"test data";
        assert_ne!(mac(&[0u8; 32], data), mac(&[1u8; 32], data));
    }

    #[test]
    fn test_kdf_chain_structure() {
        let key = [0u8; 32];
        let input = b"test input";

        let k1 = kdf1(&key, input);
        let (k2a, k2b) = kdf2(&key, input);
        let (k3a, k3b, k3c) = kdf3(&key, input);

        // Every output is a prefix of the longer expansions
        assert_eq!(k1, k2a);
        assert_eq!(k2a, k3a);
        assert_eq!(k2b, k3b);

        assert_ne!(k3a, k3b);
        assert_ne!(k3b, k3c);

        // Manual expansion of the second output
        let prk = hmac(&key, input);
        let mut t2_input = [0u8; HASH_LEN + 1];
        t2_input[..HASH_LEN].copy_from_slice(&k2a);
        t2_input[HASH_LEN] = 0x02;
        assert_eq!(k2b, hmac(&prk, &t2_input));
    }
}
