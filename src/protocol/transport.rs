//! Transport layer encryption for WireGuard
//!
//! Seals and opens data messages and validates the decrypted inner IP packet.
//! Counter allocation and replay tracking belong to the session.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::crypto::aead;
use crate::error::{CryptoError, ProtocolError, WgError};
use crate::protocol::messages::TransportHeader;

/// Start a new handshake once this many messages were sent on a session
pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;

/// Hard message limit: 2^64 - 2^13 - 1
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13);

/// Plaintext is zero-padded to a multiple of this
pub const PADDING_MULTIPLE: usize = 16;

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

/// Length of `len` bytes after padding
pub fn padded_len(len: usize) -> usize {
    len.div_ceil(PADDING_MULTIPLE) * PADDING_MULTIPLE
}

/// Pad, seal and frame an inner packet
///
/// An empty `plaintext` produces a keepalive.
pub fn encrypt_packet(
    key: &[u8; 32],
    counter: u64,
    receiver_index: u32,
    plaintext: &[u8],
) -> Result<Vec<u8>, WgError> {
    let mut padded = Vec::with_capacity(padded_len(plaintext.len()));
    padded.extend_from_slice(plaintext);
    padded.resize(padded_len(plaintext.len()), 0);

    // No additional authenticated data for transport packets
    let ciphertext = aead::encrypt(key, counter, &padded, &[])?;

    Ok(TransportHeader::build_message(
        receiver_index,
        counter,
        &ciphertext,
    ))
}

/// Open the payload of a data message whose header was already parsed
pub fn decrypt_packet(
    key: &[u8; 32],
    header: &TransportHeader,
    packet: &[u8],
) -> Result<Vec<u8>, WgError> {
    if packet.len() < TransportHeader::MIN_SIZE {
        return Err(ProtocolError::InvalidMessageLength {
            expected: TransportHeader::MIN_SIZE,
            got: packet.len(),
        }
        .into());
    }

    let ciphertext = TransportHeader::payload(packet);
    if ciphertext.len() < aead::TAG_LEN {
        return Err(CryptoError::Malformed {
            len: ciphertext.len(),
        }
        .into());
    }

    Ok(aead::decrypt(key, header.counter, ciphertext, &[])?)
}

/// A decrypted, header-checked inner packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnerPacket {
    /// Empty plaintext
    Keepalive,
    /// IP packet of `len` bytes (padding excluded) from `source`
    Ip { source: IpAddr, len: usize },
}

/// Check the IP header of a decrypted payload
///
/// The version nibble picks the family; the header's own length field must
/// fit inside the decrypted bytes.
pub fn parse_inner_packet(decrypted: &[u8]) -> Result<InnerPacket, ProtocolError> {
    if decrypted.is_empty() {
        return Ok(InnerPacket::Keepalive);
    }

    match decrypted[0] >> 4 {
        4 => {
            if decrypted.len() < IPV4_HEADER_LEN {
                return Err(ProtocolError::InvalidInnerPacket);
            }
            let len = u16::from_be_bytes([decrypted[2], decrypted[3]]) as usize;
            if len < IPV4_HEADER_LEN || len > decrypted.len() {
                return Err(ProtocolError::InvalidInnerPacket);
            }
            let source = Ipv4Addr::new(decrypted[12], decrypted[13], decrypted[14], decrypted[15]);
            Ok(InnerPacket::Ip {
                source: IpAddr::V4(source),
                len,
            })
        }
        6 => {
            if decrypted.len() < IPV6_HEADER_LEN {
                return Err(ProtocolError::InvalidInnerPacket);
            }
            let payload_len = u16::from_be_bytes([decrypted[4], decrypted[5]]) as usize;
            let len = IPV6_HEADER_LEN + payload_len;
            if len > decrypted.len() {
                return Err(ProtocolError::InvalidInnerPacket);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&decrypted[8..24]);
            Ok(InnerPacket::Ip {
                source: IpAddr::V6(Ipv6Addr::from(octets)),
                len,
            })
        }
        _ => Err(ProtocolError::InvalidInnerPacket),
    }
}

/// Destination address of an outbound IP packet
pub fn destination_of(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= IPV4_HEADER_LEN => Some(IpAddr::V4(Ipv4Addr::new(
            packet[16], packet[17], packet[18], packet[19],
        ))),
        6 if packet.len() >= IPV6_HEADER_LEN => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[24..40]);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal IPv4 packet with the given addresses and total length
    pub(crate) fn ipv4_packet(src: [u8; 4], dst: [u8; 4], total_len: usize) -> Vec<u8> {
        let mut pkt = vec![0u8; total_len];
        pkt[0] = 0x45;
        pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        pkt[8] = 64;
        pkt[12..16].copy_from_slice(&src);
        pkt[16..20].copy_from_slice(&dst);
        pkt
    }

    #[test]
    fn test_padding() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 16);
        assert_eq!(padded_len(16), 16);
        assert_eq!(padded_len(20), 32);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = [42u8; 32];
        let plaintext = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2], 20);

        let encrypted = encrypt_packet(&key, 0, 12345, &plaintext).unwrap();
        assert_eq!(encrypted.len(), TransportHeader::SIZE + 32 + aead::TAG_LEN);

        let header = TransportHeader::from_bytes(&encrypted).unwrap();
        assert_eq!(header.receiver_index, 12345);

        let decrypted = decrypt_packet(&key, &header, &encrypted).unwrap();
        assert_eq!(&decrypted[..20], &plaintext[..]);
        assert!(decrypted[20..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_keepalive_is_tag_only() {
        let key = [1u8; 32];
        let msg = encrypt_packet(&key, 3, 9, &[]).unwrap();
        assert_eq!(msg.len(), TransportHeader::MIN_SIZE);

        let header = TransportHeader::from_bytes(&msg).unwrap();
        let decrypted = decrypt_packet(&key, &header, &msg).unwrap();
        assert_eq!(parse_inner_packet(&decrypted), Ok(InnerPacket::Keepalive));
    }

    #[test]
    fn test_decrypt_rejects_short_and_tampered() {
        let key = [1u8; 32];
        let mut msg = encrypt_packet(&key, 0, 1, b"abc").unwrap();
        let header = TransportHeader::from_bytes(&msg).unwrap();

        assert!(decrypt_packet(&key, &header, &msg[..TransportHeader::SIZE + 8]).is_err());

        let last = msg.len() - 1;
        msg[last] ^= 1;
        assert!(decrypt_packet(&key, &header, &msg).is_err());
    }

    #[test]
    fn test_parse_inner_ipv4() {
        let mut pkt = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2], 28);
        pkt.resize(32, 0); // padding
        assert_eq!(
            parse_inner_packet(&pkt),
            Ok(InnerPacket::Ip {
                source: "10.0.0.1".parse().unwrap(),
                len: 28
            })
        );

        // declared length beyond the decrypted bytes
        let mut bad = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2], 20);
        bad[2..4].copy_from_slice(&100u16.to_be_bytes());
        assert!(parse_inner_packet(&bad).is_err());

        assert!(parse_inner_packet(&[0x45; 10]).is_err());
    }

    #[test]
    fn test_parse_inner_ipv6_and_unknown() {
        let mut pkt = vec![0u8; 48];
        pkt[0] = 0x60;
        pkt[4..6].copy_from_slice(&8u16.to_be_bytes());
        pkt[8] = 0xfd;
        pkt[23] = 1;
        match parse_inner_packet(&pkt) {
            Ok(InnerPacket::Ip { source, len }) => {
                assert_eq!(source, "fd00::1".parse::<IpAddr>().unwrap());
                assert_eq!(len, 48);
            }
            other => panic!("unexpected {other:?}"),
        }

        pkt[5] = 9;
        assert!(parse_inner_packet(&pkt).is_err());
        assert!(parse_inner_packet(&[0x50; 40]).is_err());
    }

    #[test]
    fn test_destination_of() {
        let pkt = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 9], 20);
        assert_eq!(destination_of(&pkt), Some("10.0.0.9".parse().unwrap()));
        assert_eq!(destination_of(&[0x45, 0]), None);
        assert_eq!(destination_of(&[]), None);
    }
}
