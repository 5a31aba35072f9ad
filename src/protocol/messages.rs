//! WireGuard message wire formats
//!
//! Defines the packet structures for:
//! - Type 1: Handshake Initiation (148 bytes)
//! - Type 2: Handshake Response (92 bytes)
//! - Type 3: Cookie Reply (64 bytes)
//! - Type 4: Transport Data (16-byte header + sealed payload)
//!
//! Every message starts with a little-endian 32-bit type word. Parsing only
//! checks that the buffer is long enough for the type; authenticity is
//! established later by mac1 or the AEAD tag.

use crate::error::ProtocolError;

/// WireGuard message types
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    HandshakeInitiation = 1,
    HandshakeResponse = 2,
    CookieReply = 3,
    TransportData = 4,
}

impl MessageType {
    /// Minimum datagram length carrying this message type
    pub fn min_len(self) -> usize {
        match self {
            Self::HandshakeInitiation => HandshakeInitiation::SIZE,
            Self::HandshakeResponse => HandshakeResponse::SIZE,
            Self::CookieReply => CookieReply::SIZE,
            Self::TransportData => TransportHeader::SIZE,
        }
    }
}

impl TryFrom<u32> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::HandshakeInitiation),
            2 => Ok(Self::HandshakeResponse),
            3 => Ok(Self::CookieReply),
            4 => Ok(Self::TransportData),
            _ => Err(ProtocolError::InvalidMessageType { msg_type: value }),
        }
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(word)
}

fn read_array<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

fn check_header(data: &[u8], expected: MessageType) -> Result<(), ProtocolError> {
    let msg_type = get_message_type(data)?;
    if msg_type != expected {
        return Err(ProtocolError::InvalidMessageType {
            msg_type: msg_type as u32,
        });
    }
    if data.len() < expected.min_len() {
        return Err(ProtocolError::InvalidMessageLength {
            expected: expected.min_len(),
            got: data.len(),
        });
    }
    Ok(())
}

/// Handshake Initiation message (148 bytes)
///
/// ```text
/// type(4) | sender_index(4) | ephemeral_public(32) |
/// encrypted_static(48) | encrypted_timestamp(28) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInitiation {
    pub sender_index: u32,
    pub ephemeral_public: [u8; 32],
    pub encrypted_static: [u8; 48],    // 32 bytes static + 16 bytes tag
    pub encrypted_timestamp: [u8; 28], // 12 bytes TAI64N + 16 bytes tag
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeInitiation {
    /// Size of the handshake initiation message
    pub const SIZE: usize = 148;

    /// Offset of mac1: everything before it is covered by mac1
    pub const MAC1_OFFSET: usize = 116;

    /// Offset of mac2: everything before it is covered by mac2
    pub const MAC2_OFFSET: usize = 132;

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];

        buf[0..4].copy_from_slice(&(MessageType::HandshakeInitiation as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..40].copy_from_slice(&self.ephemeral_public);
        buf[40..88].copy_from_slice(&self.encrypted_static);
        buf[88..116].copy_from_slice(&self.encrypted_timestamp);
        buf[116..132].copy_from_slice(&self.mac1);
        buf[132..148].copy_from_slice(&self.mac2);

        buf
    }

    /// Parse from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_header(data, MessageType::HandshakeInitiation)?;

        Ok(Self {
            sender_index: read_u32(data, 4),
            ephemeral_public: read_array(data, 8),
            encrypted_static: read_array(data, 40),
            encrypted_timestamp: read_array(data, 88),
            mac1: read_array(data, 116),
            mac2: read_array(data, 132),
        })
    }
}

/// Handshake Response message (92 bytes)
///
/// ```text
/// type(4) | sender_index(4) | receiver_index(4) |
/// ephemeral_public(32) | encrypted_nothing(16) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub sender_index: u32,
    pub receiver_index: u32,
    pub ephemeral_public: [u8; 32],
    pub encrypted_nothing: [u8; 16], // Just the auth tag
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeResponse {
    /// Size of the handshake response message
    pub const SIZE: usize = 92;

    pub const MAC1_OFFSET: usize = 60;

    pub const MAC2_OFFSET: usize = 76;

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];

        buf[0..4].copy_from_slice(&(MessageType::HandshakeResponse as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[12..44].copy_from_slice(&self.ephemeral_public);
        buf[44..60].copy_from_slice(&self.encrypted_nothing);
        buf[60..76].copy_from_slice(&self.mac1);
        buf[76..92].copy_from_slice(&self.mac2);

        buf
    }

    /// Parse from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_header(data, MessageType::HandshakeResponse)?;

        Ok(Self {
            sender_index: read_u32(data, 4),
            receiver_index: read_u32(data, 8),
            ephemeral_public: read_array(data, 12),
            encrypted_nothing: read_array(data, 44),
            mac1: read_array(data, 60),
            mac2: read_array(data, 76),
        })
    }
}

/// Cookie Reply message (64 bytes)
///
/// ```text
/// type(4) | receiver_index(4) | nonce(24) | encrypted_cookie(32)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieReply {
    pub receiver_index: u32,
    pub nonce: [u8; 24],
    pub encrypted_cookie: [u8; 32], // 16 bytes cookie + 16 bytes tag
}

impl CookieReply {
    /// Size of the cookie reply message
    pub const SIZE: usize = 64;

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];

        buf[0..4].copy_from_slice(&(MessageType::CookieReply as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[8..32].copy_from_slice(&self.nonce);
        buf[32..64].copy_from_slice(&self.encrypted_cookie);

        buf
    }

    /// Parse from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_header(data, MessageType::CookieReply)?;

        Ok(Self {
            receiver_index: read_u32(data, 4),
            nonce: read_array(data, 8),
            encrypted_cookie: read_array(data, 32),
        })
    }
}

/// Transport Data message header (16 bytes, followed by encrypted payload)
///
/// ```text
/// type(4) | receiver_index(4) | counter(8, LE) | encrypted_packet(n+16)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    pub receiver_index: u32,
    pub counter: u64,
}

impl TransportHeader {
    /// Size of the transport header (not including encrypted payload)
    pub const SIZE: usize = 16;

    /// Minimum size of a transport message (header + at least auth tag)
    pub const MIN_SIZE: usize = Self::SIZE + 16;

    /// Build a transport message with encrypted payload
    pub fn build_message(receiver_index: u32, counter: u64, encrypted_payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE + encrypted_payload.len());

        buf.extend_from_slice(&(MessageType::TransportData as u32).to_le_bytes());
        buf.extend_from_slice(&receiver_index.to_le_bytes());
        buf.extend_from_slice(&counter.to_le_bytes());
        buf.extend_from_slice(encrypted_payload);

        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_header(data, MessageType::TransportData)?;

        Ok(Self {
            receiver_index: read_u32(data, 4),
            counter: u64::from_le_bytes(read_array(data, 8)),
        })
    }

    /// Get the encrypted payload from a transport message
    pub fn payload(data: &[u8]) -> &[u8] {
        &data[Self::SIZE..]
    }
}

/// Get the message type from a packet
pub fn get_message_type(data: &[u8]) -> Result<MessageType, ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::InvalidMessageLength {
            expected: 4,
            got: data.len(),
        });
    }
    MessageType::try_from(read_u32(data, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_initiation_layout() {
        let init = HandshakeInitiation {
            sender_index: 0x12345678,
            ephemeral_public: [1u8; 32],
            encrypted_static: [2u8; 48],
            encrypted_timestamp: [3u8; 28],
            mac1: [4u8; 16],
            mac2: [5u8; 16],
        };

        let bytes = init.to_bytes();
        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(bytes[HandshakeInitiation::MAC1_OFFSET], 4);
        assert_eq!(bytes[HandshakeInitiation::MAC2_OFFSET], 5);

        assert_eq!(HandshakeInitiation::from_bytes(&bytes).unwrap(), init);
    }

    #[test]
    fn test_handshake_response_parse() {
        let mut data = [0u8; HandshakeResponse::SIZE];
        data[0] = 2;
        data[4..8].copy_from_slice(&0x11223344u32.to_le_bytes());
        data[8..12].copy_from_slice(&0x55667788u32.to_le_bytes());

        let parsed = HandshakeResponse::from_bytes(&data).unwrap();
        assert_eq!(parsed.sender_index, 0x11223344);
        assert_eq!(parsed.receiver_index, 0x55667788);
        assert_eq!(parsed.to_bytes(), data);
    }

    #[test]
    fn test_cookie_reply_layout() {
        let reply = CookieReply {
            receiver_index: 9,
            nonce: [6u8; 24],
            encrypted_cookie: [7u8; 32],
        };
        let bytes = reply.to_bytes();
        assert_eq!(bytes.len(), CookieReply::SIZE);
        assert_eq!(bytes[0], 3);
        assert_eq!(bytes[8], 6);
        assert_eq!(bytes[32], 7);
    }

    #[test]
    fn test_transport_build() {
        let payload = vec![0xAA; 100];
        let msg = TransportHeader::build_message(42, 1234, &payload);

        assert_eq!(msg[0], 4);
        assert_eq!(msg.len(), TransportHeader::SIZE + payload.len());
        assert_eq!(&msg[8..16], &1234u64.to_le_bytes());

        let header = TransportHeader::from_bytes(&msg).unwrap();
        assert_eq!(header.receiver_index, 42);
        assert_eq!(header.counter, 1234);
        assert_eq!(TransportHeader::payload(&msg), &payload[..]);
    }

    #[test]
    fn test_truncated_messages_rejected() {
        let mut short = [0u8; HandshakeInitiation::SIZE - 1];
        short[0] = 1;
        assert!(matches!(
            HandshakeInitiation::from_bytes(&short),
            Err(ProtocolError::InvalidMessageLength { expected: 148, .. })
        ));
        assert!(get_message_type(&[4, 0, 0]).is_err());
    }

    #[test]
    fn test_invalid_message_type() {
        assert!(get_message_type(&[99u8; 100]).is_err());
        // reserved bytes are part of the type word
        assert!(get_message_type(&[1, 0, 0, 1]).is_err());
    }
}
