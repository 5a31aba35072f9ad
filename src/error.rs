//! Error types for the WireGuard engine
//!
//! Data-path errors never escape the handler that produced them; the device
//! logs and drops. Configuration errors are returned synchronously.

use std::net::SocketAddr;

use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum WgError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid public key for peer {peer}")]
    InvalidPublicKey { peer: String },

    #[error("Peer already configured: {peer}")]
    DuplicatePeer { peer: String },

    #[error("Peer name already in use: {name}")]
    DuplicateName { name: String },

    #[error("Unknown peer: {peer}")]
    UnknownPeer { peer: String },

    #[error("Peer name too long: {len} bytes (max {max})")]
    NameTooLong { len: usize, max: usize },

    #[error("Peer key equals the local public key")]
    SelfPeer,

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid config document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encryption,

    /// AEAD open rejected the tag
    #[error("Decryption failed: authentication failed")]
    Decryption,

    /// Input shorter than an authentication tag
    #[error("Malformed ciphertext: {len} bytes")]
    Malformed { len: usize },

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("DH computation failed")]
    DiffieHellman,
}

/// Protocol-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Handshake timeout after {seconds}s")]
    HandshakeTimeout { seconds: u64 },

    #[error("Handshake already in progress")]
    HandshakeBusy,

    #[error("Invalid message type: {msg_type}")]
    InvalidMessageType { msg_type: u32 },

    #[error("Invalid message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("MAC verification failed")]
    MacVerificationFailed,

    #[error("Cookie required: peer is under load")]
    CookieRequired,

    #[error("Replay attack detected: counter {counter} already seen or outside window")]
    ReplayDetected { counter: u64 },

    #[error("Handshake timestamp not newer than last accepted")]
    StaleTimestamp,

    #[error("Session expired")]
    SessionExpired,

    #[error("Session message limit reached")]
    MessageLimit,

    #[error("No active session")]
    NoSession,

    #[error("Session {index:#010x} in unexpected state {state}")]
    InvalidSessionState { index: u32, state: &'static str },

    #[error("Invalid receiver index: {index:#010x}")]
    InvalidSenderIndex { index: u32 },

    #[error("Unknown peer")]
    UnknownPeer,

    #[error("Invalid inner packet")]
    InvalidInnerPacket,

    #[error("Inner source address not allowed for this peer")]
    RouteMismatch,
}

/// Network-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Send to {endpoint} failed: {reason}")]
    SendFailed { endpoint: SocketAddr, reason: String },

    #[error("Endpoint not set")]
    NoEndpoint,

    #[error("No route to {destination}")]
    NoRoute { destination: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WgError {
    /// Check if the engine can carry on after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::System(_) => false,
            Self::Network(NetworkError::BindFailed { .. }) => false,

            Self::Network(_) => true,
            Self::Crypto(_) => true,
            Self::Protocol(_) => true,
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Network(_) => 3,
            Self::Protocol(_) => 4,
            Self::Crypto(_) => 5,
            Self::System(_) => 7,
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, WgError>;
