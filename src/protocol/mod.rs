//! WireGuard protocol implementation
//!
//! This module contains the core protocol components:
//! - Message wire formats
//! - Handshake logic (Noise IKpsk2)
//! - Cookie/DoS protection
//! - Replay window
//! - Transport encryption
//! - Session slots

pub mod cookie;
pub mod handshake;
pub mod messages;
pub mod replay;
pub mod session;
pub mod transport;

pub use cookie::{CookieIssuer, CookieState, LoadVerdict};
pub use handshake::{HandshakeScratch, StaticKeys};
pub use messages::{
    CookieReply, HandshakeInitiation, HandshakeResponse, MessageType, TransportHeader,
};
pub use replay::ReplayWindow;
pub use session::{Session, SessionGuard, SessionState};
pub use transport::InnerPacket;
