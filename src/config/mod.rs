//! Device configuration
//!
//! Typed configuration for a [`Device`](crate::device::Device): the local
//! identity, the peer set, and the protocol timing tunables. Documents are
//! JSON; keys are base64.

pub mod encoding;

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::protocol::{cookie, session, transport};

/// Longest accepted peer name, in bytes
pub const PEER_NAME_MAX_LEN: usize = 63;

/// Complete device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Our static private key
    #[serde(with = "encoding::key")]
    pub private_key: [u8; 32],
    /// UDP port to listen on (0 picks one)
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub timing: Timing,
}

/// One configured peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer's static public key
    #[serde(with = "encoding::key")]
    pub public_key: [u8; 32],
    /// Optional unique name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Optional pre-shared key (all zeros when absent)
    #[serde(default, with = "encoding::opt_key", skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<[u8; 32]>,
    /// Initial endpoint; learned from authenticated traffic otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<SocketAddr>,
    /// Inner source/destination prefixes routed to this peer
    #[serde(default)]
    pub allowed_ips: Vec<IpNet>,
}

impl PeerConfig {
    pub fn new(public_key: [u8; 32]) -> Self {
        Self {
            public_key,
            name: None,
            preshared_key: None,
            endpoint: None,
            allowed_ips: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_preshared_key(mut self, psk: [u8; 32]) -> Self {
        self.preshared_key = Some(psk);
        self
    }

    pub fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_allowed_ip(mut self, net: IpNet) -> Self {
        self.allowed_ips.push(net);
        self
    }

    /// Checks that need no device context
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(name) = &self.name {
            if name.len() > PEER_NAME_MAX_LEN {
                return Err(ConfigError::NameTooLong {
                    len: name.len(),
                    max: PEER_NAME_MAX_LEN,
                });
            }
        }
        Ok(())
    }
}

/// Protocol timers and limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    #[serde(with = "encoding::secs")]
    pub rekey_after_time: Duration,
    #[serde(with = "encoding::secs")]
    pub reject_after_time: Duration,
    #[serde(with = "encoding::secs")]
    pub rekey_attempt_time: Duration,
    #[serde(with = "encoding::secs")]
    pub rekey_timeout: Duration,
    #[serde(with = "encoding::secs")]
    pub keepalive_timeout: Duration,
    #[serde(with = "encoding::secs")]
    pub cookie_time: Duration,
    #[serde(with = "encoding::secs")]
    pub randval_time: Duration,
    /// Wait before wiping a superseded session
    #[serde(with = "encoding::secs")]
    pub session_destroy_grace: Duration,
    /// Two handshake messages of one type closer than this mark the peer
    /// as under load
    #[serde(with = "encoding::secs")]
    pub under_load_window: Duration,
    pub rekey_after_messages: u64,
    pub reject_after_messages: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            rekey_after_time: session::REKEY_AFTER_TIME,
            reject_after_time: session::REJECT_AFTER_TIME,
            rekey_attempt_time: session::REKEY_ATTEMPT_TIME,
            rekey_timeout: session::REKEY_TIMEOUT,
            keepalive_timeout: session::KEEPALIVE_TIMEOUT,
            cookie_time: cookie::COOKIE_TIME,
            randval_time: cookie::RANDVAL_TIME,
            session_destroy_grace: Duration::from_secs(1),
            under_load_window: Duration::from_secs(1),
            rekey_after_messages: transport::REKEY_AFTER_MESSAGES,
            reject_after_messages: transport::REJECT_AFTER_MESSAGES,
        }
    }
}

impl Timing {
    /// Age at which an initiator that only received asks for a new handshake
    pub fn receive_rekey_threshold(&self) -> Duration {
        self.reject_after_time
            .saturating_sub(self.keepalive_timeout)
            .saturating_sub(self.rekey_timeout)
    }
}

impl DeviceConfig {
    pub fn new(private_key: [u8; 32]) -> Self {
        Self {
            private_key,
            listen_port: 0,
            peers: Vec::new(),
            timing: Timing::default(),
        }
    }

    /// Parse a JSON document
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        for peer in &config.peers {
            peer.validate()?;
        }
        Ok(config)
    }

    /// Load a JSON document from disk
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
