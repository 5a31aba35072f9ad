//! serde adapters for config documents
//!
//! Keys travel as standard base64 strings, durations as whole seconds.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

use crate::error::ConfigError;

/// Decode a base64 key, naming `field` on failure
pub fn parse_key(value: &str, field: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = BASE64
        .decode(value.trim())
        .map_err(|_| ConfigError::InvalidKey {
            field: field.to_string(),
        })?;

    bytes.as_slice().try_into().map_err(|_| ConfigError::InvalidKey {
        field: field.to_string(),
    })
}

pub fn encode_key(key: &[u8; 32]) -> String {
    BASE64.encode(key)
}

pub mod key {
    use super::*;

    pub fn serialize<S: Serializer>(key: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&encode_key(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(d)?;
        parse_key(&text, "key").map_err(D::Error::custom)
    }
}

pub mod opt_key {
    use super::*;

    pub fn serialize<S: Serializer>(key: &Option<[u8; 32]>, s: S) -> Result<S::Ok, S::Error> {
        match key {
            Some(key) => s.serialize_some(&encode_key(key)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<[u8; 32]>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|text| parse_key(&text, "preshared_key").map_err(D::Error::custom))
            .transpose()
    }
}

pub mod secs {
    use std::time::Duration;

    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key() {
        let encoded = BASE64.encode([7u8; 32]);
        assert_eq!(parse_key(&encoded, "k").unwrap(), [7u8; 32]);
        assert_eq!(parse_key(&format!(" {encoded}\n"), "k").unwrap(), [7u8; 32]);
    }

    #[test]
    fn test_parse_key_rejects_bad_input() {
        assert!(matches!(
            parse_key("not base64!", "private_key"),
            Err(ConfigError::InvalidKey { field }) if field == "private_key"
        ));
        let short = BASE64.encode([1u8; 16]);
        assert!(parse_key(&short, "k").is_err());
    }
}
