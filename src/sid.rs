use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::EngineError;

/// A session identifier.
///
/// 16 random bytes rendered as 22 characters of url-safe unpadded base64.
/// Identifiers are opaque, unguessable and stable for the lifetime of the
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sid([u8; 16]);

impl Sid {
    pub const ZERO: Sid = Sid([0u8; 16]);

    pub fn new() -> Self {
        Sid(rand::random())
    }
}

impl Default for Sid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl FromStr for Sid {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| EngineError::InvalidSessionId)?;
        let raw: [u8; 16] = raw
            .try_into()
            .map_err(|_| EngineError::InvalidSessionId)?;
        Ok(Sid(raw))
    }
}

impl Serialize for Sid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Sid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <&str>::deserialize(deserializer)?;
        s.parse().map_err(|_| de::Error::custom("invalid session identifier"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_as_22_chars() {
        let sid = Sid::new();
        assert_eq!(sid.to_string().len(), 22);
    }

    #[test]
    fn round_trips_through_display() {
        let sid = Sid::new();
        assert_eq!(sid.to_string().parse::<Sid>().unwrap(), sid);
    }

    #[test]
    fn rejects_malformed_identifiers() {
        assert!("".parse::<Sid>().is_err());
        assert!("not/base64!".parse::<Sid>().is_err());
        // valid base64, wrong length
        assert!("aGVsbG8".parse::<Sid>().is_err());
    }

    #[test]
    fn serializes_as_a_string() {
        let sid = Sid::ZERO;
        assert_eq!(
            serde_json::to_string(&sid).unwrap(),
            format!("\"{sid}\"")
        );
    }
}
