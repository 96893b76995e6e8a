//! The session id type.

use std::fmt;
use std::str::FromStr;

use ulid::Ulid;

use crate::IdError;

/// Lowercase Crockford base32 (no i, l, o, u).
const ALPHABET: &[u8; 32] = b"0123456789abcdefghjkmnpqrstvwxyz";

/// Identifier for one accepted connection.
///
/// Ids are generated at accept time and used as the correlation key for
/// every log line belonging to that connection.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId([u8; SessionId::LEN]);

impl SessionId {
    /// Number of characters in a session id.
    pub const LEN: usize = 8;

    /// Creates a new id from a fresh ULID.
    #[must_use]
    pub fn new() -> Self {
        Self::from_ulid(Ulid::new())
    }

    /// Derives an id from the last characters of a ULID.
    ///
    /// The trailing 16 characters of a ULID encode its 80 random bits, so
    /// the last 8 carry 40 bits of randomness and no timestamp.
    #[must_use]
    pub fn from_ulid(ulid: Ulid) -> Self {
        let encoded = ulid.to_string();
        let tail = &encoded.as_bytes()[encoded.len() - Self::LEN..];

        let mut bytes = [0u8; Self::LEN];
        for (dst, src) in bytes.iter_mut().zip(tail) {
            *dst = src.to_ascii_lowercase();
        }
        Self(bytes)
    }

    /// Parses an id from a string.
    ///
    /// Uppercase input is accepted and normalized to lowercase.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let char_count = s.chars().count();
        if char_count != Self::LEN {
            return Err(IdError::InvalidLength {
                expected: Self::LEN,
                actual: char_count,
            });
        }

        let mut bytes = [0u8; Self::LEN];
        for (position, (dst, c)) in bytes.iter_mut().zip(s.chars()).enumerate() {
            let lower = c.to_ascii_lowercase();
            if !lower.is_ascii() || !ALPHABET.contains(&(lower as u8)) {
                return Err(IdError::InvalidCharacter {
                    character: c,
                    position,
                });
            }
            *dst = lower as u8;
        }

        Ok(Self(bytes))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        // Only alphabet bytes are ever stored.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionId").field(&self.as_str()).finish()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl serde::Serialize for SessionId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for SessionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_session_id_shape() {
        let id = SessionId::new();
        let s = id.to_string();
        assert_eq!(s.len(), SessionId::LEN);
        assert!(s.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn test_session_id_from_ulid_uses_random_tail() {
        let ulid: Ulid = "01HV4Z2WQXKJNM8GPQY6VBKC3D".parse().unwrap();
        assert_eq!(SessionId::from_ulid(ulid).as_str(), "y6vbkc3d");
    }

    #[test]
    fn test_session_id_uppercase_normalized() {
        let id: SessionId = "Y6VBKC3D".parse().unwrap();
        assert_eq!(id.as_str(), "y6vbkc3d");
    }

    #[test]
    fn test_session_id_empty() {
        let result: Result<SessionId, _> = "".parse();
        assert!(result.unwrap_err().is_empty());
    }

    #[test]
    fn test_session_id_wrong_length() {
        let result: Result<SessionId, _> = "abc".parse();
        assert_eq!(
            result.unwrap_err(),
            IdError::InvalidLength {
                expected: 8,
                actual: 3
            }
        );
    }

    #[test]
    fn test_session_id_excluded_letter() {
        let result: Result<SessionId, _> = "abcdefgu".parse();
        assert_eq!(
            result.unwrap_err(),
            IdError::InvalidCharacter {
                character: 'u',
                position: 7
            }
        );
    }

    #[test]
    fn test_session_id_non_ascii() {
        let result: Result<SessionId, _> = "abcdéfgh".parse();
        assert!(matches!(
            result.unwrap_err(),
            IdError::InvalidCharacter { position: 4, .. }
        ));
    }

    #[test]
    fn test_session_id_json_is_plain_string() {
        let id: SessionId = "k3v9x2qd".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"k3v9x2qd\"");
        let parsed: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_session_ids_differ() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| SessionId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    proptest! {
        #[test]
        fn prop_generated_ids_parse_back(seed in any::<u128>()) {
            let id = SessionId::from_ulid(Ulid(seed));
            prop_assert_eq!(SessionId::parse(id.as_str()).unwrap(), id);
        }
    }
}
