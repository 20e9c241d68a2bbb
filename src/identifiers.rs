//! Type-safe identifiers.
//!
//! Newtype wrappers prevent mixing a request correlation token with a
//! listener handle or a connection ID at compile time.
//!
//! | Type | Scope | Uniqueness |
//! |------|-------|------------|
//! | [`RequestId`] | one [`Connection`](crate::Connection) | monotonic counter, never reused |
//! | [`ListenerId`] | one [`EventRegistry`](crate::EventRegistry) | monotonic counter, never reused |
//! | [`ConnectionId`] | process | random UUID, used for log correlation |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

// ============================================================================
// RequestId
// ============================================================================

/// Correlation token linking a request to its response.
///
/// Locally issued IDs come from a per-connection counter and are written as
/// decimal strings. IDs issued by the peer are opaque: the token is echoed
/// back verbatim, and numeric tokens are accepted and normalized to strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Creates a request ID from a counter value.
    #[inline]
    #[must_use]
    pub fn new(counter: u64) -> Self {
        Self(counter.to_string())
    }

    /// Returns the token as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    #[inline]
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

impl fmt::Display for RequestId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Token {
            Text(String),
            Unsigned(u64),
            Signed(i64),
        }

        Ok(match Token::deserialize(deserializer)? {
            Token::Text(text) => Self(text),
            Token::Unsigned(n) => Self(n.to_string()),
            Token::Signed(n) => Self(n.to_string()),
        })
    }
}

// ============================================================================
// ListenerId
// ============================================================================

/// Handle to a single listener registration.
///
/// The only way to cancel a specific subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    #[inline]
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw counter value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// ConnectionId
// ============================================================================

/// Identifies one transport instance in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generates a random connection ID.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_serializes_as_string() {
        let id = RequestId::new(7);
        assert_eq!(serde_json::to_string(&id).expect("serialize"), r#""7""#);
        assert_eq!(id.to_string(), "7");
    }

    #[test]
    fn test_request_id_accepts_numbers() {
        let from_number: RequestId = serde_json::from_str("42").expect("parse");
        let from_string: RequestId = serde_json::from_str(r#""42""#).expect("parse");
        assert_eq!(from_number, from_string);
    }

    #[test]
    fn test_request_id_rejects_objects() {
        assert!(serde_json::from_str::<RequestId>("{}").is_err());
        assert!(serde_json::from_str::<RequestId>("null").is_err());
    }

    #[test]
    fn test_connection_ids_differ() {
        assert_ne!(ConnectionId::generate(), ConnectionId::generate());
    }
}
