//! Peer and connection identifiers
//!
//! Identifiers are 16-byte universally unique values. Their `Ord` is the
//! byte-lexicographic order of the raw bytes, which the routing layer relies
//! on for deterministic tie-breaks.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one peer in the network
///
/// Two peers comparing their identifiers always agree on which one is
/// "lower"; routing uses this to break ties deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerIdentifier(Uuid);

impl PeerIdentifier {
    /// Generate a fresh random identifier
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an identifier from its 16 raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get the 16 raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Short display form for logging
    pub fn short_id(&self) -> String {
        let mut s = self.0.simple().to_string();
        s.truncate(8);
        s
    }
}

impl Display for PeerIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerIdentifier {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identifies one user-facing routed connection across reconnects
///
/// The accepting side uses this to re-associate a fresh underlying link
/// with the packet connection that survived the link loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionIdentifier(Uuid);

impl ConnectionIdentifier {
    /// Generate a fresh random identifier
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an identifier from its 16 raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get the 16 raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Display for ConnectionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_bytes_roundtrip() {
        let id = PeerIdentifier::random();
        let recovered = PeerIdentifier::from_bytes(*id.as_bytes());
        assert_eq!(id, recovered);
    }

    #[test]
    fn test_identifier_ordering_is_byte_lexicographic() {
        let low = PeerIdentifier::from_bytes([0x00; 16]);
        let high = PeerIdentifier::from_bytes([0xff; 16]);
        assert!(low < high);

        let mut almost = [0x00; 16];
        almost[15] = 1;
        assert!(low < PeerIdentifier::from_bytes(almost));
    }

    #[test]
    fn test_identifier_parse() {
        let id: PeerIdentifier = "11112222-3333-4444-5555-666677778899".parse().unwrap();
        assert_eq!(
            id.as_bytes(),
            &[
                0x11, 0x11, 0x22, 0x22, 0x33, 0x33, 0x44, 0x44, 0x55, 0x55, 0x66, 0x66, 0x77,
                0x77, 0x88, 0x99
            ]
        );
    }

    #[test]
    fn test_short_id() {
        let id: PeerIdentifier = "11112222-3333-4444-5555-666677778899".parse().unwrap();
        assert_eq!(id.short_id(), "11112222");
    }
}
