//! Common types used across IICP modules.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A 256-bit hash value (SHA3-256).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// Create a new Hash256 from bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create a zero hash.
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Get the bytes of the hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Display for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Default for Hash256 {
    fn default() -> Self {
        Self::zero()
    }
}

/// Identifies one logical exchange. Unique within its owning session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    /// Generate a fresh random correlation id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build from raw wire bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Raw wire bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies an authenticated session. The nil id marks session-less
/// traffic (handshakes and broadcasts).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a fresh random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The nil session id.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Whether this is the nil id.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Build from raw wire bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Raw wire bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::nil()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Family of transport backend an endpoint is reachable through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransportKind {
    /// Direct point-to-point stream (ordered per connection).
    Direct,
    /// Gossip/overlay broadcast mesh (unordered).
    Overlay,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Direct => write!(f, "direct"),
            TransportKind::Overlay => write!(f, "overlay"),
        }
    }
}

/// Transport family a peer asks to be reached through, announced in its
/// handshake offer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportHint {
    Direct,
    Overlay,
    /// No preference
    #[default]
    Dual,
}

impl TransportHint {
    /// The preferred family, if any.
    pub fn preferred(self) -> Option<TransportKind> {
        match self {
            TransportHint::Direct => Some(TransportKind::Direct),
            TransportHint::Overlay => Some(TransportKind::Overlay),
            TransportHint::Dual => None,
        }
    }
}

/// A reachable address for an agent on one transport family.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub kind: TransportKind,
    pub address: String,
}

impl Endpoint {
    /// Direct stream endpoint (e.g. `127.0.0.1:7400` or a memory address).
    pub fn direct(address: impl Into<String>) -> Self {
        Self {
            kind: TransportKind::Direct,
            address: address.into(),
        }
    }

    /// Overlay endpoint, addressed by the agent's overlay id.
    pub fn overlay(address: impl Into<String>) -> Self {
        Self {
            kind: TransportKind::Overlay,
            address: address.into(),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.kind, self.address)
    }
}

/// Timestamp wrapper for consistent serialization.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Get current UTC timestamp.
pub fn now() -> Timestamp {
    chrono::Utc::now()
}

/// Current time as unix milliseconds, the resolution used on the wire.
pub fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash256_zero() {
        let hash = Hash256::zero();
        assert_eq!(hash.0, [0u8; 32]);
    }

    #[test]
    fn test_hash256_hex_roundtrip() {
        let bytes = [1u8; 32];
        let hash = Hash256::new(bytes);
        let hex_str = hash.to_hex();
        let parsed = Hash256::from_hex(&hex_str).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_session_id_nil() {
        assert!(SessionId::nil().is_nil());
        assert!(!SessionId::new().is_nil());
        assert_eq!(SessionId::default(), SessionId::nil());
    }

    #[test]
    fn test_correlation_id_bytes() {
        let id = CorrelationId::new();
        assert_eq!(CorrelationId::from_bytes(*id.as_bytes()), id);
    }

    #[test]
    fn test_now_millis_is_recent() {
        // 2020-01-01 in unix ms
        assert!(now_millis() > 1_577_836_800_000);
    }
}
