//! Core types for the SDUPI ledger

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 32-byte digest produced by the injected content hasher
pub type Hash = [u8; 32];

/// Unix timestamp in milliseconds
pub type Timestamp = i64;

/// Current wall-clock time in unix milliseconds
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// Convert bytes to hex string
pub fn hash_to_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

/// Convert hex string to hash
pub fn hex_to_hash(s: &str) -> Option<Hash> {
    let bytes = hex::decode(s).ok()?;
    if bytes.len() == 32 {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        Some(hash)
    } else {
        None
    }
}

/// Identifier of a DAG node, assigned at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validator identity: the validator's ed25519 public key bytes.
///
/// Ordering is bytewise, which gives committee selection its deterministic
/// tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValidatorId(pub [u8; 32]);

impl ValidatorId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short hex prefix for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for ValidatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<[u8; 32]> for ValidatorId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Opaque reference to a transaction payload owned by the submission layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadRef(pub Vec<u8>);

impl PayloadRef {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for PayloadRef {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for PayloadRef {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<Hash> for PayloadRef {
    fn from(hash: Hash) -> Self {
        Self(hash.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip_rejects_wrong_length() {
        let hash = [7u8; 32];
        assert_eq!(hex_to_hash(&hash_to_hex(&hash)), Some(hash));
        assert_eq!(hex_to_hash("abcd"), None);
        assert_eq!(hex_to_hash("not hex"), None);
    }

    #[test]
    fn test_validator_id_ordering_is_bytewise() {
        let low = ValidatorId([1u8; 32]);
        let mut high_bytes = [1u8; 32];
        high_bytes[0] = 2;
        let high = ValidatorId(high_bytes);
        assert!(low < high);
        assert_eq!(low.short(), "01010101");
    }
}
