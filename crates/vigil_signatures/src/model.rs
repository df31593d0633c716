//! Signature records and content hash identities.

use crate::error::SignatureError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use vigil_protocol::Severity;

/// A content hash at any of the three supported tiers. The tier is inferred
/// from the digest length, so callers can pass whatever they have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentHash {
    Sha256([u8; 32]),
    Sha1([u8; 20]),
    Md5([u8; 16]),
}

impl ContentHash {
    /// Parse a hex digest; the tier is inferred from its length
    /// (64 / 40 / 32 hex chars).
    pub fn from_hex(raw: &str) -> Result<Self, SignatureError> {
        let raw = raw.trim();
        let bytes = hex::decode(raw).map_err(|_| SignatureError::InvalidHash {
            value: raw.to_string(),
            reason: "not valid hex",
        })?;
        Self::from_bytes(&bytes).ok_or(SignatureError::InvalidHash {
            value: raw.to_string(),
            reason: "digest must be 32, 20, or 16 bytes",
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            32 => Some(ContentHash::Sha256(bytes.try_into().ok()?)),
            20 => Some(ContentHash::Sha1(bytes.try_into().ok()?)),
            16 => Some(ContentHash::Md5(bytes.try_into().ok()?)),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ContentHash::Sha256(b) => b,
            ContentHash::Sha1(b) => b,
            ContentHash::Md5(b) => b,
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// One signature record: a primary SHA-256 identity with optional secondary
/// hashes aliasing to the same record. Immutable once ingested; a new
/// ingestion of the same primary hash replaces the record wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub sha256: [u8; 32],
    pub sha1: Option<[u8; 20]>,
    pub md5: Option<[u8; 16]>,
    pub detection_name: String,
    pub family: String,
    pub severity: Severity,
    pub source: String,
    pub first_seen: DateTime<Utc>,
}

impl Signature {
    pub fn new(
        sha256: [u8; 32],
        detection_name: impl Into<String>,
        family: impl Into<String>,
        severity: Severity,
        source: impl Into<String>,
    ) -> Self {
        Self {
            sha256,
            sha1: None,
            md5: None,
            detection_name: detection_name.into(),
            family: family.into(),
            severity,
            source: source.into(),
            first_seen: Utc::now(),
        }
    }

    pub fn with_sha1(mut self, sha1: [u8; 20]) -> Self {
        self.sha1 = Some(sha1);
        self
    }

    pub fn with_md5(mut self, md5: [u8; 16]) -> Self {
        self.md5 = Some(md5);
        self
    }

    pub fn primary_hex(&self) -> String {
        hex::encode(self.sha256)
    }

    /// Every hash tier this record answers to, as raw bytes. Feeds the bloom
    /// filter: all of these must map to set bits.
    pub fn all_hashes(&self) -> Vec<Vec<u8>> {
        let mut hashes = vec![self.sha256.to_vec()];
        if let Some(sha1) = self.sha1 {
            hashes.push(sha1.to_vec());
        }
        if let Some(md5) = self.md5 {
            hashes.push(md5.to_vec());
        }
        hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_tier_inferred_from_length() {
        let sha256 = ContentHash::from_hex(&"ab".repeat(32)).unwrap();
        assert!(matches!(sha256, ContentHash::Sha256(_)));

        let sha1 = ContentHash::from_hex(&"cd".repeat(20)).unwrap();
        assert!(matches!(sha1, ContentHash::Sha1(_)));

        let md5 = ContentHash::from_hex(&"ef".repeat(16)).unwrap();
        assert!(matches!(md5, ContentHash::Md5(_)));

        assert!(ContentHash::from_hex("abcd").is_err());
        assert!(ContentHash::from_hex("not-hex").is_err());
    }

    #[test]
    fn hex_roundtrip() {
        let raw = "aa".repeat(32);
        let hash = ContentHash::from_hex(&raw).unwrap();
        assert_eq!(hash.to_hex(), raw);
    }

    #[test]
    fn all_hashes_includes_secondary_tiers() {
        let sig = Signature::new([1u8; 32], "Test.Sig", "test", Severity::High, "unit")
            .with_sha1([2u8; 20])
            .with_md5([3u8; 16]);
        let hashes = sig.all_hashes();
        assert_eq!(hashes.len(), 3);
        assert_eq!(hashes[0].len(), 32);
        assert_eq!(hashes[1].len(), 20);
        assert_eq!(hashes[2].len(), 16);
    }
}
