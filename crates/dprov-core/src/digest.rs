//! # Certificate Fingerprints
//!
//! Defines [`CertFingerprint`], the SHA-256 digest of a certificate's DER
//! encoding. The registry uses the same value as its certificate identifier,
//! so comparing fingerprints is how post-import validation decides that the
//! registry holds exactly the certificate the manifest named.
//!
//! ## Security Invariant
//!
//! A `CertFingerprint` is either computed from DER bytes via
//! [`CertFingerprint::of_der`] or parsed from 64 hex digits. There is no
//! constructor from an arbitrary byte array of the wrong length.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::ValidationError;

/// Compute a raw SHA-256 digest.
pub fn sha256_raw(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// SHA-256 fingerprint of a DER-encoded certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CertFingerprint([u8; 32]);

impl CertFingerprint {
    /// Fingerprint the given certificate DER bytes.
    pub fn of_der(der: &[u8]) -> Self {
        Self(sha256_raw(der))
    }

    /// Parse a 64-digit hex fingerprint (case-insensitive).
    pub fn from_hex(s: &str) -> Result<Self, ValidationError> {
        let trimmed = s.trim();
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(trimmed, &mut bytes)
            .map_err(|_| ValidationError::InvalidFingerprint(s.to_string()))?;
        Ok(Self(bytes))
    }

    /// The raw 32 digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for CertFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for CertFingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CertFingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_of_empty_input_is_sha256_of_empty() {
        let fp = CertFingerprint::of_der(b"");
        assert_eq!(
            fp.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn hex_parse_is_case_insensitive() {
        let fp = CertFingerprint::of_der(b"device");
        let upper = fp.to_hex().to_uppercase();
        assert_eq!(CertFingerprint::from_hex(&upper).unwrap(), fp);
    }

    #[test]
    fn rejects_short_or_non_hex() {
        assert!(CertFingerprint::from_hex("abcd").is_err());
        assert!(CertFingerprint::from_hex(&"g".repeat(64)).is_err());
    }
}
