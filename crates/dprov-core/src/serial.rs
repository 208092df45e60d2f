//! # Secure-Element Serial Numbers
//!
//! The serial number read from the secure element is the device's identity
//! everywhere downstream: it names the manifest file and the registry record.
//! [`SerialNumber`] normalizes the many ways a serial can be printed
//! (`01 23 45`, `01:23:45`, `012345`) into one uppercase hex form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ValidationError;

/// Maximum number of hex digits accepted (16 bytes).
const MAX_HEX_DIGITS: usize = 32;

/// A validated, uppercase-hex secure-element serial number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerialNumber(String);

impl SerialNumber {
    /// Parse and normalize a serial number.
    ///
    /// ASCII whitespace and `:` separators are removed, the remaining digits
    /// must be hex, non-empty, even in count and at most 32 long.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let digits: String = raw
            .chars()
            .filter(|c| !c.is_ascii_whitespace() && *c != ':')
            .collect();
        if digits.is_empty()
            || digits.len() % 2 != 0
            || digits.len() > MAX_HEX_DIGITS
            || !digits.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(ValidationError::InvalidSerialNumber(raw.to_string()));
        }
        Ok(Self(digits.to_ascii_uppercase()))
    }

    /// Build a serial number from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ValidationError> {
        Self::parse(&hex::encode_upper(bytes))
    }

    /// The normalized uppercase hex form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SerialNumber {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for SerialNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SerialNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
