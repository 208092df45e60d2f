//! # Cryptographic Error Types
//!
//! [`CryptoError`] covers certificate parsing and signature checks; every
//! variant classifies as a validation failure of whatever document carried
//! the bad bytes. [`AuthorityError`] covers the signer authority and is fatal
//! to the whole batch, since every manifest needs the same signer.

use std::path::PathBuf;

use dprov_core::ErrorClass;
use thiserror::Error;

/// Errors from certificate and signature operations.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// PEM armour missing or malformed.
    #[error("invalid PEM: {0}")]
    InvalidPem(String),

    /// DER certificate could not be parsed.
    #[error("certificate parse error: {0}")]
    CertificateParse(String),

    /// Public key is not a valid P-256 point.
    #[error("invalid P-256 public key: {0}")]
    InvalidPublicKey(String),

    /// Signature bytes are malformed.
    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    /// Signature did not verify.
    #[error("signature verification failed")]
    VerificationFailed,

    /// Base64url decoding error.
    #[error("base64url decode error: {0}")]
    Base64(String),
}

impl CryptoError {
    /// Error classification.
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Validation
    }
}

/// Errors obtaining, loading or using the signer authority.
#[derive(Error, Debug)]
pub enum AuthorityError {
    /// The registry could not supply a registration code.
    #[error("could not obtain registration code from registry: {0}")]
    RegistrationCode(String),

    /// The registration code cannot be used as a common name.
    #[error("registration code {0:?} is not a usable common name")]
    InvalidCode(String),

    /// Key generation or certificate construction failed.
    #[error("signer certificate generation failed: {0}")]
    Generation(String),

    /// A persisted signer file is missing.
    #[error("signer file not found: {}", .0.display())]
    Missing(PathBuf),

    /// A persisted signer file could not be decoded.
    #[error("malformed signer material: {0}")]
    Malformed(String),

    /// The certificate's own key does not verify its signature, or issuer != subject.
    #[error("signer certificate is not self-signed")]
    NotSelfSigned,

    /// BasicConstraints is absent, not critical, or CA=false.
    #[error("signer certificate is not a CA certificate (critical BasicConstraints CA=true required)")]
    NotCa,

    /// Private key does not correspond to the certificate public key.
    #[error("signer private key does not match signer certificate")]
    KeyMismatch,

    /// The registry's registration code has changed since generation.
    #[error("signer is stale: certificate CN is {found:?} but registry code is {expected:?}; regenerate the signer")]
    Stale {
        /// The registry's current code.
        expected: String,
        /// The CN on the persisted certificate.
        found: String,
    },

    /// The certificate is outside its validity window.
    #[error("signer certificate not valid at {now} (valid {not_before}..{not_after}, unix seconds)")]
    Expired {
        /// Evaluation time.
        now: i64,
        /// Start of validity.
        not_before: i64,
        /// End of validity.
        not_after: i64,
    },

    /// Signing with the authority key failed.
    #[error("signing failed: {0}")]
    Signing(String),

    /// Filesystem failure persisting or reading signer files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuthorityError {
    /// Error classification.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io(_) => ErrorClass::Io,
            _ => ErrorClass::Authority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_errors_are_pipeline_fatal() {
        let e = AuthorityError::Stale {
            expected: "A".into(),
            found: "B".into(),
        };
        assert_eq!(e.class(), ErrorClass::Authority);
        assert_eq!(e.class().scope(), dprov_core::ErrorScope::Pipeline);
    }

    #[test]
    fn crypto_errors_are_validation() {
        assert_eq!(CryptoError::VerificationFailed.class(), ErrorClass::Validation);
    }
}
