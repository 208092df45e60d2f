//! # Manifest Error Types

use dprov_core::{CanonicalizationError, ErrorClass, SerialNumber, Stage, ValidationError};
use dprov_crypto::{AuthorityError, CryptoError};
use dprov_device::ChannelError;
use thiserror::Error;

/// Errors producing, reading or verifying a manifest document.
#[derive(Error, Debug)]
pub enum ManifestError {
    /// The document does not match its JSON Schema.
    #[error("{document} does not match schema:\n{}", .violations.join("\n"))]
    Schema {
        /// Which document failed (`envelope` or `payload`).
        document: &'static str,
        /// One line per violation.
        violations: Vec<String>,
    },

    /// The embedded JSON Schema could not be compiled.
    #[error("schema {name} failed to compile: {reason}")]
    SchemaBuild {
        /// Schema file name.
        name: &'static str,
        /// Compiler message.
        reason: String,
    },

    /// JSON could not be parsed or produced.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The protected header names an algorithm other than ES256.
    #[error("unsupported JWS algorithm {0:?}")]
    UnsupportedAlgorithm(String),

    /// The manifest was signed by a different authority.
    #[error("manifest signed by {found}, expected signer {expected}")]
    SignerMismatch {
        /// Thumbprint of the supplied signer certificate.
        expected: String,
        /// Thumbprint named by the manifest.
        found: String,
    },

    /// Signature or encoding failure.
    #[error("signature check failed: {0}")]
    Signature(#[source] CryptoError),

    /// The unprotected `uniqueId` differs from the signed one.
    #[error("header uniqueId {header} does not match signed uniqueId {payload}")]
    UniqueIdMismatch {
        /// Unprotected header value.
        header: SerialNumber,
        /// Signed payload value.
        payload: SerialNumber,
    },

    /// The device certificate is unusable.
    #[error("device certificate invalid: {0}")]
    DeviceCertificate(#[source] CryptoError),

    /// The JWK does not carry the device certificate's public key.
    #[error("public key set does not match the device certificate key")]
    KeyMismatch,

    /// The JWK thumbprint does not match the device certificate.
    #[error("device certificate thumbprint mismatch")]
    ThumbprintMismatch,

    /// The serial number is malformed.
    #[error(transparent)]
    Serial(#[from] ValidationError),

    /// Payload canonicalization failed.
    #[error(transparent)]
    Canonicalization(#[from] CanonicalizationError),

    /// The signer could not sign.
    #[error(transparent)]
    Authority(#[from] AuthorityError),

    /// Reading or writing the manifest file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ManifestError {
    /// Error classification.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Authority(e) => e.class(),
            Self::Io(_) => ErrorClass::Io,
            _ => ErrorClass::Validation,
        }
    }
}

/// Failure of one device's manifest build, tagged with stage and device.
#[derive(Error, Debug)]
pub enum BuildError {
    /// The device channel failed.
    #[error("{stage} on {port}: {source}")]
    Channel {
        /// Stage that failed.
        stage: Stage,
        /// Serial port of the device.
        port: String,
        /// Underlying channel error.
        #[source]
        source: ChannelError,
    },

    /// The identity was read but no manifest could be produced.
    #[error("{stage} for device {serial}: {source}")]
    Manifest {
        /// Stage that failed.
        stage: Stage,
        /// Device serial number.
        serial: SerialNumber,
        /// Underlying manifest error.
        #[source]
        source: ManifestError,
    },
}

impl BuildError {
    /// Error classification.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Channel { source, .. } => source.class(),
            Self::Manifest { source, .. } => source.class(),
        }
    }

    /// Stage at which the build failed.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Channel { stage, .. } | Self::Manifest { stage, .. } => *stage,
        }
    }

    /// Serial number, if the identity had been read.
    pub fn serial(&self) -> Option<&SerialNumber> {
        match self {
            Self::Channel { .. } => None,
            Self::Manifest { serial, .. } => Some(serial),
        }
    }
}
