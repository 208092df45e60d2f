//! # Registry and Import Error Types

use std::path::PathBuf;

use dprov_core::{ErrorClass, SerialNumber, Stage};
use dprov_manifest::ManifestError;
use thiserror::Error;

/// Errors talking to a registry backend.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The registry CLI could not be started.
    #[error("registry tool {program} unavailable: {source}")]
    ToolMissing {
        /// Program that was invoked.
        program: String,
        /// Spawn error.
        #[source]
        source: std::io::Error,
    },

    /// A registry call returned failure.
    #[error("registry call {operation} failed ({status}): {stderr}")]
    CommandFailed {
        /// Operation name, e.g. `create-thing`.
        operation: String,
        /// Exit status.
        status: String,
        /// Trimmed error output.
        stderr: String,
    },

    /// The named resource does not exist.
    #[error("{operation}: resource not found")]
    NotFound {
        /// Operation name.
        operation: String,
    },

    /// The resource already exists.
    #[error("{operation}: resource already exists")]
    AlreadyExists {
        /// Operation name.
        operation: String,
    },

    /// The registry answered with something unexpected.
    #[error("unexpected response from {operation}: {reason}")]
    Malformed {
        /// Operation name.
        operation: String,
        /// What was wrong.
        reason: String,
    },

    /// The certificate offered for import could not be parsed.
    #[error("certificate rejected: {0}")]
    InvalidCertificate(String),

    /// Injected or backend-specific failure.
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

impl RegistryError {
    /// Error classification.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ToolMissing { .. } => ErrorClass::Environment,
            Self::InvalidCertificate(_) => ErrorClass::Validation,
            _ => ErrorClass::Transport,
        }
    }
}

/// Errors importing manifests.
///
/// [`ImportError::Policy`] and [`ImportError::Discover`] abort the batch;
/// every other variant belongs to one device.
#[derive(Error, Debug)]
pub enum ImportError {
    /// The baseline policy could not be ensured.
    #[error("policy {policy} could not be ensured: {source}")]
    Policy {
        /// Policy name.
        policy: String,
        /// Registry failure.
        #[source]
        source: RegistryError,
    },

    /// The working directory could not be scanned.
    #[error("cannot list manifests in {}: {source}", .dir.display())]
    Discover {
        /// Directory scanned.
        dir: PathBuf,
        /// I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The manifest could not be read or did not verify.
    #[error("manifest for {serial} rejected: {source}")]
    Manifest {
        /// Serial from the manifest file name.
        serial: SerialNumber,
        /// Underlying failure.
        #[source]
        source: ManifestError,
    },

    /// The file name and signed serial disagree.
    #[error("manifest file names {file} but is signed for {signed}")]
    NameMismatch {
        /// Serial from the file name.
        file: SerialNumber,
        /// Serial in the signed payload.
        signed: SerialNumber,
    },

    /// The record was provisioned under a different signer.
    #[error("device {serial} is registered under signer {existing}, not {new}; re-run with --allow-resign to replace it")]
    SignerConflict {
        /// Device serial.
        serial: SerialNumber,
        /// Signer fingerprint on the record.
        existing: String,
        /// Signer fingerprint of this batch.
        new: String,
    },

    /// A registry call for this device failed.
    #[error("{stage} for {serial}: {source}")]
    Registry {
        /// Device serial.
        serial: SerialNumber,
        /// Stage of the failing call.
        stage: Stage,
        /// Registry failure.
        #[source]
        source: RegistryError,
    },

    /// The registry record does not match the manifest.
    #[error("record {serial} does not match manifest: {reason}")]
    Validation {
        /// Device serial.
        serial: SerialNumber,
        /// The first mismatch found.
        reason: String,
    },
}

impl ImportError {
    /// Error classification.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Policy { .. } => ErrorClass::Environment,
            Self::Discover { .. } => ErrorClass::Io,
            Self::Manifest { source, .. } => source.class(),
            Self::Registry { source, .. } => source.class(),
            Self::NameMismatch { .. } | Self::SignerConflict { .. } | Self::Validation { .. } => {
                ErrorClass::Validation
            }
        }
    }

    /// Stage at which the import failed.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Policy { .. } => Stage::Policy,
            Self::Registry { stage, .. } => *stage,
            Self::Validation { .. } => Stage::Validate,
            Self::Discover { .. }
            | Self::Manifest { .. }
            | Self::NameMismatch { .. }
            | Self::SignerConflict { .. } => Stage::Import,
        }
    }

    /// Device serial, for per-device failures.
    pub fn serial(&self) -> Option<&SerialNumber> {
        match self {
            Self::Policy { .. } | Self::Discover { .. } => None,
            Self::NameMismatch { file, .. } => Some(file),
            Self::Manifest { serial, .. }
            | Self::SignerConflict { serial, .. }
            | Self::Registry { serial, .. }
            | Self::Validation { serial, .. } => Some(serial),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dprov_core::ErrorScope;

    #[test]
    fn policy_failure_aborts_batch() {
        let e = ImportError::Policy {
            policy: "Default".into(),
            source: RegistryError::Unavailable("down".into()),
        };
        assert_eq!(e.class().scope(), ErrorScope::Pipeline);
        assert_eq!(e.stage(), Stage::Policy);
        assert!(e.serial().is_none());
    }

    #[test]
    fn validation_failure_is_per_device() {
        let e = ImportError::Validation {
            serial: SerialNumber::parse("0A0B").unwrap(),
            reason: "policy missing".into(),
        };
        assert_eq!(e.class(), ErrorClass::Validation);
        assert_eq!(e.class().scope(), ErrorScope::PerDevice);
        assert_eq!(e.stage(), Stage::Validate);
    }

    #[test]
    fn missing_tool_is_environment() {
        let e = RegistryError::ToolMissing {
            program: "aws".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(e.class(), ErrorClass::Environment);
    }
}
