//! # Error Taxonomy
//!
//! Provisioning chains several untrusted collaborators: a serial device, a
//! secure-element command interpreter, a local certificate authority and a
//! cloud registry. Each crate defines its own `thiserror` enum, and each of
//! those enums maps its variants onto one [`ErrorClass`].
//!
//! The class decides the blast radius of a failure:
//!
//! | Class | Scope | Operator action |
//! |---|---|---|
//! | `Environment` | pipeline | fix toolchain/credentials, rerun everything |
//! | `Authority` | pipeline | regenerate the signer, rerun the batch |
//! | `Io` | pipeline | fix the working directory |
//! | `Transport`, `Timeout` | device | check wiring, retry that device |
//! | `Command` | device | firmware/hardware mismatch |
//! | `Validation` | device | device must not be treated as provisioned |
//! | `Cancelled` | device | operator interrupted the device session |

use std::fmt;

use thiserror::Error;

/// Classification shared by every error type in the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Toolchain, credentials or configuration missing.
    Environment,
    /// The serial transport could not be opened, written or read.
    Transport,
    /// The device did not answer within the allotted time.
    Timeout,
    /// The secure element rejected a command, or a command was issued out of order.
    Command,
    /// The signing authority could not be obtained or used.
    Authority,
    /// A manifest or registry record failed verification.
    Validation,
    /// The operation was cancelled by the operator.
    Cancelled,
    /// Local filesystem failure in the session working directory.
    Io,
}

/// How far a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Isolated to one device; the rest of a batch continues.
    PerDevice,
    /// Aborts the pipeline before any (further) device is attempted.
    Pipeline,
}

impl ErrorClass {
    /// The propagation scope of this class.
    pub fn scope(self) -> ErrorScope {
        match self {
            Self::Environment | Self::Authority | Self::Io => ErrorScope::Pipeline,
            Self::Transport
            | Self::Timeout
            | Self::Command
            | Self::Validation
            | Self::Cancelled => ErrorScope::PerDevice,
        }
    }

    /// Canonical name used in reports and log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Environment => "EnvironmentError",
            Self::Transport => "TransportError",
            Self::Timeout => "TimeoutError",
            Self::Command => "CommandError",
            Self::Authority => "AuthorityError",
            Self::Validation => "ValidationError",
            Self::Cancelled => "Cancelled",
            Self::Io => "IoError",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The pipeline stage at which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Environment precondition checks.
    Environment,
    /// Signer authority generation, loading or currency check.
    Authority,
    /// Opening the serial port and uploading the command stub.
    Connect,
    /// Waiting for the command prompt.
    WaitReady,
    /// The `init` handshake.
    Init,
    /// Reading serial number and device certificate.
    ReadIdentity,
    /// Signing and persisting the manifest.
    BuildManifest,
    /// Default access policy set-up.
    Policy,
    /// Registry import.
    Import,
    /// Post-import record validation.
    Validate,
}

impl Stage {
    /// Canonical lowercase name used in reports and log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Environment => "environment",
            Self::Authority => "authority",
            Self::Connect => "connect",
            Self::WaitReady => "wait_for_ready",
            Self::Init => "init",
            Self::ReadIdentity => "read_identity",
            Self::BuildManifest => "build_manifest",
            Self::Policy => "policy",
            Self::Import => "import",
            Self::Validate => "validate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors during canonical serialization.
#[derive(Error, Debug)]
pub enum CanonicalizationError {
    /// Float values are not permitted in canonical representations.
    #[error("float values are not permitted in canonical representations: {0}")]
    FloatRejected(f64),

    /// JSON serialization failed during canonicalization.
    #[error("serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Validation errors for domain newtypes.
///
/// Each carries the rejected input and the expected format.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Serial number is not an even-length hex string of 2 to 32 digits.
    #[error("invalid serial number: \"{0}\" (expected 2-32 hex digits, even length)")]
    InvalidSerialNumber(String),

    /// Fingerprint is not 64 hex digits.
    #[error("invalid certificate fingerprint: \"{0}\" (expected 64 hex digits)")]
    InvalidFingerprint(String),
}
