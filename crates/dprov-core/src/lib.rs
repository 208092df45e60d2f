#![deny(missing_docs)]

//! # dprov-core: Foundational Types for Device Provisioning
//!
//! This crate defines the types every other crate in the workspace depends on.
//! It has no internal crate dependencies.
//!
//! ## Design Principles
//!
//! 1. **Newtype wrappers for identifiers.** A [`SerialNumber`] is validated and
//!    normalized at construction; a [`CertFingerprint`] can only be computed
//!    from certificate DER bytes. Neither can be confused with a plain string.
//!
//! 2. **[`CanonicalBytes`] is the sole path to signed JSON.** Manifest payloads
//!    are serialized with sorted keys and compact separators so that the bytes
//!    a signer signs are the bytes a verifier reads back.
//!
//! 3. **One error taxonomy.** Every crate's error type classifies itself into
//!    an [`ErrorClass`], and the class decides whether a failure is isolated
//!    to one device or aborts the whole pipeline.
//!
//! 4. **The working directory is an explicit value.** [`WorkDir`] names every
//!    file the pipeline reads or writes, and all writes go through
//!    [`write_atomic`] so readers never observe a half-written file.

pub mod canonical;
pub mod digest;
pub mod error;
pub mod layout;
pub mod serial;

// Re-export primary types at crate root for ergonomic imports.
pub use canonical::CanonicalBytes;
pub use digest::{sha256_raw, CertFingerprint};
pub use error::{CanonicalizationError, ErrorClass, ErrorScope, Stage, ValidationError};
pub use layout::{write_atomic, ManifestRef, StagedFile, WorkDir};
pub use serial::SerialNumber;
