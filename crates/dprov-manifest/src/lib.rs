//! # dprov-manifest: Signed Device Manifests
//!
//! A manifest binds one physical device's identity (secure-element serial
//! number and factory certificate) to the signer authority of a provisioning
//! batch. This crate defines the document ([`SignedManifest`]), its JSON
//! Schemas, signing and verification, and the [`ManifestBuilder`] that reads a
//! device over its command channel and writes the manifest file.
//!
//! ## Crate Policy
//!
//! - Payload bytes are always produced through `CanonicalBytes`.
//! - A manifest is never written unless it verifies against its signer.
//! - Verified content is only reachable through [`VerifiedManifest`].

pub mod builder;
pub mod error;
pub mod manifest;

pub use builder::{BuiltManifest, ManifestBuilder};
pub use error::{BuildError, ManifestError};
pub use manifest::{
    DeviceJwk, ManifestPayload, SignedManifest, VerifiedManifest, DEVICE_MODEL, MANIFEST_VERSION,
};
