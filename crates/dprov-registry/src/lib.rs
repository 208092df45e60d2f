//! # dprov-registry: Device Registry Import
//!
//! - [`registry`]: the [`Registry`] boundary and its record types.
//! - [`aws`]: AWS IoT Core through the `aws` CLI.
//! - [`memory`]: an in-process registry for tests and dry runs.
//! - [`importer`]: verifies manifests, imports them and validates the
//!   resulting records, isolating failures per device.

pub mod aws;
pub mod error;
pub mod importer;
pub mod memory;
pub mod registry;

pub use aws::{AwsCliRegistry, CommandOutput, CommandRunner, ProcessRunner, DEFAULT_REGION};
pub use error::{ImportError, RegistryError};
pub use importer::{DeviceOutcome, ImportOptions, ImportReport, Importer};
pub use memory::InMemoryRegistry;
pub use registry::{
    default_policy_document, AttachedCertificate, DeviceImport, PolicyStatus, Registry,
    RegistryRecord, DEFAULT_POLICY, SIGNER_ATTRIBUTE,
};
