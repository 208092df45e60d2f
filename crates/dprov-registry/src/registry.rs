//! # Registry Boundary
//!
//! The operations the pipeline consumes from a cloud device registry. A
//! record ("thing") is named after the device serial number, carries the
//! signer fingerprint as an attribute, and has the device certificate
//! attached as a principal with the access policy attached to that
//! certificate.

use std::collections::BTreeMap;

use dprov_core::{CertFingerprint, SerialNumber};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::RegistryError;

/// Name of the baseline access policy.
pub const DEFAULT_POLICY: &str = "Default";

/// Record attribute holding the signer certificate fingerprint.
pub const SIGNER_ATTRIBUTE: &str = "signer";

/// The baseline policy: every IoT action on every resource.
pub fn default_policy_document() -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Action": "iot:*",
                "Resource": "*"
            }
        ]
    })
}

/// Outcome of [`Registry::ensure_policy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyStatus {
    /// The policy was created by this call.
    Created,
    /// The policy already existed and was left unchanged.
    Existing,
}

/// What to create or update for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceImport {
    /// Record name.
    pub thing_name: SerialNumber,
    /// Device certificate, PEM.
    pub certificate_pem: String,
    /// Signer authority that vouched for this device.
    pub signer_fingerprint: CertFingerprint,
    /// Policy to attach to the device certificate.
    pub policy: String,
}

/// A certificate attached to a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedCertificate {
    /// Registry certificate id (SHA-256 of the DER, lowercase hex).
    pub id: String,
    /// Certificate PEM as stored by the registry.
    pub pem: String,
    /// Policies attached to the certificate, sorted.
    pub policies: Vec<String>,
}

/// A device record as the registry reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRecord {
    /// Record name.
    pub name: String,
    /// Record attributes.
    pub attributes: BTreeMap<String, String>,
    /// Attached certificates, sorted by id.
    pub certificates: Vec<AttachedCertificate>,
}

impl RegistryRecord {
    /// The attached certificate with `id`.
    pub fn certificate(&self, id: &str) -> Option<&AttachedCertificate> {
        self.certificates.iter().find(|c| c.id == id)
    }

    /// The `signer` attribute.
    pub fn signer(&self) -> Option<&str> {
        self.attributes.get(SIGNER_ATTRIBUTE).map(String::as_str)
    }
}

/// A cloud device registry.
///
/// Every mutating operation is idempotent: repeating it with the same input
/// leaves the registry unchanged.
pub trait Registry: Send + Sync {
    /// Data endpoint of the account. Succeeds only when the registry is
    /// reachable and the caller is authenticated.
    fn endpoint(&self) -> Result<String, RegistryError>;

    /// The account's current registration code.
    fn registration_code(&self) -> Result<String, RegistryError>;

    /// Create policy `name` with `document` unless it exists.
    fn ensure_policy(&self, name: &str, document: &Value) -> Result<PolicyStatus, RegistryError>;

    /// Register the certificate, create or update the record, attach the
    /// certificate to the record and the policy to the certificate.
    fn import_device(&self, import: &DeviceImport) -> Result<(), RegistryError>;

    /// Read back a record, `None` if absent.
    fn read_record(&self, name: &SerialNumber) -> Result<Option<RegistryRecord>, RegistryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_allows_all_iot_actions() {
        let doc = default_policy_document();
        assert_eq!(doc["Statement"][0]["Action"], "iot:*");
        assert_eq!(doc["Statement"][0]["Resource"], "*");
        assert_eq!(doc["Statement"][0]["Effect"], "Allow");
    }

    #[test]
    fn record_lookup_helpers() {
        let record = RegistryRecord {
            name: "0A0B".into(),
            attributes: BTreeMap::from([(SIGNER_ATTRIBUTE.to_string(), "ab".to_string())]),
            certificates: vec![AttachedCertificate {
                id: "cd".into(),
                pem: String::new(),
                policies: vec![DEFAULT_POLICY.into()],
            }],
        };
        assert_eq!(record.signer(), Some("ab"));
        assert!(record.certificate("cd").is_some());
        assert!(record.certificate("ef").is_none());
    }
}
