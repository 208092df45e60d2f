//! # In-Memory Registry
//!
//! A [`Registry`] backed by maps behind a `parking_lot::RwLock`. Clones share
//! state. Used by tests and dry runs; it follows the same idempotence rules
//! as the cloud registry, and can be told to misbehave for a given device.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use dprov_core::{CertFingerprint, SerialNumber};
use dprov_crypto::x509::pem_to_der;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::RegistryError;
use crate::registry::{
    AttachedCertificate, DeviceImport, PolicyStatus, Registry, RegistryRecord, SIGNER_ATTRIBUTE,
};

/// Post-import corruption applied to one record, to exercise validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tamper {
    /// Detach every policy from the record's certificates.
    DetachPolicies,
    /// Overwrite the `signer` attribute.
    SignerAttribute(String),
    /// Report the record as absent.
    HideRecord,
}

#[derive(Debug, Default)]
struct Thing {
    attributes: BTreeMap<String, String>,
    principals: BTreeSet<String>,
}

#[derive(Debug)]
struct StoredCertificate {
    pem: String,
    policies: BTreeSet<String>,
}

#[derive(Debug)]
struct State {
    registration_code: String,
    endpoint: String,
    policies: BTreeMap<String, Value>,
    things: BTreeMap<String, Thing>,
    certificates: BTreeMap<String, StoredCertificate>,
    failing_imports: HashSet<String>,
    tampered: HashMap<String, Tamper>,
    policy_creations: usize,
    imports: usize,
}

/// An in-process registry. See the module docs.
#[derive(Debug, Clone)]
pub struct InMemoryRegistry {
    state: Arc<RwLock<State>>,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new("AB12CD34")
    }
}

impl InMemoryRegistry {
    /// An empty registry whose registration code is `registration_code`.
    pub fn new(registration_code: impl Into<String>) -> Self {
        Self {
            state: Arc::new(RwLock::new(State {
                registration_code: registration_code.into(),
                endpoint: "a1b2c3d4e5f6g7-ats.iot.eu-central-1.amazonaws.com".to_string(),
                policies: BTreeMap::new(),
                things: BTreeMap::new(),
                certificates: BTreeMap::new(),
                failing_imports: HashSet::new(),
                tampered: HashMap::new(),
                policy_creations: 0,
                imports: 0,
            })),
        }
    }

    /// Rotate the registration code.
    pub fn set_registration_code(&self, code: impl Into<String>) {
        self.state.write().registration_code = code.into();
    }

    /// Make every import of `serial` fail.
    pub fn fail_imports_for(&self, serial: &SerialNumber) {
        self.state.write().failing_imports.insert(serial.to_string());
    }

    /// Corrupt the record of `serial` after each import.
    pub fn tamper_after_import(&self, serial: &SerialNumber, tamper: Tamper) {
        self.state.write().tampered.insert(serial.to_string(), tamper);
    }

    /// Number of policies actually created.
    pub fn policy_creations(&self) -> usize {
        self.state.read().policy_creations
    }

    /// Names of existing policies.
    pub fn policy_names(&self) -> Vec<String> {
        self.state.read().policies.keys().cloned().collect()
    }

    /// Number of import calls received.
    pub fn import_calls(&self) -> usize {
        self.state.read().imports
    }

    /// Number of records.
    pub fn record_count(&self) -> usize {
        self.state.read().things.len()
    }
}

impl Registry for InMemoryRegistry {
    fn endpoint(&self) -> Result<String, RegistryError> {
        Ok(self.state.read().endpoint.clone())
    }

    fn registration_code(&self) -> Result<String, RegistryError> {
        Ok(self.state.read().registration_code.clone())
    }

    fn ensure_policy(&self, name: &str, document: &Value) -> Result<PolicyStatus, RegistryError> {
        let mut state = self.state.write();
        if state.policies.contains_key(name) {
            return Ok(PolicyStatus::Existing);
        }
        state.policies.insert(name.to_string(), document.clone());
        state.policy_creations += 1;
        Ok(PolicyStatus::Created)
    }

    fn import_device(&self, import: &DeviceImport) -> Result<(), RegistryError> {
        let der = pem_to_der(import.certificate_pem.as_bytes())
            .map_err(|e| RegistryError::InvalidCertificate(e.to_string()))?;
        let cert_id = CertFingerprint::of_der(&der).to_hex();
        let name = import.thing_name.to_string();

        let mut state = self.state.write();
        state.imports += 1;
        if state.failing_imports.contains(&name) {
            return Err(RegistryError::Unavailable(format!(
                "injected failure importing {name}"
            )));
        }
        if !state.policies.contains_key(&import.policy) {
            return Err(RegistryError::NotFound {
                operation: "attach-policy".to_string(),
            });
        }

        let cert = state
            .certificates
            .entry(cert_id.clone())
            .or_insert_with(|| StoredCertificate {
                pem: import.certificate_pem.clone(),
                policies: BTreeSet::new(),
            });
        cert.policies.insert(import.policy.clone());

        let thing = state.things.entry(name).or_default();
        thing.attributes.insert(
            SIGNER_ATTRIBUTE.to_string(),
            import.signer_fingerprint.to_hex(),
        );
        thing.principals.insert(cert_id);
        Ok(())
    }

    fn read_record(&self, name: &SerialNumber) -> Result<Option<RegistryRecord>, RegistryError> {
        let state = self.state.read();
        let key = name.to_string();
        let Some(thing) = state.things.get(&key) else {
            return Ok(None);
        };

        let mut record = RegistryRecord {
            name: key.clone(),
            attributes: thing.attributes.clone(),
            certificates: thing
                .principals
                .iter()
                .filter_map(|id| {
                    state.certificates.get(id).map(|c| AttachedCertificate {
                        id: id.clone(),
                        pem: c.pem.clone(),
                        policies: c.policies.iter().cloned().collect(),
                    })
                })
                .collect(),
        };

        match state.tampered.get(&key) {
            Some(Tamper::HideRecord) => return Ok(None),
            Some(Tamper::DetachPolicies) => {
                for cert in &mut record.certificates {
                    cert.policies.clear();
                }
            }
            Some(Tamper::SignerAttribute(value)) => {
                record
                    .attributes
                    .insert(SIGNER_ATTRIBUTE.to_string(), value.clone());
            }
            None => {}
        }
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{default_policy_document, DEFAULT_POLICY};
    use dprov_crypto::fixtures::FactoryCa;

    fn import(serial: &str, signer: u8) -> DeviceImport {
        DeviceImport {
            thing_name: SerialNumber::parse(serial).unwrap(),
            certificate_pem: FactoryCa::new().issue_device(serial).pem,
            signer_fingerprint: CertFingerprint::of_der(&[signer]),
            policy: DEFAULT_POLICY.to_string(),
        }
    }

    #[test]
    fn ensure_policy_is_idempotent() {
        let reg = InMemoryRegistry::default();
        let doc = default_policy_document();
        assert_eq!(reg.ensure_policy(DEFAULT_POLICY, &doc).unwrap(), PolicyStatus::Created);
        assert_eq!(reg.ensure_policy(DEFAULT_POLICY, &doc).unwrap(), PolicyStatus::Existing);
        assert_eq!(reg.policy_creations(), 1);
    }

    #[test]
    fn import_twice_yields_same_record() {
        let reg = InMemoryRegistry::default();
        reg.ensure_policy(DEFAULT_POLICY, &default_policy_document()).unwrap();
        let imp = import("0A0B", 1);
        reg.import_device(&imp).unwrap();
        let first = reg.read_record(&imp.thing_name).unwrap().unwrap();
        reg.import_device(&imp).unwrap();
        let second = reg.read_record(&imp.thing_name).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(reg.record_count(), 1);
        assert_eq!(first.certificates.len(), 1);
        assert_eq!(first.certificates[0].policies, [DEFAULT_POLICY]);
    }

    #[test]
    fn import_requires_policy() {
        let reg = InMemoryRegistry::default();
        assert!(matches!(
            reg.import_device(&import("0A0B", 1)),
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[test]
    fn reimport_with_new_signer_overwrites_attribute() {
        let reg = InMemoryRegistry::default();
        reg.ensure_policy(DEFAULT_POLICY, &default_policy_document()).unwrap();
        let mut imp = import("0A0B", 1);
        reg.import_device(&imp).unwrap();
        imp.signer_fingerprint = CertFingerprint::of_der(&[2]);
        reg.import_device(&imp).unwrap();
        let rec = reg.read_record(&imp.thing_name).unwrap().unwrap();
        assert_eq!(rec.signer(), Some(CertFingerprint::of_der(&[2]).to_hex().as_str()));
    }

    #[test]
    fn unknown_record_is_none() {
        let reg = InMemoryRegistry::default();
        assert!(reg
            .read_record(&SerialNumber::parse("FFFF").unwrap())
            .unwrap()
            .is_none());
    }
}
