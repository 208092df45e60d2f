//! # Registry Importer
//!
//! Submits verified manifests to a [`Registry`] and proves each import by
//! reading the record back.
//!
//! ## Per-device sequence
//!
//! 1. Read the manifest and verify it against the signer certificate.
//! 2. Check the signed serial matches the file it came from.
//! 3. Refuse to move a record from another signer unless re-signing is
//!    allowed.
//! 4. Import: certificate, record, principal attachment, policy attachment.
//! 5. Read the record back and compare it with the manifest.
//!
//! A failure in any step is recorded against that device only. The policy
//! set-up runs once before any device and is the only step that aborts the
//! batch.
//!
//! ## Parallel import
//!
//! With `jobs > 1`, a fixed pool of scoped threads drains a shared queue.
//! Devices are keyed by distinct serial numbers, so workers share nothing but
//! the queue and the result slots. Results keep input order.

use std::collections::VecDeque;
use std::path::PathBuf;

use dprov_core::{CertFingerprint, ManifestRef, SerialNumber, Stage, WorkDir};
use dprov_crypto::CertificateInfo;
use dprov_manifest::{SignedManifest, VerifiedManifest};
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::ImportError;
use crate::registry::{
    default_policy_document, DeviceImport, PolicyStatus, Registry, RegistryRecord, DEFAULT_POLICY,
};

/// Importer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOptions {
    /// Policy ensured up front and attached to every device certificate.
    pub policy_name: String,
    /// Replace records provisioned under a different signer.
    pub allow_resign: bool,
    /// Worker threads; `1` imports sequentially.
    pub jobs: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            policy_name: DEFAULT_POLICY.to_string(),
            allow_resign: false,
            jobs: 1,
        }
    }
}

/// Result for one manifest.
#[derive(Debug)]
pub struct DeviceOutcome {
    /// Serial from the manifest file name.
    pub serial: SerialNumber,
    /// Manifest file.
    pub path: PathBuf,
    /// The validated record, or why there is none.
    pub result: Result<RegistryRecord, ImportError>,
}

/// Results of a batch, in input order.
#[derive(Debug, Default)]
pub struct ImportReport {
    /// Whether the policy was created by this batch.
    pub policy: Option<PolicyStatus>,
    /// One entry per manifest.
    pub outcomes: Vec<DeviceOutcome>,
}

impl ImportReport {
    /// Number of manifests processed.
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Whether no manifests were processed.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Successfully imported and validated records.
    pub fn succeeded(&self) -> impl Iterator<Item = &RegistryRecord> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().ok())
    }

    /// Failures, each with serial, stage and class.
    pub fn failed(&self) -> impl Iterator<Item = &ImportError> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().err())
    }

    /// Whether every manifest was imported.
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }
}

/// Imports manifests signed by one signer authority.
pub struct Importer<'a> {
    registry: &'a dyn Registry,
    signer_cert: &'a CertificateInfo,
    signer_fingerprint: CertFingerprint,
    options: ImportOptions,
    policy_document: Value,
}

impl std::fmt::Debug for Importer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Importer")
            .field("signer", &self.signer_fingerprint)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<'a> Importer<'a> {
    /// Importer for manifests signed by `signer_cert`.
    pub fn new(registry: &'a dyn Registry, signer_cert: &'a CertificateInfo) -> Self {
        Self {
            registry,
            signer_cert,
            signer_fingerprint: signer_cert.fingerprint(),
            options: ImportOptions::default(),
            policy_document: default_policy_document(),
        }
    }

    /// Override settings.
    pub fn with_options(mut self, options: ImportOptions) -> Self {
        self.options = options;
        self
    }

    /// Ensure the configured policy exists. Idempotent.
    pub fn ensure_policy(&self) -> Result<PolicyStatus, ImportError> {
        let name = &self.options.policy_name;
        let status = self
            .registry
            .ensure_policy(name, &self.policy_document)
            .map_err(|source| ImportError::Policy {
                policy: name.clone(),
                source,
            })?;
        tracing::info!(policy = %name, status = ?status, "access policy ready");
        Ok(status)
    }

    /// Discover every manifest in `work_dir` and import them.
    pub fn import_dir(&self, work_dir: &WorkDir) -> Result<ImportReport, ImportError> {
        let manifests = work_dir
            .discover_manifests()
            .map_err(|source| ImportError::Discover {
                dir: work_dir.root().to_path_buf(),
                source,
            })?;
        self.import_all(&manifests)
    }

    /// Ensure the policy, then import each manifest independently.
    ///
    /// Returns `Err` only when the batch cannot start. Per-device failures
    /// are in the report.
    pub fn import_all(&self, manifests: &[ManifestRef]) -> Result<ImportReport, ImportError> {
        let policy = self.ensure_policy()?;
        let outcomes = if self.options.jobs > 1 && manifests.len() > 1 {
            self.import_parallel(manifests)
        } else {
            manifests.iter().map(|m| self.outcome(m)).collect()
        };

        let report = ImportReport {
            policy: Some(policy),
            outcomes,
        };
        tracing::info!(
            total = report.len(),
            failed = report.failed().count(),
            "import batch finished"
        );
        Ok(report)
    }

    fn import_parallel(&self, manifests: &[ManifestRef]) -> Vec<DeviceOutcome> {
        let queue: Mutex<VecDeque<(usize, &ManifestRef)>> =
            Mutex::new(manifests.iter().enumerate().collect());
        let slots: Mutex<Vec<Option<DeviceOutcome>>> =
            Mutex::new(manifests.iter().map(|_| None).collect());
        let workers = self.options.jobs.min(manifests.len());

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let Some((index, manifest)) = queue.lock().pop_front() else {
                        break;
                    };
                    let outcome = self.outcome(manifest);
                    slots.lock()[index] = Some(outcome);
                });
            }
        });

        slots.into_inner().into_iter().flatten().collect()
    }

    fn outcome(&self, manifest: &ManifestRef) -> DeviceOutcome {
        let span = tracing::info_span!("import", serial = %manifest.serial);
        let _guard = span.enter();
        let result = self.import_one(manifest);
        match &result {
            Ok(_) => tracing::info!(path = %manifest.path.display(), "device imported and validated"),
            Err(e) => tracing::error!(stage = %e.stage(), class = %e.class(), error = %e, "device import failed"),
        }
        DeviceOutcome {
            serial: manifest.serial.clone(),
            path: manifest.path.clone(),
            result,
        }
    }

    /// Import and validate a single manifest.
    pub fn import_one(&self, manifest: &ManifestRef) -> Result<RegistryRecord, ImportError> {
        let verified = self.verify(manifest)?;
        let serial = verified.serial().clone();

        let existing = self
            .registry
            .read_record(&serial)
            .map_err(|source| ImportError::Registry {
                serial: serial.clone(),
                stage: Stage::Import,
                source,
            })?;
        self.check_signer(&serial, existing.as_ref())?;

        let import = DeviceImport {
            thing_name: serial.clone(),
            certificate_pem: verified.device_certificate_pem(),
            signer_fingerprint: self.signer_fingerprint,
            policy: self.options.policy_name.clone(),
        };
        self.registry
            .import_device(&import)
            .map_err(|source| ImportError::Registry {
                serial: serial.clone(),
                stage: Stage::Import,
                source,
            })?;

        let record = self
            .registry
            .read_record(&serial)
            .map_err(|source| ImportError::Registry {
                serial: serial.clone(),
                stage: Stage::Validate,
                source,
            })?;
        self.validate(&verified, record)
    }

    fn verify(&self, manifest: &ManifestRef) -> Result<VerifiedManifest, ImportError> {
        let rejected = |source| ImportError::Manifest {
            serial: manifest.serial.clone(),
            source,
        };
        let verified = SignedManifest::read(&manifest.path)
            .and_then(|m| m.verify(self.signer_cert))
            .map_err(rejected)?;
        if verified.serial() != &manifest.serial {
            return Err(ImportError::NameMismatch {
                file: manifest.serial.clone(),
                signed: verified.serial().clone(),
            });
        }
        Ok(verified)
    }

    fn check_signer(
        &self,
        serial: &SerialNumber,
        existing: Option<&RegistryRecord>,
    ) -> Result<(), ImportError> {
        let ours = self.signer_fingerprint.to_hex();
        match existing.and_then(RegistryRecord::signer) {
            Some(theirs) if theirs != ours => {
                if self.options.allow_resign {
                    tracing::warn!(serial = %serial, previous = theirs, "replacing signer on existing record");
                    Ok(())
                } else {
                    Err(ImportError::SignerConflict {
                        serial: serial.clone(),
                        existing: theirs.to_string(),
                        new: ours,
                    })
                }
            }
            _ => Ok(()),
        }
    }

    /// Compare what the registry holds with what the manifest specified.
    pub fn validate(
        &self,
        verified: &VerifiedManifest,
        record: Option<RegistryRecord>,
    ) -> Result<RegistryRecord, ImportError> {
        let serial = verified.serial();
        let fail = |reason: String| ImportError::Validation {
            serial: serial.clone(),
            reason,
        };

        let record = record.ok_or_else(|| fail("record absent after import".to_string()))?;
        if record.name != serial.as_str() {
            return Err(fail(format!("record name is {}", record.name)));
        }

        let expected = verified.device_fingerprint();
        let cert = record
            .certificate(&expected.to_hex())
            .ok_or_else(|| fail(format!("certificate {expected} not attached")))?;
        let stored = CertificateInfo::from_pem(cert.pem.as_bytes())
            .map_err(|e| fail(format!("stored certificate unreadable: {e}")))?;
        if stored.fingerprint() != expected {
            return Err(fail(format!(
                "stored certificate fingerprint is {}",
                stored.fingerprint()
            )));
        }
        if !cert.policies.iter().any(|p| p == &self.options.policy_name) {
            return Err(fail(format!(
                "policy {} not attached to certificate",
                self.options.policy_name
            )));
        }
        let ours = self.signer_fingerprint.to_hex();
        if record.signer() != Some(ours.as_str()) {
            return Err(fail(format!(
                "signer attribute is {:?}, expected {ours}",
                record.signer()
            )));
        }
        Ok(record)
    }
}
