//! # upload Subcommand
//!
//! Imports manifests into the registry. Without arguments every manifest in
//! the working directory is imported; otherwise exactly the files given.
//! Prints one `OK:` or `FAIL:` line per device and exits non-zero when any
//! device failed.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Args;

use dprov_core::layout::parse_manifest_file_name;
use dprov_core::{ManifestRef, WorkDir};
use dprov_crypto::CertificateInfo;
use dprov_registry::{ImportOptions, ImportReport, Importer, Registry};

use crate::config::ProvisionConfig;
use crate::{EXIT_FAILURE, EXIT_OK};

/// Arguments for `dprov upload`.
#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Number of devices imported concurrently.
    #[arg(long, default_value_t = 1)]
    pub jobs: usize,

    /// Replace records registered under a different signer authority.
    #[arg(long)]
    pub allow_resign: bool,

    /// Manifest files to import. Defaults to every manifest in the working directory.
    #[arg(value_name = "MANIFEST")]
    pub manifests: Vec<PathBuf>,
}

/// Execute `dprov upload`.
pub fn run_upload(
    args: &UploadArgs,
    config: &ProvisionConfig,
    registry: &dyn Registry,
) -> Result<u8> {
    let work_dir = WorkDir::new(&config.work_dir);
    let cert_path = work_dir.signer_cert_path();
    let pem = std::fs::read(&cert_path)
        .with_context(|| format!("cannot read signer certificate {}", cert_path.display()))?;
    let signer_cert = CertificateInfo::from_pem(&pem)
        .with_context(|| format!("invalid signer certificate {}", cert_path.display()))?;

    let importer = Importer::new(registry, &signer_cert).with_options(ImportOptions {
        policy_name: config.policy_name.clone(),
        allow_resign: args.allow_resign,
        jobs: args.jobs.max(1),
    });

    let report = if args.manifests.is_empty() {
        importer.import_dir(&work_dir)
    } else {
        let refs = args
            .manifests
            .iter()
            .map(|p| manifest_ref(p.as_path()))
            .collect::<Result<Vec<_>>>()?;
        importer.import_all(&refs)
    }
    .context("upload aborted")?;

    if report.is_empty() {
        println!("OK: no manifests in {}", work_dir.root().display());
        return Ok(EXIT_OK);
    }
    Ok(print_report(&report))
}

/// The manifest reference for an explicit path; the serial comes from the
/// file name.
fn manifest_ref(path: &Path) -> Result<ManifestRef> {
    let serial = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(parse_manifest_file_name)
        .ok_or_else(|| anyhow!("{} is not named <SERIAL>_manifest.json", path.display()))?;
    Ok(ManifestRef {
        serial,
        path: path.to_path_buf(),
    })
}

/// Print one line per device and a summary. Returns the exit code.
pub fn print_report(report: &ImportReport) -> u8 {
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(record) => println!("OK: {} {}", record.name, outcome.path.display()),
            Err(e) => println!(
                "FAIL: {} stage={} class={}: {e}",
                outcome.serial,
                e.stage(),
                e.class()
            ),
        }
    }
    let failed = report.failed().count();
    println!("{} imported, {failed} failed", report.len() - failed);
    if failed == 0 {
        EXIT_OK
    } else {
        EXIT_FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dprov_core::SerialNumber;
    use dprov_crypto::fixtures::FactoryCa;
    use dprov_crypto::SignerAuthority;
    use dprov_device::DeviceIdentity;
    use dprov_manifest::SignedManifest;
    use dprov_registry::InMemoryRegistry;

    struct Session {
        _dir: tempfile::TempDir,
        config: ProvisionConfig,
        work_dir: WorkDir,
        signer: SignerAuthority,
    }

    impl Session {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = ProvisionConfig {
                work_dir: dir.path().to_path_buf(),
                ..ProvisionConfig::default()
            };
            let work_dir = WorkDir::new(&config.work_dir);
            let signer = SignerAuthority::generate("AB12CD34").unwrap();
            signer.persist(&work_dir).unwrap();
            Self {
                _dir: dir,
                config,
                work_dir,
                signer,
            }
        }

        fn manifest(&self, serial: &str) -> PathBuf {
            let identity = DeviceIdentity {
                serial: SerialNumber::parse(serial).unwrap(),
                certificate_pem: FactoryCa::new().issue_device(serial).pem,
            };
            let path = self.work_dir.manifest_path(&identity.serial);
            SignedManifest::create(&identity, &self.signer)
                .unwrap()
                .write(&path)
                .unwrap();
            path
        }
    }

    fn args(manifests: Vec<PathBuf>) -> UploadArgs {
        UploadArgs {
            jobs: 1,
            allow_resign: false,
            manifests,
        }
    }

    #[test]
    fn imports_every_discovered_manifest() {
        let session = Session::new();
        session.manifest("0A01");
        session.manifest("0A02");
        let registry = InMemoryRegistry::default();
        let code = run_upload(&args(vec![]), &session.config, &registry).unwrap();
        assert_eq!(code, EXIT_OK);
        assert_eq!(registry.record_count(), 2);
    }

    #[test]
    fn explicit_list_limits_the_batch() {
        let session = Session::new();
        let first = session.manifest("0A01");
        session.manifest("0A02");
        let registry = InMemoryRegistry::default();
        run_upload(&args(vec![first]), &session.config, &registry).unwrap();
        assert_eq!(registry.record_count(), 1);
    }

    #[test]
    fn any_device_failure_sets_exit_code() {
        let session = Session::new();
        let bad = session.manifest("0A01");
        session.manifest("0A02");
        std::fs::write(&bad, b"{}").unwrap();
        let registry = InMemoryRegistry::default();
        let code = run_upload(&args(vec![]), &session.config, &registry).unwrap();
        assert_eq!(code, EXIT_FAILURE);
        assert_eq!(registry.record_count(), 1);
    }

    #[test]
    fn empty_directory_succeeds() {
        let session = Session::new();
        let registry = InMemoryRegistry::default();
        let code = run_upload(&args(vec![]), &session.config, &registry).unwrap();
        assert_eq!(code, EXIT_OK);
        assert_eq!(registry.policy_names(), ["Default"]);
    }

    #[test]
    fn badly_named_file_is_rejected() {
        let err = manifest_ref(Path::new("/tmp/device.json")).unwrap_err();
        assert!(err.to_string().contains("_manifest.json"));
        let ok = manifest_ref(Path::new("/tmp/0a0b_manifest.json")).unwrap();
        assert_eq!(ok.serial.as_str(), "0A0B");
    }
}
