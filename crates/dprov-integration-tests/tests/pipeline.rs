//! # End-to-End Provisioning Pipeline
//!
//! Signer authority, simulated secure element, manifest builder and the
//! in-memory registry wired together the way `dprov register --upload` and
//! `dprov upload` wire the real ones.

use std::time::Duration;

use dprov_core::{ErrorClass, ErrorScope, SerialNumber, Stage, WorkDir};
use dprov_crypto::fixtures::FactoryCa;
use dprov_crypto::{AuthorityError, SignerAuthority, VALIDITY_DAYS};
use dprov_device::sim::{Fault, SimulatedDevice};
use dprov_device::{ChannelError, ChannelState, ChannelTimeouts, CommandChannel};
use dprov_manifest::{ManifestBuilder, SignedManifest};
use dprov_registry::{ImportError, ImportOptions, Importer, InMemoryRegistry, Registry};

const CODE: &str = "AB12CD34";

struct Line {
    _dir: tempfile::TempDir,
    work_dir: WorkDir,
    signer: SignerAuthority,
    factory: FactoryCa,
    registry: InMemoryRegistry,
}

impl Line {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = WorkDir::new(dir.path().join("tmp"));
        work_dir.ensure().unwrap();
        let registry = InMemoryRegistry::new(CODE);
        let signer = SignerAuthority::generate_with(|| registry.registration_code()).unwrap();
        signer.persist(&work_dir).unwrap();
        Self {
            _dir: dir,
            work_dir,
            signer,
            factory: FactoryCa::new(),
            registry,
        }
    }

    fn device(&self, serial: &str) -> SimulatedDevice {
        SimulatedDevice::new(serial, self.factory.issue_device(serial).pem)
    }

    fn fast(channel: CommandChannel) -> CommandChannel {
        channel.with_timeouts(ChannelTimeouts {
            ready: Duration::from_millis(200),
            command: Duration::from_millis(200),
            poll: Duration::from_millis(10),
        })
    }

    fn register(&self, device: &SimulatedDevice, port: &str) -> dprov_core::ManifestRef {
        ManifestBuilder::new(&self.signer, &self.work_dir)
            .with_ready_timeout(Duration::from_millis(200))
            .build(Self::fast(device.channel(port)))
            .unwrap()
            .manifest_ref
    }

    fn importer(&self) -> Importer<'_> {
        Importer::new(&self.registry, self.signer.certificate())
    }
}

#[test]
fn signer_for_com7_scenario() {
    let line = Line::new();
    let cert = line.signer.certificate();

    assert_eq!(cert.subject_cn.as_deref(), Some(CODE));
    assert_eq!(cert.issuer_cn.as_deref(), Some(CODE));
    assert_eq!(cert.not_after - cert.not_before, VALIDITY_DAYS * 86_400);
    let bc = cert.basic_constraints.unwrap();
    assert!(bc.ca && bc.critical);
    assert_eq!(bc.path_len, None);
    // Uncompressed P-256 point.
    assert_eq!(cert.public_key.len(), 65);
    cert.signed_by(&cert.verifying_key().unwrap()).unwrap();

    let reloaded = SignerAuthority::load(&line.work_dir).unwrap();
    assert_eq!(reloaded.fingerprint(), line.signer.fingerprint());

    let device = line.device("0123456789ABCDEF");
    let built = ManifestBuilder::new(&line.signer, &line.work_dir)
        .build(device.channel("COM7"))
        .unwrap();
    assert_eq!(built.identity.serial.as_str(), "0123456789ABCDEF");
}

#[test]
fn register_then_upload_named_record_with_default_policy() {
    let line = Line::new();
    let device = line.device("0123456789ABCDEF");
    let manifest = line.register(&device, "COM7");

    assert_eq!(
        manifest.path.file_name().and_then(|n| n.to_str()),
        Some("0123456789ABCDEF_manifest.json")
    );
    assert_eq!(
        device.commands_received(),
        ["init", "print-chip-info", "get-device-cert"]
    );
    assert!(!device.port_open());

    let verified = SignedManifest::read(&manifest.path)
        .unwrap()
        .verify(line.signer.certificate())
        .unwrap();
    assert_eq!(verified.serial().as_str(), "0123456789ABCDEF");

    let report = line.importer().import_dir(&line.work_dir).unwrap();
    assert!(report.all_succeeded());
    let record = report.succeeded().next().unwrap();
    assert_eq!(record.name, "0123456789ABCDEF");
    assert_eq!(record.certificates.len(), 1);
    assert_eq!(record.certificates[0].policies, ["Default"]);
    assert_eq!(record.certificates[0].id, verified.device_fingerprint().to_hex());
}

#[test]
fn batch_with_one_corrupted_signature() {
    let line = Line::new();
    let serials = ["0A01", "0A02", "0A03", "0A04", "0A05"];
    let refs: Vec<_> = serials
        .iter()
        .enumerate()
        .map(|(i, s)| line.register(&line.device(s), &format!("/dev/ttyUSB{i}")))
        .collect();

    let target = &refs[1].path;
    let mut doc: serde_json::Value =
        serde_json::from_slice(&std::fs::read(target).unwrap()).unwrap();
    let sig = doc["signature"].as_str().unwrap().to_string();
    let flipped = if sig.starts_with('A') { "B" } else { "A" };
    doc["signature"] = format!("{flipped}{}", &sig[1..]).into();
    std::fs::write(target, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();

    let report = line.importer().import_dir(&line.work_dir).unwrap();
    assert_eq!(report.len(), serials.len());
    let failures: Vec<_> = report.failed().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].class(), ErrorClass::Validation);
    assert_eq!(failures[0].serial().map(SerialNumber::as_str), Some("0A02"));
    assert_eq!(report.succeeded().count(), serials.len() - 1);
    assert_eq!(line.registry.record_count(), serials.len() - 1);
}

#[test]
fn reimport_leaves_registry_unchanged() {
    let line = Line::new();
    let manifest = line.register(&line.device("0A0B0C0D"), "COM3");

    let first = line.importer().import_all(&[manifest.clone()]).unwrap();
    let after_first = line.registry.read_record(&manifest.serial).unwrap();
    let second = line.importer().import_all(&[manifest.clone()]).unwrap();
    let after_second = line.registry.read_record(&manifest.serial).unwrap();

    assert!(first.all_succeeded() && second.all_succeeded());
    assert_eq!(after_first, after_second);
    assert_eq!(line.registry.record_count(), 1);
    assert_eq!(line.registry.policy_creations(), 1);
}

#[test]
fn empty_working_directory_yields_empty_report() {
    let line = Line::new();
    let report = line.importer().import_dir(&line.work_dir).unwrap();
    assert!(report.is_empty());
}

#[test]
fn read_before_init_is_a_command_error() {
    let line = Line::new();
    let device = line.device("0A0B");
    let mut channel = Line::fast(device.channel("COM7"));
    channel.connect().unwrap();
    channel.wait_for_ready(Duration::from_millis(200)).unwrap();

    let err = channel.execute("get-device-cert").unwrap_err();
    assert!(matches!(err, ChannelError::NotInitialized { .. }));
    assert_eq!(err.class(), ErrorClass::Command);
    assert!(device.commands_received().is_empty());

    channel.init().unwrap();
    let response = channel.execute("get-device-cert").unwrap();
    assert!(response.lines.iter().any(|l| l.contains("BEGIN CERTIFICATE")));
    channel.close();
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(!device.port_open());
}

#[test]
fn device_failures_are_per_device_and_release_the_port() {
    let line = Line::new();
    let cases = [
        (Fault::NoPrompt, Stage::WaitReady, ErrorClass::Timeout),
        (Fault::InitError, Stage::Init, ErrorClass::Command),
        (Fault::StubLoadFails, Stage::Connect, ErrorClass::Transport),
        (
            Fault::Unresponsive("get-device-cert"),
            Stage::ReadIdentity,
            ErrorClass::Timeout,
        ),
    ];
    for (fault, stage, class) in cases {
        let device = line.device("0A0B").with_fault(fault);
        let err = ManifestBuilder::new(&line.signer, &line.work_dir)
            .with_ready_timeout(Duration::from_millis(100))
            .build(Line::fast(device.channel("COM7")))
            .unwrap_err();
        assert_eq!(err.stage(), stage, "{fault:?}");
        assert_eq!(err.class(), class, "{fault:?}");
        assert_eq!(err.class().scope(), ErrorScope::PerDevice);
        assert!(!device.port_open(), "{fault:?} left the port open");
    }
    assert!(line.work_dir.discover_manifests().unwrap().is_empty());
}

#[test]
fn rotated_registration_code_makes_signer_stale() {
    let line = Line::new();
    line.registry.set_registration_code("EF56AB78");
    let code = line.registry.registration_code().unwrap();
    let err = line
        .signer
        .ensure_current(&code, chrono::Utc::now().timestamp())
        .unwrap_err();
    assert!(matches!(err, AuthorityError::Stale { .. }));
    assert_eq!(err.class().scope(), ErrorScope::Pipeline);
}

#[test]
fn resign_requires_explicit_opt_in() {
    let line = Line::new();
    let device = line.device("0A0B");
    let manifest = line.register(&device, "COM7");
    line.importer().import_all(&[manifest]).unwrap();

    let replacement = SignerAuthority::generate(CODE).unwrap();
    let resigned = ManifestBuilder::new(&replacement, &line.work_dir)
        .build(Line::fast(device.channel("COM7")))
        .unwrap()
        .manifest_ref;

    let report = Importer::new(&line.registry, replacement.certificate())
        .import_all(std::slice::from_ref(&resigned))
        .unwrap();
    assert!(matches!(
        report.failed().next(),
        Some(ImportError::SignerConflict { .. })
    ));

    let report = Importer::new(&line.registry, replacement.certificate())
        .with_options(ImportOptions {
            allow_resign: true,
            ..ImportOptions::default()
        })
        .import_all(&[resigned])
        .unwrap();
    assert!(report.all_succeeded());
}

#[test]
fn parallel_upload_matches_sequential() {
    let line = Line::new();
    let serials = ["0B01", "0B02", "0B03", "0B04", "0B05", "0B06"];
    for s in serials {
        line.register(&line.device(s), "COM9");
    }
    let report = line
        .importer()
        .with_options(ImportOptions {
            jobs: 4,
            ..ImportOptions::default()
        })
        .import_dir(&line.work_dir)
        .unwrap();
    let names: Vec<_> = report.succeeded().map(|r| r.name.as_str()).collect();
    assert_eq!(names, serials);
    assert_eq!(line.registry.policy_creations(), 1);
}
