//! # AWS IoT Registry via the AWS CLI
//!
//! Every call is `aws iot <operation> ... --region <region> --output json`,
//! executed through a [`CommandRunner`] so tests can script responses.
//!
//! Idempotence is built from the CLI's error codes: `ResourceNotFoundException`
//! means "create it", `ResourceAlreadyExistsException` means "someone already
//! did". The certificate id AWS assigns is the SHA-256 of the DER encoding, so
//! an already-registered certificate can be found again without listing.

use std::collections::BTreeMap;
use std::io;
use std::process::Command;

use dprov_core::{CertFingerprint, SerialNumber};
use dprov_crypto::x509::pem_to_der;
use serde_json::{json, Value};

use crate::error::RegistryError;
use crate::registry::{
    AttachedCertificate, DeviceImport, PolicyStatus, Registry, RegistryRecord, SIGNER_ATTRIBUTE,
};

/// Default region.
pub const DEFAULT_REGION: &str = "eu-central-1";

/// Captured result of one external command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code, `None` if killed by a signal.
    pub code: Option<i32>,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with `stderr`.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs external programs.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` and capture its output.
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;
}

/// Runs programs as child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// AWS IoT Core through the `aws` CLI.
pub struct AwsCliRegistry {
    program: String,
    region: String,
    runner: Box<dyn CommandRunner>,
}

impl std::fmt::Debug for AwsCliRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCliRegistry")
            .field("program", &self.program)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl AwsCliRegistry {
    /// Registry using `program` in `region`, spawning real processes.
    pub fn new(program: impl Into<String>, region: impl Into<String>) -> Self {
        Self::with_runner(program, region, Box::new(ProcessRunner))
    }

    /// Registry using a custom runner.
    pub fn with_runner(
        program: impl Into<String>,
        region: impl Into<String>,
        runner: Box<dyn CommandRunner>,
    ) -> Self {
        Self {
            program: program.into(),
            region: region.into(),
            runner,
        }
    }

    /// Region all calls are scoped to.
    pub fn region(&self) -> &str {
        &self.region
    }

    fn call(&self, operation: &str, args: &[&str]) -> Result<Value, RegistryError> {
        let mut argv: Vec<String> = Vec::with_capacity(args.len() + 6);
        argv.push("iot".to_string());
        argv.push(operation.to_string());
        argv.extend(args.iter().map(|a| a.to_string()));
        argv.extend(
            ["--region", self.region.as_str(), "--output", "json"]
                .iter()
                .map(|a| a.to_string()),
        );

        tracing::debug!(operation, region = %self.region, "registry call");
        let output = self
            .runner
            .run(&self.program, &argv)
            .map_err(|source| RegistryError::ToolMissing {
                program: self.program.clone(),
                source,
            })?;

        if !output.success() {
            let stderr = output.stderr.trim().to_string();
            return Err(if stderr.contains("ResourceNotFoundException") {
                RegistryError::NotFound {
                    operation: operation.to_string(),
                }
            } else if stderr.contains("ResourceAlreadyExistsException") {
                RegistryError::AlreadyExists {
                    operation: operation.to_string(),
                }
            } else {
                RegistryError::CommandFailed {
                    operation: operation.to_string(),
                    status: output
                        .code
                        .map_or_else(|| "signal".to_string(), |c| format!("exit {c}")),
                    stderr,
                }
            });
        }

        if output.stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&output.stdout).map_err(|e| RegistryError::Malformed {
            operation: operation.to_string(),
            reason: e.to_string(),
        })
    }

    fn string_field(value: &Value, operation: &str, pointer: &str) -> Result<String, RegistryError> {
        value
            .pointer(pointer)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RegistryError::Malformed {
                operation: operation.to_string(),
                reason: format!("missing {pointer}"),
            })
    }

    fn register_certificate(&self, pem: &str, cert_id: &str) -> Result<String, RegistryError> {
        match self.call(
            "register-certificate-without-ca",
            &["--certificate-pem", pem, "--status", "ACTIVE"],
        ) {
            Ok(v) => Self::string_field(&v, "register-certificate-without-ca", "/certificateArn"),
            Err(RegistryError::AlreadyExists { .. }) => {
                tracing::debug!(certificate = cert_id, "certificate already registered");
                let v = self.call("describe-certificate", &["--certificate-id", cert_id])?;
                Self::string_field(
                    &v,
                    "describe-certificate",
                    "/certificateDescription/certificateArn",
                )
            }
            Err(e) => Err(e),
        }
    }

    fn upsert_thing(&self, name: &str, signer: &str) -> Result<(), RegistryError> {
        match self.call("describe-thing", &["--thing-name", name]) {
            Ok(_) => {
                let payload = json!({ "attributes": { SIGNER_ATTRIBUTE: signer }, "merge": true });
                self.call(
                    "update-thing",
                    &["--thing-name", name, "--attribute-payload", &payload.to_string()],
                )?;
            }
            Err(RegistryError::NotFound { .. }) => {
                let payload = json!({ "attributes": { SIGNER_ATTRIBUTE: signer } });
                match self.call(
                    "create-thing",
                    &["--thing-name", name, "--attribute-payload", &payload.to_string()],
                ) {
                    Ok(_) | Err(RegistryError::AlreadyExists { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn attached_certificate(&self, arn: &str) -> Result<Option<AttachedCertificate>, RegistryError> {
        let Some(id) = certificate_id_from_arn(arn) else {
            return Ok(None);
        };
        let desc = self.call("describe-certificate", &["--certificate-id", id])?;
        let pem = Self::string_field(
            &desc,
            "describe-certificate",
            "/certificateDescription/certificatePem",
        )?;
        let policies = self.call("list-attached-policies", &["--target", arn])?;
        let mut names: Vec<String> = policies
            .get("policies")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|p| p.get("policyName").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        Ok(Some(AttachedCertificate {
            id: id.to_string(),
            pem,
            policies: names,
        }))
    }
}

/// The certificate id in `arn:aws:iot:<region>:<account>:cert/<id>`.
pub fn certificate_id_from_arn(arn: &str) -> Option<&str> {
    arn.rsplit_once(":cert/")
        .map(|(_, id)| id)
        .filter(|id| !id.is_empty())
}

impl Registry for AwsCliRegistry {
    fn endpoint(&self) -> Result<String, RegistryError> {
        let v = self.call("describe-endpoint", &["--endpoint-type", "iot:Data-ATS"])?;
        Self::string_field(&v, "describe-endpoint", "/endpointAddress")
    }

    fn registration_code(&self) -> Result<String, RegistryError> {
        let v = self.call("get-registration-code", &[])?;
        Self::string_field(&v, "get-registration-code", "/registrationCode")
    }

    fn ensure_policy(&self, name: &str, document: &Value) -> Result<PolicyStatus, RegistryError> {
        match self.call("get-policy", &["--policy-name", name]) {
            Ok(_) => return Ok(PolicyStatus::Existing),
            Err(RegistryError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        match self.call(
            "create-policy",
            &["--policy-name", name, "--policy-document", &document.to_string()],
        ) {
            Ok(_) => Ok(PolicyStatus::Created),
            Err(RegistryError::AlreadyExists { .. }) => Ok(PolicyStatus::Existing),
            Err(e) => Err(e),
        }
    }

    fn import_device(&self, import: &DeviceImport) -> Result<(), RegistryError> {
        let der = pem_to_der(import.certificate_pem.as_bytes())
            .map_err(|e| RegistryError::InvalidCertificate(e.to_string()))?;
        let cert_id = CertFingerprint::of_der(&der).to_hex();
        let name = import.thing_name.as_str();

        let arn = self.register_certificate(&import.certificate_pem, &cert_id)?;
        self.upsert_thing(name, &import.signer_fingerprint.to_hex())?;
        self.call(
            "attach-thing-principal",
            &["--thing-name", name, "--principal", &arn],
        )?;
        self.call(
            "attach-policy",
            &["--policy-name", &import.policy, "--target", &arn],
        )?;
        tracing::debug!(serial = name, certificate = %cert_id, "device imported");
        Ok(())
    }

    fn read_record(&self, name: &SerialNumber) -> Result<Option<RegistryRecord>, RegistryError> {
        let thing = match self.call("describe-thing", &["--thing-name", name.as_str()]) {
            Ok(v) => v,
            Err(RegistryError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let attributes: BTreeMap<String, String> = thing
            .get("attributes")
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let principals = self.call("list-thing-principals", &["--thing-name", name.as_str()])?;
        let mut certificates = Vec::new();
        for arn in principals
            .get("principals")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
        {
            if let Some(cert) = self.attached_certificate(arn)? {
                certificates.push(cert);
            }
        }
        certificates.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(Some(RegistryRecord {
            name: Self::string_field(&thing, "describe-thing", "/thingName")?,
            attributes,
            certificates,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{default_policy_document, DEFAULT_POLICY};
    use dprov_crypto::fixtures::FactoryCa;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Replays canned outputs in order and records every invocation.
    #[derive(Clone, Default)]
    struct ScriptedRunner {
        script: Arc<Mutex<VecDeque<(&'static str, CommandOutput)>>>,
        calls: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl ScriptedRunner {
        fn expect(self, operation: &'static str, output: CommandOutput) -> Self {
            self.script.lock().push_back((operation, output));
            self
        }

        fn operations(&self) -> Vec<String> {
            self.calls.lock().iter().map(|c| c[1].clone()).collect()
        }

        fn call(&self, i: usize) -> Vec<String> {
            self.calls.lock()[i].clone()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
            assert_eq!(program, "aws");
            self.calls.lock().push(args.to_vec());
            let (operation, output) = self
                .script
                .lock()
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected call {args:?}"));
            assert_eq!(args[1], operation, "call order");
            Ok(output)
        }
    }

    struct MissingTool;

    impl CommandRunner for MissingTool {
        fn run(&self, _program: &str, _args: &[String]) -> io::Result<CommandOutput> {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }
    }

    fn registry(runner: &ScriptedRunner) -> AwsCliRegistry {
        AwsCliRegistry::with_runner("aws", DEFAULT_REGION, Box::new(runner.clone()))
    }

    const NOT_FOUND: &str =
        "An error occurred (ResourceNotFoundException) when calling the GetPolicy operation";
    const EXISTS: &str =
        "An error occurred (ResourceAlreadyExistsException) when calling the operation";

    #[test]
    fn calls_are_region_scoped_json() {
        let runner = ScriptedRunner::default().expect(
            "get-registration-code",
            CommandOutput::ok(r#"{"registrationCode":"AB12CD34"}"#),
        );
        assert_eq!(registry(&runner).registration_code().unwrap(), "AB12CD34");
        assert_eq!(
            runner.call(0),
            ["iot", "get-registration-code", "--region", "eu-central-1", "--output", "json"]
        );
    }

    #[test]
    fn endpoint_lookup() {
        let runner = ScriptedRunner::default().expect(
            "describe-endpoint",
            CommandOutput::ok(r#"{"endpointAddress":"abc-ats.iot.eu-central-1.amazonaws.com"}"#),
        );
        assert_eq!(
            registry(&runner).endpoint().unwrap(),
            "abc-ats.iot.eu-central-1.amazonaws.com"
        );
        assert!(runner.call(0).contains(&"iot:Data-ATS".to_string()));
    }

    #[test]
    fn policy_created_only_when_missing() {
        let runner = ScriptedRunner::default()
            .expect("get-policy", CommandOutput::failed(254, NOT_FOUND))
            .expect("create-policy", CommandOutput::ok(r#"{"policyName":"Default"}"#))
            .expect("get-policy", CommandOutput::ok(r#"{"policyName":"Default"}"#));
        let reg = registry(&runner);
        let doc = default_policy_document();
        assert_eq!(reg.ensure_policy(DEFAULT_POLICY, &doc).unwrap(), PolicyStatus::Created);
        assert_eq!(reg.ensure_policy(DEFAULT_POLICY, &doc).unwrap(), PolicyStatus::Existing);
        assert_eq!(runner.operations(), ["get-policy", "create-policy", "get-policy"]);
    }

    #[test]
    fn policy_creation_race_counts_as_existing() {
        let runner = ScriptedRunner::default()
            .expect("get-policy", CommandOutput::failed(254, NOT_FOUND))
            .expect("create-policy", CommandOutput::failed(254, EXISTS));
        assert_eq!(
            registry(&runner)
                .ensure_policy(DEFAULT_POLICY, &default_policy_document())
                .unwrap(),
            PolicyStatus::Existing
        );
    }

    #[test]
    fn import_new_device_runs_full_sequence() {
        let pem = FactoryCa::new().issue_device("0A0B").pem;
        let arn = "arn:aws:iot:eu-central-1:123456789012:cert/abc";
        let runner = ScriptedRunner::default()
            .expect(
                "register-certificate-without-ca",
                CommandOutput::ok(format!(r#"{{"certificateArn":"{arn}","certificateId":"abc"}}"#)),
            )
            .expect("describe-thing", CommandOutput::failed(254, NOT_FOUND))
            .expect("create-thing", CommandOutput::ok(r#"{"thingName":"0A0B"}"#))
            .expect("attach-thing-principal", CommandOutput::ok(""))
            .expect("attach-policy", CommandOutput::ok(""));
        registry(&runner)
            .import_device(&DeviceImport {
                thing_name: SerialNumber::parse("0A0B").unwrap(),
                certificate_pem: pem,
                signer_fingerprint: CertFingerprint::of_der(b"signer"),
                policy: DEFAULT_POLICY.into(),
            })
            .unwrap();

        let register = runner.call(0);
        assert!(register.contains(&"ACTIVE".to_string()));
        let create = runner.call(2);
        let payload_at = create.iter().position(|a| a == "--attribute-payload").unwrap();
        let payload: Value = serde_json::from_str(&create[payload_at + 1]).unwrap();
        assert_eq!(
            payload["attributes"]["signer"],
            CertFingerprint::of_der(b"signer").to_hex()
        );
        assert!(runner.call(4).contains(&arn.to_string()));
    }

    #[test]
    fn reimport_reuses_registered_certificate() {
        let pem = FactoryCa::new().issue_device("0A0B").pem;
        let der = pem_to_der(pem.as_bytes()).unwrap();
        let id = CertFingerprint::of_der(&der).to_hex();
        let arn = format!("arn:aws:iot:eu-central-1:123456789012:cert/{id}");
        let runner = ScriptedRunner::default()
            .expect("register-certificate-without-ca", CommandOutput::failed(254, EXISTS))
            .expect(
                "describe-certificate",
                CommandOutput::ok(
                    json!({"certificateDescription": {"certificateArn": arn}}).to_string(),
                ),
            )
            .expect("describe-thing", CommandOutput::ok(r#"{"thingName":"0A0B"}"#))
            .expect("update-thing", CommandOutput::ok(""))
            .expect("attach-thing-principal", CommandOutput::ok(""))
            .expect("attach-policy", CommandOutput::ok(""));
        registry(&runner)
            .import_device(&DeviceImport {
                thing_name: SerialNumber::parse("0A0B").unwrap(),
                certificate_pem: pem,
                signer_fingerprint: CertFingerprint::of_der(b"signer"),
                policy: DEFAULT_POLICY.into(),
            })
            .unwrap();
        assert_eq!(runner.call(1)[3], id);
    }

    #[test]
    fn read_record_assembles_certificates_and_policies() {
        let arn = "arn:aws:iot:eu-central-1:123456789012:cert/abc";
        let runner = ScriptedRunner::default()
            .expect(
                "describe-thing",
                CommandOutput::ok(
                    r#"{"thingName":"0123456789ABCDEF","attributes":{"signer":"ff"}}"#,
                ),
            )
            .expect(
                "list-thing-principals",
                CommandOutput::ok(json!({ "principals": [arn] }).to_string()),
            )
            .expect(
                "describe-certificate",
                CommandOutput::ok(
                    r#"{"certificateDescription":{"certificateArn":"x","certificatePem":"PEM"}}"#,
                ),
            )
            .expect(
                "list-attached-policies",
                CommandOutput::ok(r#"{"policies":[{"policyName":"Default","policyArn":"p"}]}"#),
            );
        let rec = registry(&runner)
            .read_record(&SerialNumber::parse("0123456789ABCDEF").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(rec.name, "0123456789ABCDEF");
        assert_eq!(rec.signer(), Some("ff"));
        assert_eq!(rec.certificates.len(), 1);
        assert_eq!(rec.certificates[0].id, "abc");
        assert_eq!(rec.certificates[0].policies, ["Default"]);
    }

    #[test]
    fn absent_record_is_none() {
        let runner = ScriptedRunner::default()
            .expect("describe-thing", CommandOutput::failed(254, NOT_FOUND));
        assert!(registry(&runner)
            .read_record(&SerialNumber::parse("0A0B").unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn cli_failures_are_classified() {
        let runner = ScriptedRunner::default().expect(
            "get-registration-code",
            CommandOutput::failed(255, "Unable to locate credentials."),
        );
        let err = registry(&runner).registration_code().unwrap_err();
        assert!(matches!(err, RegistryError::CommandFailed { ref stderr, .. } if stderr.contains("credentials")));

        let missing = AwsCliRegistry::with_runner("aws", DEFAULT_REGION, Box::new(MissingTool));
        assert_eq!(
            missing.endpoint().unwrap_err().class(),
            dprov_core::ErrorClass::Environment
        );
    }

    #[test]
    fn arn_parsing() {
        assert_eq!(
            certificate_id_from_arn("arn:aws:iot:eu-central-1:1:cert/abc"),
            Some("abc")
        );
        assert_eq!(certificate_id_from_arn("arn:aws:iot:eu-central-1:1:thing/x"), None);
        assert_eq!(certificate_id_from_arn("arn:aws:iot:eu-central-1:1:cert/"), None);
    }
}
