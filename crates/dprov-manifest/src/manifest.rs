//! # Signed Device Manifest
//!
//! One manifest per device per provisioning attempt. On disk it is a
//! flattened JWS:
//!
//! ```json
//! {
//!   "protected": "<b64url {alg, kid, x5t#S256}>",
//!   "payload":   "<b64url canonical payload>",
//!   "header":    { "uniqueId": "<SERIAL>" },
//!   "signature": "<b64url r || s>"
//! }
//! ```
//!
//! The payload carries the serial number and the factory device certificate
//! as a single-entry JWK set. The protected header names the signer authority
//! by certificate thumbprint so a verifier holding several signer
//! certificates can tell which one applies.
//!
//! [`SignedManifest::verify`] is the only way to get at a trusted payload. It
//! checks structure, algorithm, signer, signature, serial consistency and the
//! device key binding, in that order, and stops at the first failure.

use std::path::Path;
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, SubsecRound, Utc};
use dprov_core::{write_atomic, CanonicalBytes, CertFingerprint, SerialNumber};
use dprov_crypto::jws::{self, JwsHeader, ALG_ES256};
use dprov_crypto::{CertificateInfo, CryptoError, SignerAuthority};
use dprov_device::DeviceIdentity;
use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ManifestError;

/// Payload format version.
pub const MANIFEST_VERSION: u32 = 1;

/// Secure-element model recorded in the payload.
pub const DEVICE_MODEL: &str = "ATECC608";

static ENVELOPE_SCHEMA: EmbeddedSchema = EmbeddedSchema::new(
    "envelope",
    include_str!("../schemas/manifest.schema.json"),
);
static PAYLOAD_SCHEMA: EmbeddedSchema = EmbeddedSchema::new(
    "payload",
    include_str!("../schemas/manifest-payload.schema.json"),
);

// ─── Document Types ──────────────────────────────────────────────────

/// Device public key as a JWK with its certificate chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceJwk {
    /// Key slot id on the secure element.
    pub kid: String,
    /// Always `EC`.
    pub kty: String,
    /// Always `P-256`.
    pub crv: String,
    /// base64url X coordinate.
    pub x: String,
    /// base64url Y coordinate.
    pub y: String,
    /// Standard base64 DER certificates, device certificate first.
    pub x5c: Vec<String>,
    /// base64url SHA-256 thumbprint of `x5c[0]`.
    #[serde(rename = "x5t#S256")]
    pub x5t_s256: String,
}

impl DeviceJwk {
    /// JWK for a parsed device certificate.
    pub fn from_certificate(cert: &CertificateInfo) -> Result<Self, CryptoError> {
        let (x, y) = coordinates(cert)?;
        Ok(Self {
            kid: "0".to_string(),
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            x,
            y,
            x5c: vec![STANDARD.encode(&cert.der)],
            x5t_s256: jws::thumbprint(&cert.der),
        })
    }
}

/// The key set carried by a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeySet {
    /// Exactly one device key.
    pub keys: Vec<DeviceJwk>,
}

/// The signed content of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestPayload {
    /// Format version.
    pub version: u32,
    /// Secure-element model.
    pub model: String,
    /// Device serial number; names the registry record.
    pub unique_id: SerialNumber,
    /// Unique per provisioning attempt.
    pub provisioning_id: Uuid,
    /// When the manifest was produced (UTC, whole seconds).
    pub provisioned_at: DateTime<Utc>,
    /// Device key and certificate.
    pub public_key_set: PublicKeySet,
}

/// Unprotected JWS header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnprotectedHeader {
    /// Device serial number, readable without decoding the payload.
    #[serde(rename = "uniqueId")]
    pub unique_id: SerialNumber,
}

/// A manifest as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedManifest {
    /// base64url protected header.
    pub protected: String,
    /// base64url canonical payload.
    pub payload: String,
    /// Unprotected header.
    pub header: UnprotectedHeader,
    /// base64url ES256 signature.
    pub signature: String,
}

/// A manifest whose every check passed.
#[derive(Debug, Clone)]
pub struct VerifiedManifest {
    /// Decoded protected header.
    pub protected: JwsHeader,
    /// Decoded payload.
    pub payload: ManifestPayload,
    /// Parsed device certificate.
    pub device_certificate: CertificateInfo,
}

impl VerifiedManifest {
    /// Device serial number.
    pub fn serial(&self) -> &SerialNumber {
        &self.payload.unique_id
    }

    /// Fingerprint of the device certificate.
    pub fn device_fingerprint(&self) -> CertFingerprint {
        self.device_certificate.fingerprint()
    }

    /// Device certificate as PEM.
    pub fn device_certificate_pem(&self) -> String {
        self.device_certificate.to_pem()
    }
}

// ─── Signing ─────────────────────────────────────────────────────────

impl SignedManifest {
    /// Sign a fresh manifest for `identity` with a new provisioning id.
    pub fn create(
        identity: &DeviceIdentity,
        signer: &SignerAuthority,
    ) -> Result<Self, ManifestError> {
        Self::sign(identity, signer, Uuid::new_v4(), Utc::now())
    }

    /// Sign a manifest with explicit provisioning id and timestamp.
    pub fn sign(
        identity: &DeviceIdentity,
        signer: &SignerAuthority,
        provisioning_id: Uuid,
        provisioned_at: DateTime<Utc>,
    ) -> Result<Self, ManifestError> {
        let device_cert = CertificateInfo::from_pem(identity.certificate_pem.as_bytes())
            .map_err(ManifestError::DeviceCertificate)?;
        let jwk = DeviceJwk::from_certificate(&device_cert).map_err(ManifestError::DeviceCertificate)?;

        let payload = ManifestPayload {
            version: MANIFEST_VERSION,
            model: DEVICE_MODEL.to_string(),
            unique_id: identity.serial.clone(),
            provisioning_id,
            provisioned_at: provisioned_at.trunc_subsecs(0),
            public_key_set: PublicKeySet { keys: vec![jwk] },
        };

        let protected = jws::b64url_encode(CanonicalBytes::new(&JwsHeader::for_signer(signer))?.as_bytes());
        let payload_b64 = jws::b64url_encode(CanonicalBytes::new(&payload)?.as_bytes());
        let signature = jws::sign(signer, &protected, &payload_b64)?;

        tracing::debug!(serial = %identity.serial, kid = %signer.key_id(), "manifest signed");
        Ok(Self {
            protected,
            payload: payload_b64,
            header: UnprotectedHeader {
                unique_id: identity.serial.clone(),
            },
            signature,
        })
    }

    /// Serial number from the unprotected header. Not authenticated.
    pub fn claimed_serial(&self) -> &SerialNumber {
        &self.header.unique_id
    }

    // ─── Verification ────────────────────────────────────────────────

    /// Verify against the signer certificate. See the module docs for the
    /// order of checks.
    pub fn verify(&self, signer_cert: &CertificateInfo) -> Result<VerifiedManifest, ManifestError> {
        ENVELOPE_SCHEMA.validate(&serde_json::to_value(self)?)?;

        let protected: JwsHeader = serde_json::from_slice(&decode(&self.protected)?)?;
        if protected.alg != ALG_ES256 {
            return Err(ManifestError::UnsupportedAlgorithm(protected.alg));
        }
        let expected = jws::thumbprint(&signer_cert.der);
        if protected.x5t_s256 != expected {
            return Err(ManifestError::SignerMismatch {
                expected,
                found: protected.x5t_s256,
            });
        }
        let signer_key = signer_cert
            .verifying_key()
            .map_err(ManifestError::Signature)?;
        jws::verify(&signer_key, &self.protected, &self.payload, &self.signature)
            .map_err(ManifestError::Signature)?;

        let payload_value: Value = serde_json::from_slice(&decode(&self.payload)?)?;
        PAYLOAD_SCHEMA.validate(&payload_value)?;
        let payload: ManifestPayload = serde_json::from_value(payload_value)?;
        if payload.unique_id != self.header.unique_id {
            return Err(ManifestError::UniqueIdMismatch {
                header: self.header.unique_id.clone(),
                payload: payload.unique_id,
            });
        }

        let jwk = payload
            .public_key_set
            .keys
            .first()
            .ok_or(ManifestError::KeyMismatch)?;
        let der = jwk
            .x5c
            .first()
            .ok_or(ManifestError::ThumbprintMismatch)
            .and_then(|b64| {
                STANDARD
                    .decode(b64)
                    .map_err(|e| ManifestError::DeviceCertificate(CryptoError::Base64(e.to_string())))
            })?;
        let device_certificate =
            CertificateInfo::from_der(&der).map_err(ManifestError::DeviceCertificate)?;
        let (x, y) = coordinates(&device_certificate).map_err(ManifestError::DeviceCertificate)?;
        if jwk.x != x || jwk.y != y {
            return Err(ManifestError::KeyMismatch);
        }
        if jwk.x5t_s256 != jws::thumbprint(&device_certificate.der) {
            return Err(ManifestError::ThumbprintMismatch);
        }

        Ok(VerifiedManifest {
            protected,
            payload,
            device_certificate,
        })
    }

    // ─── Persistence ─────────────────────────────────────────────────

    /// Parse a manifest document, checking its envelope structure.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, ManifestError> {
        let value: Value = serde_json::from_slice(bytes)?;
        ENVELOPE_SCHEMA.validate(&value)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Pretty-printed JSON document with trailing newline.
    pub fn to_json_pretty(&self) -> Result<Vec<u8>, ManifestError> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Read a manifest file.
    pub fn read(path: &Path) -> Result<Self, ManifestError> {
        Self::from_json_slice(&std::fs::read(path)?)
    }

    /// Write atomically to `path`.
    pub fn write(&self, path: &Path) -> Result<(), ManifestError> {
        write_atomic(path, &self.to_json_pretty()?)?;
        Ok(())
    }
}

fn decode(b64: &str) -> Result<Vec<u8>, ManifestError> {
    jws::b64url_decode(b64).map_err(ManifestError::Signature)
}

fn coordinates(cert: &CertificateInfo) -> Result<(String, String), CryptoError> {
    let point = cert.verifying_key()?.to_encoded_point(false);
    match (point.x(), point.y()) {
        (Some(x), Some(y)) => Ok((
            jws::b64url_encode(x.as_slice()),
            jws::b64url_encode(y.as_slice()),
        )),
        _ => Err(CryptoError::InvalidPublicKey(
            "point at infinity".to_string(),
        )),
    }
}

/// A JSON Schema compiled on first use and shared for the process lifetime.
struct EmbeddedSchema {
    name: &'static str,
    source: &'static str,
    compiled: OnceLock<Result<Validator, String>>,
}

impl EmbeddedSchema {
    const fn new(name: &'static str, source: &'static str) -> Self {
        Self {
            name,
            source,
            compiled: OnceLock::new(),
        }
    }

    fn validator(&self) -> Result<&Validator, ManifestError> {
        self.compiled
            .get_or_init(|| compile(self.source))
            .as_ref()
            .map_err(|reason| ManifestError::SchemaBuild {
                name: self.name,
                reason: reason.clone(),
            })
    }

    fn validate(&self, instance: &Value) -> Result<(), ManifestError> {
        let violations: Vec<String> = self
            .validator()?
            .iter_errors(instance)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    format!("  (root): {e}")
                } else {
                    format!("  {path}: {e}")
                }
            })
            .collect();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ManifestError::Schema {
                document: self.name,
                violations,
            })
        }
    }
}

fn compile(source: &str) -> Result<Validator, String> {
    let value: Value = serde_json::from_str(source).map_err(|e| e.to_string())?;
    let mut opts = jsonschema::options();
    opts.with_draft(jsonschema::Draft::Draft202012);
    opts.build(&value).map_err(|e| e.to_string())
}
