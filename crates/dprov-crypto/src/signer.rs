//! # Signer Authority
//!
//! A [`SignerAuthority`] is a self-signed P-256 certificate authority scoped to
//! one registry account. Its subject and issuer common name are the registry's
//! registration code, which is how the registry recognises manifests signed for
//! that account.
//!
//! ## Certificate Profile
//!
//! | Field | Value |
//! |---|---|
//! | Key | EC P-256, signed with ECDSA-SHA256 |
//! | Issuer / Subject | `CN=<registration code>` |
//! | Serial | 16 random bytes, positive |
//! | Validity | generation time (whole seconds) + 365 days |
//! | Extensions | SubjectKeyIdentifier, AuthorityKeyIdentifier (self), BasicConstraints CA=true unlimited (critical) |
//!
//! ## Staleness
//!
//! The registry may rotate its registration code. An authority whose CN no
//! longer equals the current code is stale and must be regenerated before it
//! signs anything; [`SignerAuthority::ensure_current`] enforces this.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use dprov_core::layout::StagedFile;
use dprov_core::{CertFingerprint, WorkDir};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::DecodePrivateKey;
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyIdMethod, KeyPair,
    PKCS_ECDSA_P256_SHA256,
};
use time::OffsetDateTime;
use zeroize::Zeroizing;

use crate::error::AuthorityError;
use crate::x509::CertificateInfo;

/// Lifetime of a signer certificate.
pub const VALIDITY_DAYS: i64 = 365;

const SECONDS_PER_DAY: i64 = 86_400;

/// A signing authority: P-256 private key plus its self-signed CA certificate.
pub struct SignerAuthority {
    signing_key: SigningKey,
    key_pem: Zeroizing<String>,
    certificate_pem: String,
    certificate: CertificateInfo,
}

impl fmt::Debug for SignerAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerAuthority")
            .field("common_name", &self.certificate.subject_cn)
            .field("fingerprint", &self.fingerprint().to_hex())
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

impl SignerAuthority {
    /// Fetch the registration code from the registry and generate an authority for it.
    ///
    /// A failure to obtain the code is an [`AuthorityError::RegistrationCode`];
    /// nothing is generated in that case.
    pub fn generate_with<F, E>(fetch_code: F) -> Result<Self, AuthorityError>
    where
        F: FnOnce() -> Result<String, E>,
        E: fmt::Display,
    {
        let code = fetch_code().map_err(|e| AuthorityError::RegistrationCode(e.to_string()))?;
        Self::generate(&code)
    }

    /// Generate an authority for `registration_code`, valid from now.
    pub fn generate(registration_code: &str) -> Result<Self, AuthorityError> {
        Self::generate_at(registration_code, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Generate an authority valid from `not_before` (unix seconds) for 365 days.
    pub fn generate_at(registration_code: &str, not_before: i64) -> Result<Self, AuthorityError> {
        validate_code(registration_code)?;

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| AuthorityError::Generation(e.to_string()))?;

        let start = OffsetDateTime::from_unix_timestamp(not_before)
            .map_err(|e| AuthorityError::Generation(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, registration_code);

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.serial_number = Some(random_serial().into());
        params.not_before = start;
        params.not_after = start + time::Duration::days(VALIDITY_DAYS);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_identifier_method = KeyIdMethod::Sha256;
        params.use_authority_key_identifier_extension = true;

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| AuthorityError::Generation(e.to_string()))?;

        let authority = Self::from_pem(&key_pair.serialize_pem(), &cert.pem())?;
        tracing::info!(
            common_name = registration_code,
            fingerprint = %authority.fingerprint(),
            "generated signer authority"
        );
        Ok(authority)
    }

    /// Rebuild an authority from PEM material, validating the certificate profile.
    pub fn from_pem(key_pem: &str, certificate_pem: &str) -> Result<Self, AuthorityError> {
        let signing_key = SigningKey::from_pkcs8_pem(key_pem)
            .map_err(|e| AuthorityError::Malformed(format!("private key: {e}")))?;
        let certificate = CertificateInfo::from_pem(certificate_pem.as_bytes())
            .map_err(|e| AuthorityError::Malformed(format!("certificate: {e}")))?;

        let authority = Self {
            signing_key,
            key_pem: Zeroizing::new(key_pem.to_string()),
            certificate_pem: certificate_pem.to_string(),
            certificate,
        };
        authority.check_profile()?;
        Ok(authority)
    }

    fn check_profile(&self) -> Result<(), AuthorityError> {
        let cert = &self.certificate;

        let own_point =
            p256::PublicKey::from(self.signing_key.verifying_key()).to_encoded_point(false);
        if own_point.as_bytes() != cert.public_key.as_slice() {
            return Err(AuthorityError::KeyMismatch);
        }

        if cert.subject_cn.is_none() || cert.subject_cn != cert.issuer_cn {
            return Err(AuthorityError::NotSelfSigned);
        }
        cert.signed_by(self.signing_key.verifying_key())
            .map_err(|_| AuthorityError::NotSelfSigned)?;

        match cert.basic_constraints {
            Some(bc) if bc.critical && bc.ca => Ok(()),
            _ => Err(AuthorityError::NotCa),
        }
    }

    /// Write `signer_key.pem` and `signer_cert.crt` into the working directory.
    ///
    /// Both files are staged before either is committed. If the certificate
    /// commit fails the previous key is put back (or the new key removed when
    /// there was none), so the pair on disk stays consistent.
    pub fn persist(&self, work_dir: &WorkDir) -> Result<(), AuthorityError> {
        work_dir.ensure()?;
        let key_path = work_dir.signer_key_path();
        let cert_path = work_dir.signer_cert_path();

        let previous_key = match fs::read(&key_path) {
            Ok(bytes) => Some(Zeroizing::new(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let key = StagedFile::stage(&key_path, self.key_pem.as_bytes(), true)?;
        let cert = StagedFile::stage(&cert_path, self.certificate_pem.as_bytes(), false)?;

        key.commit()?;
        if let Err(e) = cert.commit() {
            let previous = previous_key.as_ref().map(|k| k.as_slice());
            if let Err(rollback) = restore_key(&key_path, previous) {
                tracing::error!(
                    key = %key_path.display(),
                    error = %rollback,
                    "failed to roll back signer key"
                );
            }
            return Err(e.into());
        }
        tracing::debug!(
            key = %key_path.display(),
            cert = %cert_path.display(),
            "persisted signer authority"
        );
        Ok(())
    }

    /// Load and re-validate a persisted authority.
    pub fn load(work_dir: &WorkDir) -> Result<Self, AuthorityError> {
        let key_path = work_dir.signer_key_path();
        let cert_path = work_dir.signer_cert_path();
        for path in [&key_path, &cert_path] {
            if !path.is_file() {
                return Err(AuthorityError::Missing(path.clone()));
            }
        }
        let key_pem = Zeroizing::new(fs::read_to_string(&key_path)?);
        let cert_pem = fs::read_to_string(&cert_path)?;
        Self::from_pem(&key_pem, &cert_pem)
    }

    /// Fail unless the authority matches the registry's current code and is
    /// inside its validity window at `now` (unix seconds).
    pub fn ensure_current(&self, registration_code: &str, now: i64) -> Result<(), AuthorityError> {
        let found = self.registration_code();
        if found != registration_code {
            return Err(AuthorityError::Stale {
                expected: registration_code.to_string(),
                found: found.to_string(),
            });
        }
        if !self.certificate.is_valid_at(now) {
            return Err(AuthorityError::Expired {
                now,
                not_before: self.certificate.not_before,
                not_after: self.certificate.not_after,
            });
        }
        Ok(())
    }

    /// The registration code this authority was generated for (its subject CN).
    pub fn registration_code(&self) -> &str {
        self.certificate.subject_cn.as_deref().unwrap_or_default()
    }

    /// Parsed certificate.
    pub fn certificate(&self) -> &CertificateInfo {
        &self.certificate
    }

    /// Certificate PEM as persisted.
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// SHA-256 fingerprint of the certificate DER.
    pub fn fingerprint(&self) -> CertFingerprint {
        self.certificate.fingerprint()
    }

    /// Hex SubjectKeyIdentifier, used as the JWS `kid`.
    pub fn key_id(&self) -> String {
        self.certificate
            .subject_key_id
            .as_deref()
            .map(hex::encode)
            .unwrap_or_else(|| self.fingerprint().to_hex())
    }

    /// ECDSA P-256 / SHA-256 signature over `message`, as fixed-size `r || s`.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, AuthorityError> {
        let sig: Signature = self
            .signing_key
            .try_sign(message)
            .map_err(|e| AuthorityError::Signing(e.to_string()))?;
        Ok(sig.to_bytes().to_vec())
    }
}

fn validate_code(code: &str) -> Result<(), AuthorityError> {
    if code.trim().is_empty() || code.len() > 64 || code.chars().any(char::is_control) {
        return Err(AuthorityError::InvalidCode(code.to_string()));
    }
    Ok(())
}

/// Put `previous` back at `key_path`, or remove the key if there was none.
fn restore_key(key_path: &Path, previous: Option<&[u8]>) -> io::Result<()> {
    match previous {
        Some(bytes) => StagedFile::stage(key_path, bytes, true)?.commit().map(drop),
        None => match fs::remove_file(key_path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        },
    }
}

/// 16 random bytes with the top bit cleared so the INTEGER stays positive.
fn random_serial() -> Vec<u8> {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    bytes.to_vec()
}
