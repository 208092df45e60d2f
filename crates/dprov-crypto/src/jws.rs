//! # ES256 Detached JWS
//!
//! Manifests are JSON Web Signatures in flattened form: a base64url protected
//! header, a base64url payload and a base64url `r || s` signature over
//! `protected || "." || payload`. Only `ES256` (ECDSA P-256 / SHA-256) is
//! accepted.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use dprov_core::sha256_raw;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{AuthorityError, CryptoError};
use crate::signer::SignerAuthority;

/// The only accepted algorithm.
pub const ALG_ES256: &str = "ES256";

/// JWS protected header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwsHeader {
    /// Signature algorithm, always `ES256`.
    pub alg: String,
    /// Key id: hex SubjectKeyIdentifier of the signer certificate.
    pub kid: String,
    /// base64url SHA-256 thumbprint of the signer certificate DER.
    #[serde(rename = "x5t#S256")]
    pub x5t_s256: String,
}

impl JwsHeader {
    /// Header identifying `signer`.
    pub fn for_signer(signer: &SignerAuthority) -> Self {
        Self {
            alg: ALG_ES256.to_string(),
            kid: signer.key_id(),
            x5t_s256: thumbprint(&signer.certificate().der),
        }
    }
}

/// base64url (no padding) of SHA-256 over certificate DER.
pub fn thumbprint(cert_der: &[u8]) -> String {
    b64url_encode(&sha256_raw(cert_der))
}

/// base64url encode without padding.
pub fn b64url_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// base64url decode, padding not allowed.
pub fn b64url_decode(s: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| CryptoError::Base64(e.to_string()))
}

/// `protected || "." || payload` as ASCII bytes.
pub fn signing_input(protected_b64: &str, payload_b64: &str) -> Vec<u8> {
    let mut input = Vec::with_capacity(protected_b64.len() + payload_b64.len() + 1);
    input.extend_from_slice(protected_b64.as_bytes());
    input.push(b'.');
    input.extend_from_slice(payload_b64.as_bytes());
    input
}

/// Sign `signing_input(protected, payload)`; returns the base64url signature.
pub fn sign(
    signer: &SignerAuthority,
    protected_b64: &str,
    payload_b64: &str,
) -> Result<String, AuthorityError> {
    let sig = signer.sign(&signing_input(protected_b64, payload_b64))?;
    Ok(b64url_encode(&sig))
}

/// Verify a base64url `r || s` signature with `key`.
pub fn verify(
    key: &VerifyingKey,
    protected_b64: &str,
    payload_b64: &str,
    signature_b64: &str,
) -> Result<(), CryptoError> {
    let raw = b64url_decode(signature_b64)?;
    let sig =
        Signature::from_slice(&raw).map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;
    key.verify(&signing_input(protected_b64, payload_b64), &sig)
        .map_err(|_| CryptoError::VerificationFailed)
}
