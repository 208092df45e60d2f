//! # dprov-crypto: Cryptographic Primitives for Device Provisioning
//!
//! - **Signer authority**: a short-lived, self-signed P-256 certificate
//!   authority whose common name is the registry's registration code. It signs
//!   every manifest of one provisioning batch.
//! - **X.509 inspection**: owned, parsed views of certificates
//!   ([`CertificateInfo`]) and PEM helpers.
//! - **ES256 JWS**: detached signing and verification of manifest payloads.
//!
//! Certificates are built with `rcgen`, parsed with `x509-parser`, and all
//! ECDSA operations go through the RustCrypto `p256` crate.

pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod fixtures;
pub mod jws;
pub mod signer;
pub mod x509;

// Re-export primary types.
pub use error::{AuthorityError, CryptoError};
pub use jws::JwsHeader;
pub use signer::{SignerAuthority, VALIDITY_DAYS};
pub use x509::CertificateInfo;
