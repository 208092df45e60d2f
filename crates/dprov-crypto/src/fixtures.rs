//! Factory certificate fixtures.
//!
//! Real secure elements arrive with a device certificate issued by the chip
//! vendor's factory CA. [`FactoryCa`] stands in for that CA so tests can build
//! simulated devices with genuine P-256 certificates.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    PKCS_ECDSA_P256_SHA256,
};

/// A device certificate issued by [`FactoryCa`].
#[derive(Debug, Clone)]
pub struct DeviceCertificate {
    /// PEM encoding.
    pub pem: String,
    /// DER encoding.
    pub der: Vec<u8>,
}

/// A throwaway factory CA.
pub struct FactoryCa {
    key: KeyPair,
    cert: Certificate,
}

impl Default for FactoryCa {
    fn default() -> Self {
        Self::new()
    }
}

impl FactoryCa {
    /// Generate a new factory CA.
    pub fn new() -> Self {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).expect("factory CA key");
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "Example Factory");
        dn.push(DnType::CommonName, "Example Factory Signer 2C00");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        let cert = params.self_signed(&key).expect("factory CA certificate");
        Self { key, cert }
    }

    /// PEM encoding of the CA certificate.
    pub fn certificate_pem(&self) -> String {
        self.cert.pem()
    }

    /// Issue a P-256 device certificate with `CN=sn<serial>`.
    pub fn issue_device(&self, serial: &str) -> DeviceCertificate {
        let device_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).expect("device key");
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "Example Factory");
        dn.push(DnType::CommonName, format!("sn{serial}"));
        params.distinguished_name = dn;
        let cert = params
            .signed_by(&device_key, &self.cert, &self.key)
            .expect("device certificate");
        DeviceCertificate {
            pem: cert.pem(),
            der: cert.der().to_vec(),
        }
    }
}
