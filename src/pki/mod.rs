//! Certificate authority operations for the webhook trust root
//!
//! The reconciler only talks to the [`CertificateAuthority`] trait. The
//! production implementation, [`RcgenAuthority`], issues a self-signed CA and
//! a serving leaf with `rcgen` and inspects stored pairs with `x509-parser`.
//!
//! A stored pair is usable when:
//!
//! - both the certificate and the key parse,
//! - the key's public half matches the certificate's public key,
//! - the certificate outlives the expiration threshold,
//! - the leaf was signed by the stored CA.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use x509_parser::prelude::*;

#[cfg(test)]
use mockall::automock;

/// Default validity period for the self-signed CA (1 year)
pub const CA_VALIDITY_DAYS: i64 = 365;

/// Organization written into every issued subject
const ORGANIZATION: &str = "trustroot";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate or key parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Certificate expires before the threshold
    #[error("certificate expires at {not_after}, within the {threshold_secs}s threshold")]
    Expiring {
        /// Expiry of the inspected certificate
        not_after: DateTime<Utc>,
        /// Threshold that was applied
        threshold_secs: u64,
    },

    /// Private key does not belong to the certificate
    #[error("private key does not match certificate public key")]
    KeyMismatch,

    /// Certificate was not signed by the expected CA
    #[error("certificate was not issued by the stored CA: {0}")]
    UntrustedIssuer(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// A PEM encoded certificate together with its PEM encoded private key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// PEM encoded certificate
    pub cert_pem: String,
    /// PEM encoded PKCS#8 private key
    pub key_pem: String,
}

/// A stored certificate/key pair that parsed successfully
#[derive(Clone, Debug)]
pub struct ParsedCertificate {
    /// When the certificate becomes valid
    pub not_before: DateTime<Utc>,
    /// When the certificate expires
    pub not_after: DateTime<Utc>,
    /// Subject common name
    pub common_name: String,
    cert_public_key: Vec<u8>,
    key_public_key: Vec<u8>,
}

impl ParsedCertificate {
    /// Time left before `not_after`, negative once expired
    pub fn remaining(&self, now: DateTime<Utc>) -> TimeDelta {
        self.not_after - now
    }

    /// Whether the private key is the certificate's key
    pub fn key_matches(&self) -> bool {
        self.cert_public_key == self.key_public_key
    }

    #[cfg(test)]
    pub(crate) fn for_testing(not_after: DateTime<Utc>) -> Self {
        Self {
            not_before: not_after - TimeDelta::days(180),
            not_after,
            common_name: "test".to_string(),
            cert_public_key: vec![1, 2, 3],
            key_public_key: vec![1, 2, 3],
        }
    }
}

/// Issues and inspects trust root certificates
#[cfg_attr(test, automock)]
pub trait CertificateAuthority: Send + Sync {
    /// Issue a fresh self-signed CA
    fn generate_ca(&self) -> Result<IssuedCertificate>;

    /// Issue a serving certificate signed by `ca`, valid until `valid_until`,
    /// with `dns_name` as subject alternative name
    fn generate_leaf(
        &self,
        ca: &IssuedCertificate,
        valid_until: DateTime<Utc>,
        dns_name: &str,
    ) -> Result<IssuedCertificate>;

    /// Parse a PEM certificate and its PEM private key
    fn parse_cert_and_key(&self, cert_pem: &[u8], key_pem: &[u8]) -> Result<ParsedCertificate>;

    /// Check that the pair matches and outlives `threshold`
    fn validate(&self, parsed: &ParsedCertificate, threshold: Duration) -> Result<()>;

    /// Check that `cert_pem` carries a signature made by `ca_pem`'s key
    fn verify_issued_by(&self, cert_pem: &[u8], ca_pem: &[u8]) -> Result<()>;
}

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &[u8]) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data)
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Read the expiry of a PEM encoded certificate
pub fn certificate_not_after(cert_pem: &[u8]) -> Result<DateTime<Utc>> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;
    timestamp_to_utc(cert.validity().not_after.timestamp())
}

fn timestamp_to_utc(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| PkiError::ParseError(format!("timestamp {} out of range", secs)))
}

fn to_offset_date_time(at: DateTime<Utc>) -> Result<::time::OffsetDateTime> {
    ::time::OffsetDateTime::from_unix_timestamp(at.timestamp()).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("invalid validity bound: {}", e))
    })
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

/// `rcgen` backed certificate authority
#[derive(Clone, Debug)]
pub struct RcgenAuthority {
    common_name: String,
    ca_validity: TimeDelta,
}

impl Default for RcgenAuthority {
    fn default() -> Self {
        Self::new("trustroot-ca")
    }
}

impl RcgenAuthority {
    /// Create an authority whose CAs carry `common_name`
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ca_validity: TimeDelta::days(CA_VALIDITY_DAYS),
        }
    }

    /// Override the CA validity period
    pub fn with_ca_validity(mut self, validity: TimeDelta) -> Self {
        self.ca_validity = validity;
        self
    }
}

impl CertificateAuthority for RcgenAuthority {
    fn generate_ca(&self) -> Result<IssuedCertificate> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(&self.common_name);

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = Utc::now();
        params.not_before = to_offset_date_time(now)?;
        params.not_after = to_offset_date_time(now + self.ca_validity)?;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    fn generate_leaf(
        &self,
        ca: &IssuedCertificate,
        valid_until: DateTime<Utc>,
        dns_name: &str,
    ) -> Result<IssuedCertificate> {
        let ca_not_after = certificate_not_after(ca.cert_pem.as_bytes())?;
        if valid_until > ca_not_after {
            return Err(PkiError::CertificateGenerationFailed(format!(
                "leaf validity {} exceeds CA expiry {}",
                valid_until, ca_not_after
            )));
        }

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(dns_name);

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        params.not_before = to_offset_date_time(Utc::now())?;
        params.not_after = to_offset_date_time(valid_until)?;

        let san = Ia5String::try_from(dns_name.to_string()).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("invalid DNS name '{}': {}", dns_name, e))
        })?;
        params.subject_alt_names = vec![SanType::DnsName(san)];

        let leaf_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate leaf key: {}", e))
        })?;

        let ca_key = KeyPair::from_pem(&ca.key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign leaf cert: {}", e))
        })?;

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: leaf_key.serialize_pem(),
        })
    }

    fn parse_cert_and_key(&self, cert_pem: &[u8], key_pem: &[u8]) -> Result<ParsedCertificate> {
        let der = parse_pem(cert_pem)?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let key_pem = std::str::from_utf8(key_pem)
            .map_err(|e| PkiError::ParseError(format!("private key is not UTF-8: {}", e)))?;
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse private key: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        Ok(ParsedCertificate {
            not_before: timestamp_to_utc(cert.validity().not_before.timestamp())?,
            not_after: timestamp_to_utc(cert.validity().not_after.timestamp())?,
            common_name,
            cert_public_key: cert.public_key().subject_public_key.data.to_vec(),
            key_public_key: key_pair.public_key_raw().to_vec(),
        })
    }

    fn validate(&self, parsed: &ParsedCertificate, threshold: Duration) -> Result<()> {
        if !parsed.key_matches() {
            return Err(PkiError::KeyMismatch);
        }

        let threshold_delta = TimeDelta::from_std(threshold).unwrap_or(TimeDelta::MAX);
        if parsed.remaining(Utc::now()) < threshold_delta {
            return Err(PkiError::Expiring {
                not_after: parsed.not_after,
                threshold_secs: threshold.as_secs(),
            });
        }

        Ok(())
    }

    fn verify_issued_by(&self, cert_pem: &[u8], ca_pem: &[u8]) -> Result<()> {
        let cert_der = parse_pem(cert_pem)?;
        let (_, cert) = X509Certificate::from_der(&cert_der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let ca_der = parse_pem(ca_pem)?;
        let (_, ca_cert) = X509Certificate::from_der(&ca_der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

        cert.verify_signature(Some(ca_cert.public_key()))
            .map_err(|e| PkiError::UntrustedIssuer(e.to_string()))
    }
}
