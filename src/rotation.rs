//! Rotation decision and regeneration of the trust material

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::pki::CertificateAuthority;
use crate::trust_store::TrustMaterial;
use crate::Error;

/// Decide whether the trust material must be regenerated.
///
/// Evaluated in order: generation disabled never rotates, missing material
/// rotates, unparsable material rotates, material failing validation or not
/// issued by the stored CA rotates, anything else is kept.
pub fn should_rotate(
    current: Option<&TrustMaterial>,
    auto_generate: bool,
    expiration_threshold: Duration,
    authority: &dyn CertificateAuthority,
) -> bool {
    if !auto_generate {
        info!("skipping TLS certificate generation as it is disabled");
        return false;
    }

    let Some(material) = current else {
        info!("no trust material stored, generating");
        return true;
    };

    let parsed = match authority.parse_cert_and_key(&material.certificate, &material.private_key)
    {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "stored certificate does not parse, generating new one");
            return true;
        }
    };

    if let Err(e) = authority.validate(&parsed, expiration_threshold) {
        warn!(error = %e, "failed to validate certificate, generating new one");
        return true;
    }

    if let Err(e) = authority.verify_issued_by(&material.certificate, &material.ca_certificate) {
        warn!(error = %e, "certificate not issued by stored CA, generating new one");
        return true;
    }

    debug!(
        not_after = %parsed.not_after,
        "skipping TLS certificate generation as it is still valid"
    );
    false
}

/// Issue a fresh CA and a leaf for `dns_name` valid for `validity`.
///
/// Nothing is written here; a failure leaves the stored material untouched.
pub fn regenerate(
    authority: &dyn CertificateAuthority,
    dns_name: &str,
    validity: Duration,
) -> Result<TrustMaterial, Error> {
    let ca = authority
        .generate_ca()
        .map_err(|e| Error::generation(format!("CA: {}", e)))?;

    let validity = TimeDelta::from_std(validity)
        .map_err(|e| Error::generation(format!("invalid validity: {}", e)))?;

    let leaf = authority
        .generate_leaf(&ca, Utc::now() + validity, dns_name)
        .map_err(|e| Error::generation(format!("leaf for {}: {}", dns_name, e)))?;

    Ok(TrustMaterial {
        certificate: leaf.cert_pem.into_bytes(),
        private_key: leaf.key_pem.into_bytes(),
        ca_certificate: ca.cert_pem.into_bytes(),
    })
}
