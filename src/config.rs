//! Runtime configuration for the trust root controller
//!
//! Everything a reconciliation pass needs to know about names, durations and
//! the internal webhook endpoint lives in [`TrustConfig`]. The binary fills it
//! from CLI flags and environment variables; tests build it directly.

use std::time::Duration;

use crate::pki::CA_VALIDITY_DAYS;
use crate::retry::RetryConfig;
use crate::Error;

/// Remaining leaf lifetime under which the certificate is regenerated
pub const DEFAULT_EXPIRATION_THRESHOLD: Duration = Duration::from_secs(3 * 24 * 3600);

/// How long before expiry the controller schedules its own wake-up
pub const DEFAULT_RECONCILIATION_LOOKAHEAD: Duration = Duration::from_secs(4 * 24 * 3600);

/// Validity of a freshly issued leaf certificate (six 30-day months)
pub const DEFAULT_CERTIFICATE_VALIDITY: Duration = Duration::from_secs(180 * 24 * 3600);

/// Path of the conversion endpoint on the webhook service
pub const DEFAULT_CONVERSION_PATH: &str = "/convert";

/// Port of the webhook service
pub const DEFAULT_WEBHOOK_PORT: i32 = 443;

/// Trust root controller configuration
#[derive(Clone, Debug)]
pub struct TrustConfig {
    /// Namespace holding the trust secret and the webhook service
    pub namespace: String,
    /// Name of the trust secret
    pub secret_name: String,
    /// Whether the controller may generate certificates itself
    pub generate_certificates: bool,
    /// Name of the ValidatingWebhookConfiguration to keep in sync
    pub validating_webhook_configuration: String,
    /// Name of the MutatingWebhookConfiguration to keep in sync
    pub mutating_webhook_configuration: String,
    /// Name of the CustomResourceDefinition whose conversion block is managed
    pub crd_name: String,
    /// Name of the internal webhook Service
    pub service_name: String,
    /// Path of the conversion endpoint
    pub conversion_path: String,
    /// Port of the webhook Service
    pub service_port: i32,
    /// ConversionReview versions accepted by the conversion endpoint
    pub conversion_review_versions: Vec<String>,
    /// Regenerate when the leaf has less than this left
    pub expiration_threshold: Duration,
    /// Wake up this long before the leaf expires
    pub reconciliation_lookahead: Duration,
    /// Validity of newly issued leaf certificates
    pub certificate_validity: Duration,
    /// Fail the pass when the sibling fleet cannot be discovered
    pub require_fleet: bool,
    /// Conflict retry budget for every resource mutation
    pub retry: RetryConfig,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            namespace: "trustroot-system".to_string(),
            secret_name: "trustroot-tls".to_string(),
            generate_certificates: true,
            validating_webhook_configuration: "trustroot-validating-webhook-configuration"
                .to_string(),
            mutating_webhook_configuration: "trustroot-mutating-webhook-configuration"
                .to_string(),
            crd_name: "tenants.trustroot.dev".to_string(),
            service_name: "trustroot-webhook-service".to_string(),
            conversion_path: DEFAULT_CONVERSION_PATH.to_string(),
            service_port: DEFAULT_WEBHOOK_PORT,
            conversion_review_versions: vec!["v1alpha1".to_string(), "v1beta1".to_string()],
            expiration_threshold: DEFAULT_EXPIRATION_THRESHOLD,
            reconciliation_lookahead: DEFAULT_RECONCILIATION_LOOKAHEAD,
            certificate_validity: DEFAULT_CERTIFICATE_VALIDITY,
            require_fleet: false,
            retry: RetryConfig::default(),
        }
    }
}

impl TrustConfig {
    /// DNS name the leaf certificate is issued for
    pub fn service_dns_name(&self) -> String {
        format!("{}.{}.svc", self.service_name, self.namespace)
    }

    /// Reject configurations that cannot produce a working pass
    pub fn validate(&self) -> Result<(), Error> {
        let required = [
            ("namespace", &self.namespace),
            ("secret name", &self.secret_name),
            (
                "validating webhook configuration",
                &self.validating_webhook_configuration,
            ),
            (
                "mutating webhook configuration",
                &self.mutating_webhook_configuration,
            ),
            ("CRD name", &self.crd_name),
            ("service name", &self.service_name),
        ];
        for (what, value) in required {
            if value.is_empty() {
                return Err(Error::configuration(format!("{} must not be empty", what)));
            }
        }

        if !self.conversion_path.starts_with('/') {
            return Err(Error::configuration(format!(
                "conversion path '{}' must start with '/'",
                self.conversion_path
            )));
        }

        if !(1..=65535).contains(&self.service_port) {
            return Err(Error::configuration(format!(
                "service port {} out of range",
                self.service_port
            )));
        }

        if self.conversion_review_versions.is_empty() {
            return Err(Error::configuration(
                "at least one conversion review version is required",
            ));
        }

        if self.certificate_validity <= self.expiration_threshold {
            return Err(Error::configuration(format!(
                "certificate validity ({}s) must exceed the expiration threshold ({}s)",
                self.certificate_validity.as_secs(),
                self.expiration_threshold.as_secs()
            )));
        }

        // Leaves are issued by a CA created moments earlier and may not outlive it
        let ca_validity = Duration::from_secs(CA_VALIDITY_DAYS as u64 * 24 * 3600);
        if self.certificate_validity >= ca_validity {
            return Err(Error::configuration(format!(
                "certificate validity ({}s) must be shorter than the CA validity ({}s)",
                self.certificate_validity.as_secs(),
                ca_validity.as_secs()
            )));
        }

        Ok(())
    }
}
