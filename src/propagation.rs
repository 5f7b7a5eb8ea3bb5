//! CA bundle propagation to webhook and conversion consumers
//!
//! Three independent updates keep the consumers of the trust root in sync:
//!
//! - the ValidatingWebhookConfiguration,
//! - the MutatingWebhookConfiguration,
//! - the conversion block of the managed CustomResourceDefinition.
//!
//! Each one re-reads its object, applies only the field it owns and submits
//! the result conditioned on the read version. Webhooks that point at a URL or
//! at a different Service are left exactly as they were. When nothing would
//! change, nothing is submitted.

use k8s_openapi::api::admissionregistration::v1::WebhookClientConfig;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceConversion, ServiceReference as ConversionServiceReference,
    WebhookClientConfig as ConversionClientConfig, WebhookConversion,
};
use k8s_openapi::ByteString;
use tracing::{debug, info};

use crate::client::KubeClient;
use crate::config::TrustConfig;
use crate::retry::retry_on_conflict;
use crate::Error;

/// Conversion strategy that routes version conversion to a webhook
pub const WEBHOOK_CONVERSION_STRATEGY: &str = "Webhook";

/// Identifies the Service that serves the trust root's certificate
#[derive(Clone, Copy, Debug)]
pub struct InternalService<'a> {
    /// Service namespace
    pub namespace: &'a str,
    /// Service name
    pub name: &'a str,
}

impl<'a> InternalService<'a> {
    /// The webhook service named by `config`
    pub fn from_config(config: &'a TrustConfig) -> Self {
        Self {
            namespace: &config.namespace,
            name: &config.service_name,
        }
    }

    fn is_target_of(&self, client_config: &WebhookClientConfig) -> bool {
        client_config
            .service
            .as_ref()
            .is_some_and(|svc| svc.name == self.name && svc.namespace == self.namespace)
    }
}

/// Set `ca_bundle` on every client config that targets `service`.
///
/// Returns whether anything changed.
pub fn inject_ca_bundle<'c>(
    client_configs: impl IntoIterator<Item = &'c mut WebhookClientConfig>,
    service: InternalService<'_>,
    ca_bundle: &[u8],
) -> bool {
    let mut changed = false;
    for client_config in client_configs {
        if !service.is_target_of(client_config) {
            continue;
        }
        let current = client_config.ca_bundle.as_ref().map(|b| b.0.as_slice());
        if current != Some(ca_bundle) {
            client_config.ca_bundle = Some(ByteString(ca_bundle.to_vec()));
            changed = true;
        }
    }
    changed
}

/// The conversion block the managed CRD must carry
pub fn desired_conversion(config: &TrustConfig, ca_bundle: &[u8]) -> CustomResourceConversion {
    CustomResourceConversion {
        strategy: WEBHOOK_CONVERSION_STRATEGY.to_string(),
        webhook: Some(WebhookConversion {
            client_config: Some(ConversionClientConfig {
                service: Some(ConversionServiceReference {
                    namespace: config.namespace.clone(),
                    name: config.service_name.clone(),
                    path: Some(config.conversion_path.clone()),
                    port: Some(config.service_port),
                }),
                ca_bundle: Some(ByteString(ca_bundle.to_vec())),
                url: None,
            }),
            conversion_review_versions: config.conversion_review_versions.clone(),
        }),
    }
}

/// Bring the ValidatingWebhookConfiguration's internal webhooks up to date
pub async fn update_validating_webhooks(
    kube: &dyn KubeClient,
    config: &TrustConfig,
    ca_bundle: &[u8],
) -> Result<(), Error> {
    let name = config.validating_webhook_configuration.as_str();
    let service = InternalService::from_config(config);

    retry_on_conflict(&config.retry, "update_validating_webhooks", || async move {
        let mut vwc = kube.get_validating_webhook_configuration(name).await?;
        let changed = inject_ca_bundle(
            vwc.webhooks
                .iter_mut()
                .flatten()
                .map(|w| &mut w.client_config),
            service,
            ca_bundle,
        );
        if !changed {
            debug!(name = %name, "ValidatingWebhookConfiguration already up to date");
            return Ok(());
        }
        kube.replace_validating_webhook_configuration(&vwc).await?;
        info!(name = %name, "updated caBundle in ValidatingWebhookConfiguration");
        Ok(())
    })
    .await
    .map_err(|e| Error::propagation(format!("ValidatingWebhookConfiguration/{}", name), e))
}

/// Bring the MutatingWebhookConfiguration's internal webhooks up to date
pub async fn update_mutating_webhooks(
    kube: &dyn KubeClient,
    config: &TrustConfig,
    ca_bundle: &[u8],
) -> Result<(), Error> {
    let name = config.mutating_webhook_configuration.as_str();
    let service = InternalService::from_config(config);

    retry_on_conflict(&config.retry, "update_mutating_webhooks", || async move {
        let mut mwc = kube.get_mutating_webhook_configuration(name).await?;
        let changed = inject_ca_bundle(
            mwc.webhooks
                .iter_mut()
                .flatten()
                .map(|w| &mut w.client_config),
            service,
            ca_bundle,
        );
        if !changed {
            debug!(name = %name, "MutatingWebhookConfiguration already up to date");
            return Ok(());
        }
        kube.replace_mutating_webhook_configuration(&mwc).await?;
        info!(name = %name, "updated caBundle in MutatingWebhookConfiguration");
        Ok(())
    })
    .await
    .map_err(|e| Error::propagation(format!("MutatingWebhookConfiguration/{}", name), e))
}

/// Point the managed CRD's conversion at the internal webhook
// Charts usually ship the CRD with strategy None since they cannot template
// the CA bundle into it; the controller fills in the webhook here.
pub async fn update_conversion_webhook(
    kube: &dyn KubeClient,
    config: &TrustConfig,
    ca_bundle: &[u8],
) -> Result<(), Error> {
    let name = config.crd_name.as_str();
    let desired = desired_conversion(config, ca_bundle);
    let desired = &desired;

    retry_on_conflict(&config.retry, "update_conversion_webhook", || async move {
        let mut crd = kube.get_custom_resource_definition(name).await?;
        if crd.spec.conversion.as_ref() == Some(desired) {
            debug!(name = %name, "CustomResourceDefinition conversion already up to date");
            return Ok(());
        }
        crd.spec.conversion = Some(desired.clone());
        kube.replace_custom_resource_definition(&crd).await?;
        info!(name = %name, "updated conversion webhook in CustomResourceDefinition");
        Ok(())
    })
    .await
    .map_err(|e| Error::propagation(format!("CustomResourceDefinition/{}", name), e))
}
