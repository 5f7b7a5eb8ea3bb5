//! Reconciliation stories
//!
//! - `fake`: the in-memory cluster the stories run against
//! - `scenarios`: stories of how the trust root converges, stays quiet when
//!   nothing changed, and survives other writers
//! - `leadership`: stories of replicas sharing one trust root through the
//!   leader lease and the controller trigger

mod fake;
mod leadership;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, ServiceReference, ValidatingWebhook,
    ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceConversion, CustomResourceDefinition, CustomResourceDefinitionSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;

use trustroot::config::TrustConfig;
use trustroot::controller::Context;
use trustroot::fleet::KubeFleetResolver;
use trustroot::pki::RcgenAuthority;
use trustroot::retry::RetryConfig;

pub use fake::FakeCluster;

pub const NAMESPACE: &str = "trustroot-system";
pub const SELF_POD: &str = "trustroot-controller-0";
pub const SIBLING_POD: &str = "trustroot-controller-1";
pub const UNRELATED_POD: &str = "metrics-exporter";
pub const EXTERNAL_URL: &str = "https://policy.example.com/validate";

pub fn config() -> TrustConfig {
    TrustConfig {
        retry: RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        },
        ..Default::default()
    }
}

fn operator_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "trustroot".to_string()),
        ("control-plane".to_string(), "controller-manager".to_string()),
    ])
}

fn pod(name: &str, labels: BTreeMap<String, String>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn internal_client_config(path: &str) -> WebhookClientConfig {
    let config = config();
    WebhookClientConfig {
        service: Some(ServiceReference {
            namespace: config.namespace,
            name: config.service_name,
            path: Some(path.to_string()),
            port: Some(443),
        }),
        ca_bundle: None,
        url: None,
    }
}

fn external_client_config() -> WebhookClientConfig {
    WebhookClientConfig {
        service: None,
        ca_bundle: Some(ByteString(b"external-ca".to_vec())),
        url: Some(EXTERNAL_URL.to_string()),
    }
}

/// A cluster as the Helm chart leaves it: consumers without CA bundles, a
/// CRD without conversion, no trust secret and two operator replicas.
pub fn installed_cluster() -> Arc<FakeCluster> {
    let config = config();
    let cluster = Arc::new(FakeCluster::default());

    cluster.seed_validating(ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(config.validating_webhook_configuration.clone()),
            ..Default::default()
        },
        webhooks: Some(vec![
            ValidatingWebhook {
                name: "tenants.trustroot.dev".to_string(),
                client_config: internal_client_config("/validate-tenants"),
                admission_review_versions: vec!["v1".to_string()],
                side_effects: "None".to_string(),
                ..Default::default()
            },
            ValidatingWebhook {
                name: "policy.example.com".to_string(),
                client_config: external_client_config(),
                admission_review_versions: vec!["v1".to_string()],
                side_effects: "None".to_string(),
                ..Default::default()
            },
        ]),
    });

    cluster.seed_mutating(MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(config.mutating_webhook_configuration.clone()),
            ..Default::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: "owners.trustroot.dev".to_string(),
            client_config: internal_client_config("/mutate-owners"),
            admission_review_versions: vec!["v1".to_string()],
            side_effects: "None".to_string(),
            ..Default::default()
        }]),
    });

    cluster.seed_crd(CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some(config.crd_name.clone()),
            ..Default::default()
        },
        spec: CustomResourceDefinitionSpec {
            group: "trustroot.dev".to_string(),
            conversion: Some(CustomResourceConversion {
                strategy: "None".to_string(),
                webhook: None,
            }),
            ..Default::default()
        },
        status: None,
    });

    cluster.seed_pod(pod(SELF_POD, operator_labels()));
    cluster.seed_pod(pod(SIBLING_POD, operator_labels()));
    cluster.seed_pod(pod(
        UNRELATED_POD,
        BTreeMap::from([("app.kubernetes.io/name".to_string(), "metrics".to_string())]),
    ));

    cluster
}

/// Controller context running as `SELF_POD` against `cluster`
pub fn context(cluster: &Arc<FakeCluster>, config: TrustConfig) -> Context {
    context_as(cluster, config, SELF_POD)
}

/// Controller context running as `pod` against `cluster`
pub fn context_as(cluster: &Arc<FakeCluster>, config: TrustConfig, pod: &str) -> Context {
    let kube: Arc<dyn trustroot::client::KubeClient> = cluster.clone();
    let fleet = Arc::new(KubeFleetResolver::new(kube.clone(), NAMESPACE, pod));
    Context::for_testing(kube, Arc::new(RcgenAuthority::default()), fleet, config)
}
