//! Kubernetes resource store used by the reconciler
//!
//! Writes go through `replace`, which the API server only accepts when the
//! submitted `metadata.resourceVersion` still matches the stored object.
//! Rejections come back as [`Error::Conflict`] so callers can restart their
//! read-modify-write cycle; missing objects come back as [`Error::NotFound`].

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Typed access to the resources a reconciliation pass reads and writes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch a Secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, Error>;

    /// Create a Secret; fails with a conflict when it already exists
    async fn create_secret(&self, secret: &Secret) -> Result<Secret, Error>;

    /// Replace a Secret, conditioned on its resourceVersion
    async fn replace_secret(&self, secret: &Secret) -> Result<Secret, Error>;

    /// Fetch a ValidatingWebhookConfiguration
    async fn get_validating_webhook_configuration(
        &self,
        name: &str,
    ) -> Result<ValidatingWebhookConfiguration, Error>;

    /// Replace a ValidatingWebhookConfiguration, conditioned on its resourceVersion
    async fn replace_validating_webhook_configuration(
        &self,
        config: &ValidatingWebhookConfiguration,
    ) -> Result<ValidatingWebhookConfiguration, Error>;

    /// Fetch a MutatingWebhookConfiguration
    async fn get_mutating_webhook_configuration(
        &self,
        name: &str,
    ) -> Result<MutatingWebhookConfiguration, Error>;

    /// Replace a MutatingWebhookConfiguration, conditioned on its resourceVersion
    async fn replace_mutating_webhook_configuration(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<MutatingWebhookConfiguration, Error>;

    /// Fetch a CustomResourceDefinition
    async fn get_custom_resource_definition(
        &self,
        name: &str,
    ) -> Result<CustomResourceDefinition, Error>;

    /// Replace a CustomResourceDefinition, conditioned on its resourceVersion
    async fn replace_custom_resource_definition(
        &self,
        crd: &CustomResourceDefinition,
    ) -> Result<CustomResourceDefinition, Error>;

    /// Fetch a Pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, Error>;

    /// List Pods in `namespace` carrying every label in `labels`
    async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, Error>;

    /// Replace a Pod, conditioned on its resourceVersion
    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, Error>;

    /// Fetch a Lease
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease, Error>;

    /// Create a Lease; fails with a conflict when it already exists
    async fn create_lease(&self, lease: &Lease) -> Result<Lease, Error>;

    /// Replace a Lease, conditioned on its resourceVersion
    async fn replace_lease(&self, lease: &Lease) -> Result<Lease, Error>;
}

/// Render a label map as an equality-based selector
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// `namespace/name` or just `name` for cluster-scoped objects
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.meta().namespace.as_deref() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

async fn get_object<K>(api: Api<K>, kind: &str, key: &str, name: &str) -> Result<K, Error>
where
    K: Clone + DeserializeOwned + Debug,
{
    api.get(name)
        .await
        .map_err(|e| Error::from_api(kind, key, e))
}

async fn replace_object<K>(api: Api<K>, kind: &str, obj: &K) -> Result<K, Error>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    let key = object_key(obj);
    api.replace(&obj.name_any(), &PostParams::default(), obj)
        .await
        .map_err(|e| Error::from_api(kind, &key, e))
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        get_object(api, "Secret", &format!("{}/{}", namespace, name), name).await
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, Error> {
        let namespace = secret
            .namespace()
            .ok_or_else(|| Error::configuration("secret has no namespace"))?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), secret)
            .await
            .map_err(|e| Error::from_api("Secret", &object_key(secret), e))
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret, Error> {
        let namespace = secret
            .namespace()
            .ok_or_else(|| Error::configuration("secret has no namespace"))?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        replace_object(api, "Secret", secret).await
    }

    async fn get_validating_webhook_configuration(
        &self,
        name: &str,
    ) -> Result<ValidatingWebhookConfiguration, Error> {
        let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
        get_object(api, "ValidatingWebhookConfiguration", name, name).await
    }

    async fn replace_validating_webhook_configuration(
        &self,
        config: &ValidatingWebhookConfiguration,
    ) -> Result<ValidatingWebhookConfiguration, Error> {
        let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
        replace_object(api, "ValidatingWebhookConfiguration", config).await
    }

    async fn get_mutating_webhook_configuration(
        &self,
        name: &str,
    ) -> Result<MutatingWebhookConfiguration, Error> {
        let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        get_object(api, "MutatingWebhookConfiguration", name, name).await
    }

    async fn replace_mutating_webhook_configuration(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<MutatingWebhookConfiguration, Error> {
        let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        replace_object(api, "MutatingWebhookConfiguration", config).await
    }

    async fn get_custom_resource_definition(
        &self,
        name: &str,
    ) -> Result<CustomResourceDefinition, Error> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        get_object(api, "CustomResourceDefinition", name, name).await
    }

    async fn replace_custom_resource_definition(
        &self,
        crd: &CustomResourceDefinition,
    ) -> Result<CustomResourceDefinition, Error> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        replace_object(api, "CustomResourceDefinition", crd).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        get_object(api, "Pod", &format!("{}/{}", namespace, name), name).await
    }

    async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&label_selector(labels));
        let pods = api.list(&params).await?;
        Ok(pods.items)
    }

    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        let namespace = pod
            .namespace()
            .ok_or_else(|| Error::configuration("pod has no namespace"))?;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        replace_object(api, "Pod", pod).await
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease, Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        get_object(api, "Lease", &format!("{}/{}", namespace, name), name).await
    }

    async fn create_lease(&self, lease: &Lease) -> Result<Lease, Error> {
        let namespace = lease
            .namespace()
            .ok_or_else(|| Error::configuration("lease has no namespace"))?;
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), lease)
            .await
            .map_err(|e| Error::from_api("Lease", &object_key(lease), e))
    }

    async fn replace_lease(&self, lease: &Lease) -> Result<Lease, Error> {
        let namespace = lease
            .namespace()
            .ok_or_else(|| Error::configuration("lease has no namespace"))?;
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &namespace);
        replace_object(api, "Lease", lease).await
    }
}
