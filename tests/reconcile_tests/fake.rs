//! In-memory stand-in for the Kubernetes API
//!
//! Objects get a numeric `resourceVersion` that is bumped on every write.
//! `replace` with a stale version fails with a conflict, `create` of an
//! existing object fails with a conflict and missing objects are not found.
//! Interference hooks let a test play another writer that sneaks in between
//! the controller's read and its write.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Resource, ResourceExt};

use trustroot::client::{object_key, KubeClient};
use trustroot::Error;

type Interference<K> = Box<dyn FnMut(&mut K) + Send>;

struct Store<K> {
    kind: &'static str,
    objects: BTreeMap<String, K>,
    /// Runs against the stored object right before a replace is checked
    interference: Option<(usize, Interference<K>)>,
}

impl<K> Store<K>
where
    K: Resource + Clone,
{
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            objects: BTreeMap::new(),
            interference: None,
        }
    }

    fn get(&self, key: &str) -> Result<K, Error> {
        self.objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(self.kind, key))
    }

    fn insert(&mut self, mut obj: K) -> K {
        obj.meta_mut().resource_version = Some("1".to_string());
        self.objects.insert(object_key(&obj), obj.clone());
        obj
    }

    fn create(&mut self, obj: &K) -> Result<K, Error> {
        let key = object_key(obj);
        if self.objects.contains_key(&key) {
            return Err(Error::conflict(self.kind, key));
        }
        Ok(self.insert(obj.clone()))
    }

    fn replace(&mut self, obj: &K) -> Result<K, Error> {
        let key = object_key(obj);
        let kind = self.kind;

        if let Some((remaining, interfere)) = self.interference.as_mut() {
            if let Some(stored) = self.objects.get_mut(&key) {
                interfere(stored);
                bump(stored);
                *remaining -= 1;
            }
            if *remaining == 0 {
                self.interference = None;
            }
        }

        let stored = self
            .objects
            .get_mut(&key)
            .ok_or_else(|| Error::not_found(kind, &key))?;
        if stored.meta().resource_version != obj.meta().resource_version {
            return Err(Error::conflict(kind, key));
        }

        let mut next = obj.clone();
        next.meta_mut().resource_version = stored.meta().resource_version.clone();
        bump(&mut next);
        *stored = next.clone();
        Ok(next)
    }
}

fn bump<K: Resource>(obj: &mut K) {
    let next = obj
        .meta()
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    obj.meta_mut().resource_version = Some(next.to_string());
}

/// In-memory cluster implementing [`KubeClient`]
pub struct FakeCluster {
    secrets: Mutex<Store<Secret>>,
    validating: Mutex<Store<ValidatingWebhookConfiguration>>,
    mutating: Mutex<Store<MutatingWebhookConfiguration>>,
    crds: Mutex<Store<CustomResourceDefinition>>,
    pods: Mutex<Store<Pod>>,
    leases: Mutex<Store<Lease>>,
    writes: AtomicUsize,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self {
            secrets: Mutex::new(Store::new("Secret")),
            validating: Mutex::new(Store::new("ValidatingWebhookConfiguration")),
            mutating: Mutex::new(Store::new("MutatingWebhookConfiguration")),
            crds: Mutex::new(Store::new("CustomResourceDefinition")),
            pods: Mutex::new(Store::new("Pod")),
            leases: Mutex::new(Store::new("Lease")),
            writes: AtomicUsize::new(0),
        }
    }
}

impl FakeCluster {
    /// Successful creates and replaces issued through the client, leases excluded
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn count<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        if result.is_ok() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    pub fn seed_secret(&self, secret: Secret) {
        self.secrets.lock().unwrap().insert(secret);
    }

    pub fn seed_validating(&self, config: ValidatingWebhookConfiguration) {
        self.validating.lock().unwrap().insert(config);
    }

    pub fn seed_mutating(&self, config: MutatingWebhookConfiguration) {
        self.mutating.lock().unwrap().insert(config);
    }

    pub fn seed_crd(&self, crd: CustomResourceDefinition) {
        self.crds.lock().unwrap().insert(crd);
    }

    pub fn seed_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().insert(pod);
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.secrets
            .lock()
            .unwrap()
            .get(&format!("{}/{}", namespace, name))
            .ok()
    }

    pub fn validating(&self, name: &str) -> ValidatingWebhookConfiguration {
        self.validating.lock().unwrap().get(name).unwrap()
    }

    pub fn mutating(&self, name: &str) -> MutatingWebhookConfiguration {
        self.mutating.lock().unwrap().get(name).unwrap()
    }

    pub fn crd(&self, name: &str) -> CustomResourceDefinition {
        self.crds.lock().unwrap().get(name).unwrap()
    }

    pub fn lease(&self, namespace: &str, name: &str) -> Option<Lease> {
        self.leases
            .lock()
            .unwrap()
            .get(&format!("{}/{}", namespace, name))
            .ok()
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Pod {
        self.pods
            .lock()
            .unwrap()
            .get(&format!("{}/{}", namespace, name))
            .unwrap()
    }

    /// Let another writer modify the ValidatingWebhookConfiguration right
    /// before each of the next `times` replaces
    pub fn interfere_with_validating(
        &self,
        times: usize,
        f: impl FnMut(&mut ValidatingWebhookConfiguration) + Send + 'static,
    ) {
        self.validating.lock().unwrap().interference = Some((times, Box::new(f)));
    }

    /// Let another writer modify a Pod right before each of the next `times` replaces
    pub fn interfere_with_pods(&self, times: usize, f: impl FnMut(&mut Pod) + Send + 'static) {
        self.pods.lock().unwrap().interference = Some((times, Box::new(f)));
    }
}

#[async_trait]
impl KubeClient for FakeCluster {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, Error> {
        self.secrets
            .lock()
            .unwrap()
            .get(&format!("{}/{}", namespace, name))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, Error> {
        let result = self.secrets.lock().unwrap().create(secret);
        self.count(result)
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret, Error> {
        let result = self.secrets.lock().unwrap().replace(secret);
        self.count(result)
    }

    async fn get_validating_webhook_configuration(
        &self,
        name: &str,
    ) -> Result<ValidatingWebhookConfiguration, Error> {
        self.validating.lock().unwrap().get(name)
    }

    async fn replace_validating_webhook_configuration(
        &self,
        config: &ValidatingWebhookConfiguration,
    ) -> Result<ValidatingWebhookConfiguration, Error> {
        let result = self.validating.lock().unwrap().replace(config);
        self.count(result)
    }

    async fn get_mutating_webhook_configuration(
        &self,
        name: &str,
    ) -> Result<MutatingWebhookConfiguration, Error> {
        self.mutating.lock().unwrap().get(name)
    }

    async fn replace_mutating_webhook_configuration(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<MutatingWebhookConfiguration, Error> {
        let result = self.mutating.lock().unwrap().replace(config);
        self.count(result)
    }

    async fn get_custom_resource_definition(
        &self,
        name: &str,
    ) -> Result<CustomResourceDefinition, Error> {
        self.crds.lock().unwrap().get(name)
    }

    async fn replace_custom_resource_definition(
        &self,
        crd: &CustomResourceDefinition,
    ) -> Result<CustomResourceDefinition, Error> {
        let result = self.crds.lock().unwrap().replace(crd);
        self.count(result)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, Error> {
        self.pods
            .lock()
            .unwrap()
            .get(&format!("{}/{}", namespace, name))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, Error> {
        let pods = self.pods.lock().unwrap();
        Ok(pods
            .objects
            .values()
            .filter(|pod| pod.namespace().as_deref() == Some(namespace))
            .filter(|pod| {
                let own = pod.labels();
                labels.iter().all(|(k, v)| own.get(k) == Some(v))
            })
            .cloned()
            .collect())
    }

    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        let result = self.pods.lock().unwrap().replace(pod);
        self.count(result)
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease, Error> {
        self.leases
            .lock()
            .unwrap()
            .get(&format!("{}/{}", namespace, name))
    }

    async fn create_lease(&self, lease: &Lease) -> Result<Lease, Error> {
        self.leases.lock().unwrap().create(lease)
    }

    async fn replace_lease(&self, lease: &Lease) -> Result<Lease, Error> {
        self.leases.lock().unwrap().replace(lease)
    }
}
