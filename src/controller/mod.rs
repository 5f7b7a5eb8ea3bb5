//! Trust root controller
//!
//! [`reconcile_trust_root`] runs one pass: read the trust secret, rotate the
//! material when needed, then push the CA bundle to every consumer and notify
//! the operator fleet. [`reconcile`] and [`error_policy`] adapt it to the
//! kube-rs controller runtime.

mod trust;

use std::fmt;
use std::sync::Arc;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::runtime::reflector::ObjectRef;
use kube::Client;

use crate::client::{KubeClient, KubeClientImpl};
use crate::config::TrustConfig;
use crate::fleet::{FleetResolver, KubeFleetResolver};
use crate::pki::{CertificateAuthority, RcgenAuthority};

pub use trust::{error_policy, reconcile, reconcile_trust_root, ERROR_REQUEUE};

/// Shared state for every reconciliation pass
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Issues and inspects certificates
    pub authority: Arc<dyn CertificateAuthority>,
    /// Finds the sibling pods to notify
    pub fleet: Arc<dyn FleetResolver>,
    /// Names, durations and retry budget
    pub config: TrustConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, config: TrustConfig) -> ContextBuilder {
        ContextBuilder::new(client, config)
    }

    /// Create a context from explicit collaborators
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        authority: Arc<dyn CertificateAuthority>,
        fleet: Arc<dyn FleetResolver>,
        config: TrustConfig,
    ) -> Self {
        Self {
            kube,
            authority,
            fleet,
            config,
        }
    }

    /// Identity of the trust secret this context reconciles
    pub fn trust_root(&self) -> TrustRootRef {
        TrustRootRef::from_config(&self.config)
    }
}

/// Object the controller is keyed on
///
/// Every watched event maps onto the managed CRD. Unlike the trust secret it
/// always exists while the operator is installed, so the runtime never drops a
/// pass for lack of a cached object.
pub fn trigger_ref(config: &TrustConfig) -> ObjectRef<CustomResourceDefinition> {
    ObjectRef::new(&config.crd_name)
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    config: TrustConfig,
    kube: Option<Arc<dyn KubeClient>>,
    authority: Option<Arc<dyn CertificateAuthority>>,
    fleet: Option<Arc<dyn FleetResolver>>,
    pod_namespace: String,
    pod_name: String,
}

impl ContextBuilder {
    fn new(client: Client, config: TrustConfig) -> Self {
        Self {
            client,
            config,
            kube: None,
            authority: None,
            fleet: None,
            pod_namespace: String::new(),
            pod_name: String::new(),
        }
    }

    /// Pod running this controller, used to discover the fleet
    pub fn fleet_pod(mut self, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        self.pod_namespace = namespace.into();
        self.pod_name = name.into();
        self
    }

    /// Override the Kubernetes client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the certificate authority
    pub fn authority(mut self, authority: Arc<dyn CertificateAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Override the fleet resolver
    pub fn fleet_resolver(mut self, fleet: Arc<dyn FleetResolver>) -> Self {
        self.fleet = Some(fleet);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let kube = self
            .kube
            .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone())));
        let fleet = self.fleet.unwrap_or_else(|| {
            Arc::new(KubeFleetResolver::new(
                kube.clone(),
                self.pod_namespace,
                self.pod_name,
            ))
        });

        Context {
            kube,
            authority: self
                .authority
                .unwrap_or_else(|| Arc::new(RcgenAuthority::default())),
            fleet,
            config: self.config,
        }
    }
}

/// Namespace and name of the trust secret
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TrustRootRef {
    /// Secret namespace
    pub namespace: String,
    /// Secret name
    pub name: String,
}

impl TrustRootRef {
    /// The trust secret named by `config`
    pub fn from_config(config: &TrustConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            name: config.secret_name.clone(),
        }
    }
}

impl fmt::Display for TrustRootRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
