//! Sibling fleet discovery and notification
//!
//! Every replica of the operator mounts the trust secret. After a pass the
//! replicas sharing the reconciler's labels are stamped with a freshness
//! annotation so that anything watching them (kubelet secret sync, rollout
//! tooling) notices the new material. A second annotation records which
//! material the stamp refers to, so an unchanged trust root does not touch
//! the pods again.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::client::KubeClient;
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::Error;

/// Timestamp of the last notification, RFC3339 with nanoseconds
pub const UPDATED_ANNOTATION: &str = "trustroot.dev/updated";

/// Fingerprint of the trust material the pod was last notified about
pub const FINGERPRINT_ANNOTATION: &str = "trustroot.dev/trust-fingerprint";

/// A pod of the operator fleet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FleetMember {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Pod labels
    pub labels: BTreeMap<String, String>,
}

impl FleetMember {
    fn from_pod(pod: &Pod, fallback_namespace: &str) -> Self {
        Self {
            namespace: pod
                .namespace()
                .unwrap_or_else(|| fallback_namespace.to_string()),
            name: pod.name_any(),
            labels: pod.labels().clone(),
        }
    }
}

/// Finds the pods that should be notified after a pass
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FleetResolver: Send + Sync {
    /// The pod running this reconciler
    async fn resolve_self(&self) -> Result<FleetMember, Error>;

    /// Every pod sharing `member`'s labels, `member` included
    async fn list_peers(&self, member: &FleetMember) -> Result<Vec<FleetMember>, Error>;
}

/// Resolves the fleet from the pod named by the downward API
pub struct KubeFleetResolver {
    kube: Arc<dyn KubeClient>,
    pod_namespace: String,
    pod_name: String,
}

impl KubeFleetResolver {
    /// Resolver for the pod `pod_namespace/pod_name`
    pub fn new(
        kube: Arc<dyn KubeClient>,
        pod_namespace: impl Into<String>,
        pod_name: impl Into<String>,
    ) -> Self {
        Self {
            kube,
            pod_namespace: pod_namespace.into(),
            pod_name: pod_name.into(),
        }
    }
}

#[async_trait]
impl FleetResolver for KubeFleetResolver {
    async fn resolve_self(&self) -> Result<FleetMember, Error> {
        if self.pod_namespace.is_empty() || self.pod_name.is_empty() {
            return Err(Error::discovery("pod name or namespace is not set"));
        }

        let pod = self
            .kube
            .get_pod(&self.pod_namespace, &self.pod_name)
            .await
            .map_err(|e| {
                Error::discovery(format!(
                    "cannot read own pod {}/{}: {}",
                    self.pod_namespace, self.pod_name, e
                ))
            })?;

        let member = FleetMember::from_pod(&pod, &self.pod_namespace);
        // An empty selector would match every pod in the namespace
        if member.labels.is_empty() {
            return Err(Error::discovery(format!(
                "own pod {}/{} has no labels",
                member.namespace, member.name
            )));
        }
        Ok(member)
    }

    async fn list_peers(&self, member: &FleetMember) -> Result<Vec<FleetMember>, Error> {
        let pods = self
            .kube
            .list_pods(&member.namespace, &member.labels)
            .await
            .map_err(|e| Error::discovery(format!("cannot list sibling pods: {}", e)))?;

        Ok(pods
            .iter()
            .map(|pod| FleetMember::from_pod(pod, &member.namespace))
            .collect())
    }
}

/// Discover the members to notify.
///
/// Unless `require_fleet` is set, a discovery failure is logged and yields an
/// empty fleet so the rest of the pass can still converge.
pub async fn discover(
    resolver: &dyn FleetResolver,
    require_fleet: bool,
) -> Result<Vec<FleetMember>, Error> {
    let result = async {
        let me = resolver.resolve_self().await?;
        let mut peers = resolver.list_peers(&me).await?;
        if !peers.iter().any(|p| p.name == me.name && p.namespace == me.namespace) {
            peers.push(me);
        }
        Ok::<_, Error>(peers)
    }
    .await;

    match result {
        Ok(members) => {
            debug!(count = members.len(), "discovered fleet");
            Ok(members)
        }
        Err(e) if !require_fleet => {
            warn!(error = %e, "skipping fleet notification, discovery failed");
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

/// Short digest identifying a leaf and CA pair
///
/// First 8 bytes of SHA-256 over both certificates, hex encoded.
pub fn trust_fingerprint(certificate: &[u8], ca_certificate: &[u8]) -> String {
    use aws_lc_rs::digest;

    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(certificate);
    ctx.update(ca_certificate);
    let hash = ctx.finish();

    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Stamp `member` with the current time and `fingerprint`.
///
/// Pods already carrying `fingerprint` are left alone, as are pods deleted
/// since discovery.
pub async fn notify_member(
    kube: &dyn KubeClient,
    member: &FleetMember,
    fingerprint: &str,
    retry: &RetryConfig,
) -> Result<(), Error> {
    let namespace = member.namespace.as_str();
    let name = member.name.as_str();

    retry_on_conflict(retry, "notify_member", || async move {
        let mut pod = match kube.get_pod(namespace, name).await {
            Ok(pod) => pod,
            Err(e) if e.is_not_found() => {
                debug!(pod = %name, "pod vanished before notification");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if pod.annotations().get(FINGERPRINT_ANNOTATION).map(String::as_str) == Some(fingerprint)
        {
            debug!(pod = %name, "pod already notified about current trust material");
            return Ok(());
        }

        let annotations = pod.annotations_mut();
        annotations.insert(
            UPDATED_ANNOTATION.to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        );
        annotations.insert(FINGERPRINT_ANNOTATION.to_string(), fingerprint.to_string());

        match kube.replace_pod(&pod).await {
            Ok(_) => {
                info!(pod = %name, namespace = %namespace, "notified pod of new trust material");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(pod = %name, "pod vanished during notification");
                Ok(())
            }
            Err(e) => Err(e),
        }
    })
    .await
}
