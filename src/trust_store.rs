//! Trust secret accessor
//!
//! The trust secret holds the serving certificate, its key and the CA
//! certificate under the standard `tls.crt`, `tls.key` and `ca.crt` keys.
//! A regeneration always writes all three in a single request.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use tracing::{debug, info};

use crate::client::KubeClient;
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::Error;

/// Data key of the serving certificate
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Data key of the serving private key
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";
/// Data key of the CA certificate
pub const CA_CERT_KEY: &str = "ca.crt";

/// Certificate, key and CA as stored in the trust secret
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustMaterial {
    /// PEM encoded serving certificate
    pub certificate: Vec<u8>,
    /// PEM encoded serving private key
    pub private_key: Vec<u8>,
    /// PEM encoded CA certificate, distributed as the CA bundle
    pub ca_certificate: Vec<u8>,
}

impl TrustMaterial {
    /// Read material from a secret
    ///
    /// Returns `None` when any of the three keys is missing or empty.
    pub fn from_secret(secret: &Secret) -> Option<Self> {
        let data = secret.data.as_ref()?;
        let field = |key: &str| {
            data.get(key)
                .map(|b| b.0.clone())
                .filter(|bytes| !bytes.is_empty())
        };

        Some(Self {
            certificate: field(TLS_CERT_KEY)?,
            private_key: field(TLS_PRIVATE_KEY_KEY)?,
            ca_certificate: field(CA_CERT_KEY)?,
        })
    }

    /// The three data entries as stored in the secret
    pub fn to_data(&self) -> BTreeMap<String, ByteString> {
        BTreeMap::from([
            (
                TLS_CERT_KEY.to_string(),
                ByteString(self.certificate.clone()),
            ),
            (
                TLS_PRIVATE_KEY_KEY.to_string(),
                ByteString(self.private_key.clone()),
            ),
            (
                CA_CERT_KEY.to_string(),
                ByteString(self.ca_certificate.clone()),
            ),
        ])
    }

    /// The CA bundle handed to every consumer
    pub fn ca_bundle(&self) -> &[u8] {
        &self.ca_certificate
    }
}

/// Current state of the trust secret
#[derive(Clone, Debug, Default)]
pub struct StoredTrust {
    /// The secret as read, `None` when it does not exist yet
    pub secret: Option<Secret>,
    /// Complete material, `None` when the secret is absent or incomplete
    pub material: Option<TrustMaterial>,
}

impl StoredTrust {
    /// Raw value of `key`, present even when the material is incomplete
    pub fn field(&self, key: &str) -> Option<&[u8]> {
        self.secret
            .as_ref()
            .and_then(|s| s.data.as_ref())
            .and_then(|d| d.get(key))
            .map(|b| b.0.as_slice())
            .filter(|bytes| !bytes.is_empty())
    }

    /// The stored CA certificate, complete material or not
    pub fn ca_certificate(&self) -> Option<&[u8]> {
        self.field(CA_CERT_KEY)
    }
}

/// Read the trust secret, treating a missing secret as empty
pub async fn load(kube: &dyn KubeClient, namespace: &str, name: &str) -> Result<StoredTrust, Error> {
    match kube.get_secret(namespace, name).await {
        Ok(secret) => {
            let material = TrustMaterial::from_secret(&secret);
            debug!(
                secret = %name,
                complete = material.is_some(),
                "loaded trust secret"
            );
            Ok(StoredTrust {
                secret: Some(secret),
                material,
            })
        }
        Err(e) if e.is_not_found() => {
            debug!(secret = %name, "trust secret does not exist yet");
            Ok(StoredTrust::default())
        }
        Err(e) => Err(e),
    }
}

/// Write `material` as the trust secret's data
///
/// Creates the secret when absent. Otherwise re-reads it and replaces only
/// `data`, keeping labels, annotations, owner references and type. The whole
/// cycle restarts on conflict.
pub async fn persist(
    kube: &dyn KubeClient,
    namespace: &str,
    name: &str,
    material: &TrustMaterial,
    retry: &RetryConfig,
) -> Result<Secret, Error> {
    let data = material.to_data();
    let data = &data;

    let secret = retry_on_conflict(retry, "persist_trust_secret", || async move {
        match kube.get_secret(namespace, name).await {
            Ok(mut existing) => {
                existing.data = Some(data.clone());
                existing.string_data = None;
                kube.replace_secret(&existing).await
            }
            Err(e) if e.is_not_found() => {
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(namespace.to_string()),
                        ..Default::default()
                    },
                    type_: Some("kubernetes.io/tls".to_string()),
                    data: Some(data.clone()),
                    ..Default::default()
                };
                kube.create_secret(&secret).await
            }
            Err(e) => Err(e),
        }
    })
    .await?;

    info!(secret = %name, namespace = %namespace, "persisted trust material");
    Ok(secret)
}
