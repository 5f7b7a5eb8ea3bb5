//! One reconciliation pass over the trust root

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument};

use super::{Context, TrustRootRef};
use crate::pki;
use crate::schedule::requeue_after;
use crate::trust_store::{self, CA_CERT_KEY, TLS_CERT_KEY};
use crate::{fleet, propagation, rotation, Error};

/// Delay before a failed pass is retried
pub const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Run one pass for `identity` and return when the next one is due.
///
/// The secret is written first and only when rotation is required. The CA
/// bundle then goes to both admission configurations, the CRD conversion
/// block and every fleet member in one fail-fast join: the first hard error
/// cancels whatever is still in flight.
#[instrument(skip(ctx), fields(secret = %identity))]
pub async fn reconcile_trust_root(
    ctx: &Context,
    identity: &TrustRootRef,
) -> Result<Option<Duration>, Error> {
    let config = &ctx.config;
    let kube = ctx.kube.as_ref();
    let authority = ctx.authority.as_ref();

    let stored = trust_store::load(kube, &identity.namespace, &identity.name).await?;

    let regenerated = if rotation::should_rotate(
        stored.material.as_ref(),
        config.generate_certificates,
        config.expiration_threshold,
        authority,
    ) {
        let fresh = rotation::regenerate(
            authority,
            &config.service_dns_name(),
            config.certificate_validity,
        )?;
        trust_store::persist(
            kube,
            &identity.namespace,
            &identity.name,
            &fresh,
            &config.retry,
        )
        .await?;
        Some(fresh)
    } else {
        None
    };

    let (certificate, ca_bundle): (&[u8], &[u8]) = match (&regenerated, &stored.material) {
        (Some(m), _) | (None, Some(m)) => (m.certificate.as_slice(), m.ca_bundle()),
        // Generation is disabled and the secret is managed elsewhere; only the
        // CA is needed to keep consumers in sync.
        (None, None) => {
            let ca = stored.ca_certificate().ok_or_else(|| Error::MissingField {
                secret: identity.name.clone(),
                field: CA_CERT_KEY.to_string(),
            })?;
            (stored.field(TLS_CERT_KEY).unwrap_or_default(), ca)
        }
    };

    let members = fleet::discover(ctx.fleet.as_ref(), config.require_fleet).await?;
    let fingerprint = fleet::trust_fingerprint(certificate, ca_bundle);

    let mut tasks: Vec<BoxFuture<'_, Result<(), Error>>> = vec![
        propagation::update_validating_webhooks(kube, config, ca_bundle).boxed(),
        propagation::update_mutating_webhooks(kube, config, ca_bundle).boxed(),
        propagation::update_conversion_webhook(kube, config, ca_bundle).boxed(),
    ];
    for member in &members {
        let fingerprint = fingerprint.as_str();
        tasks.push(
            async move {
                fleet::notify_member(kube, member, fingerprint, &config.retry)
                    .await
                    .map_err(|e| {
                        Error::propagation(format!("Pod/{}/{}", member.namespace, member.name), e)
                    })
            }
            .boxed(),
        );
    }
    try_join_all(tasks).await?;

    if !config.generate_certificates {
        info!(fleet = members.len(), "trust root propagated, waiting for changes");
        return Ok(None);
    }

    let not_after = pki::certificate_not_after(certificate)
        .map_err(|e| Error::certificate(format!("stored leaf: {}", e)))?;
    let requeue = requeue_after(
        true,
        not_after,
        Utc::now(),
        config.reconciliation_lookahead,
        config.expiration_threshold,
    );

    info!(
        rotated = regenerated.is_some(),
        fleet = members.len(),
        not_after = %not_after,
        requeue_secs = requeue.map(|d| d.as_secs()),
        "trust root reconciled"
    );
    Ok(requeue)
}

/// kube-rs entry point
///
/// The controller is keyed on the managed CRD, which exists for as long as the
/// operator is installed. The trust secret is re-read through the context's
/// identity, so a missing secret is bootstrapped instead of skipped.
pub async fn reconcile(
    trigger: Arc<CustomResourceDefinition>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let identity = ctx.trust_root();
    debug!(trigger = %trigger.name_any(), "reconciling trust root");

    match reconcile_trust_root(&ctx, &identity).await? {
        Some(after) => Ok(Action::requeue(after)),
        None => Ok(Action::await_change()),
    }
}

/// Error policy for the trust root controller
pub fn error_policy(
    trigger: Arc<CustomResourceDefinition>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    error!(
        ?error,
        secret = %ctx.trust_root(),
        trigger = %trigger.name_any(),
        "trust root reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}
