//! Stories of replicas sharing one trust root

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;

use trustroot::controller::{reconcile, reconcile_trust_root, trigger_ref};
use trustroot::leader::{LeaderElector, DEFAULT_LEASE_NAME};

use super::*;

/// One replica's life: wait for the lease, run a pass, hand the lease back
async fn lead_one_pass(cluster: Arc<FakeCluster>, pod: &'static str) -> Option<Duration> {
    let ctx = context_as(&cluster, config(), pod);
    let elector = Arc::new(
        LeaderElector::new(ctx.kube.clone(), DEFAULT_LEASE_NAME, NAMESPACE, pod).with_timing(
            Duration::from_secs(30),
            Duration::from_secs(10),
            Duration::from_millis(5),
        ),
    );

    let guard = elector.clone().acquire().await;
    let requeue = reconcile_trust_root(&ctx, &ctx.trust_root())
        .await
        .expect("pass should succeed while leading");
    guard
        .release_leadership()
        .await
        .expect("lease release should succeed");
    requeue
}

/// Story: both replicas start against a fresh install. Only one of them may
/// issue a CA; the other must find the material already in place and leave
/// the secret alone.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_racing_replicas_issue_a_single_trust_root() {
    for _ in 0..20 {
        let cluster = installed_cluster();
        let config = config();

        let first = tokio::spawn(lead_one_pass(cluster.clone(), SELF_POD));
        let second = tokio::spawn(lead_one_pass(cluster.clone(), SIBLING_POD));
        let (first, second) = (first.await.unwrap(), second.await.unwrap());
        assert!(first.is_some() && second.is_some());

        // Created once, never replaced
        let secret = cluster
            .secret(&config.namespace, &config.secret_name)
            .expect("trust secret should exist");
        assert_eq!(secret.metadata.resource_version.as_deref(), Some("1"));

        let lease = cluster
            .lease(NAMESPACE, DEFAULT_LEASE_NAME)
            .expect("lease should exist");
        let spec = lease.spec.expect("lease spec");
        assert_eq!(spec.holder_identity, None);
        assert_eq!(spec.lease_transitions, Some(1));
    }
}

/// Story: the chart is installed and no trust secret exists yet. The event
/// that starts the controller comes from the managed CRD, and that pass must
/// create the secret rather than wait for it.
#[tokio::test]
async fn story_missing_secret_is_bootstrapped_from_the_crd_trigger() {
    let cluster = installed_cluster();
    let config = config();
    assert!(cluster
        .secret(&config.namespace, &config.secret_name)
        .is_none());

    let crd = cluster.crd(&config.crd_name);
    assert_eq!(trigger_ref(&config), ObjectRef::from_obj(&crd));

    let ctx = Arc::new(context(&cluster, config.clone()));
    let action = reconcile(Arc::new(crd), ctx)
        .await
        .expect("bootstrap pass should succeed");
    assert_ne!(action, Action::await_change());

    let secret = cluster
        .secret(&config.namespace, &config.secret_name)
        .expect("bootstrap should create the trust secret");
    assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/tls"));
}
