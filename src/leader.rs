//! Leader election using Kubernetes Leases
//!
//! Every replica serves the webhooks, but only the replica holding the lease
//! runs the trust root controller. Passes are therefore serialized across the
//! fleet: two replicas never bootstrap or rotate the trust root at once.
//!
//! # Atomicity
//!
//! Acquire, renew, takeover and release are read-modify-write cycles on the
//! Lease conditioned on `resourceVersion`. If the lease changes between read
//! and write the API answers with a conflict and the attempt counts as lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::KubeClient;
use crate::Error;

/// Lease name used when none is configured
pub const DEFAULT_LEASE_NAME: &str = "trustroot-leader";

// Timing constants
const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    kube: Arc<dyn KubeClient>,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    /// Create a new leader elector with default timing (30s lease, 10s renew, 5s retry)
    pub fn new(
        kube: Arc<dyn KubeClient>,
        lease_name: &str,
        namespace: &str,
        identity: &str,
    ) -> Self {
        Self {
            kube,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override lease duration, renew interval and retry interval
    pub fn with_timing(
        mut self,
        lease_duration: Duration,
        renew_interval: Duration,
        retry_interval: Duration,
    ) -> Self {
        self.lease_duration = lease_duration;
        self.renew_interval = renew_interval;
        self.retry_interval = retry_interval;
        self
    }

    /// Whether this elector currently holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// The guard keeps renewing the lease; [`LeaderGuard::lost`] resolves
    /// when a renewal fails.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "Waiting for leadership..."
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    return self.create_guard();
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = self.retry_interval.as_secs(),
                        "Lease held by another, waiting..."
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.retry_interval.as_secs(),
                        "Failed to acquire lease, retrying..."
                    );
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    /// Try to acquire or renew the lease once
    ///
    /// Returns `Ok(false)` when another replica holds a live lease or won the
    /// race for it.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        self.try_acquire_or_renew_at(Utc::now()).await
    }

    async fn try_acquire_or_renew_at(&self, now: DateTime<Utc>) -> Result<bool, Error> {
        let existing = match self.kube.get_lease(&self.namespace, &self.lease_name).await {
            Ok(lease) => Some(lease),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let Some(lease) = existing else {
            return self.create_lease(now).await;
        };

        let spec = lease.spec.as_ref();
        let holder = spec.and_then(|s| s.holder_identity.as_deref());
        if holder == Some(self.identity.as_str()) {
            return self.renew_lease(lease, now).await;
        }

        // A released lease has no holder and is free immediately
        if holder.is_some() && !is_expired(spec, now) {
            return Ok(false);
        }

        let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
        self.take_over_lease(lease, now, transitions).await
    }

    async fn create_lease(&self, now: DateTime<Utc>) -> Result<bool, Error> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };

        match self.kube.create_lease(&lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "Created new lease");
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                debug!(identity = %self.identity, "Lease creation conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn renew_lease(&self, mut lease: Lease, now: DateTime<Utc>) -> Result<bool, Error> {
        if let Some(spec) = lease.spec.as_mut() {
            spec.renew_time = Some(MicroTime(now));
        }

        match self.kube.replace_lease(&lease).await {
            Ok(_) => {
                debug!(identity = %self.identity, "Lease renewed");
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                warn!(identity = %self.identity, "Lease renewal conflict - lost leadership");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn take_over_lease(
        &self,
        mut lease: Lease,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Result<bool, Error> {
        lease.spec = Some(LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions + 1),
            ..Default::default()
        });

        match self.kube.replace_lease(&lease).await {
            Ok(_) => {
                info!(
                    identity = %self.identity,
                    transitions = transitions + 1,
                    "Took over lease"
                );
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                debug!(identity = %self.identity, "Lease takeover conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.renew_interval).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "Leadership lost");
                    self.is_leader.store(false, Ordering::SeqCst);
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release_lease(&self) -> Result<(), Error> {
        let mut lease = match self.kube.get_lease(&self.namespace, &self.lease_name).await {
            Ok(lease) => lease,
            Err(e) if e.is_not_found() => {
                debug!(identity = %self.identity, "Lease not found, nothing to release");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
            spec.renew_time = Some(MicroTime(Utc::now() - chrono::Duration::seconds(60)));
        }

        match self.kube.replace_lease(&lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "Lease released for fast failover");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                debug!(identity = %self.identity, "Lease changed before release, leaving it");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn is_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
        _ => true,
    }
}

/// Guard that maintains leadership
///
/// The renewal task is aborted when the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Release leadership by clearing the lease holder
    ///
    /// Call during graceful shutdown so a standby takes over immediately.
    pub async fn release_leadership(&self) -> Result<(), Error> {
        self.renewal_task.abort();
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.renewal_task.abort();
        info!(identity = %self.elector.identity, "Leadership released");
    }
}
