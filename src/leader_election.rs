//! Lease-based leadership for HA deployments.
//!
//! A standby replica must never run the cluster controller concurrently
//! with the active one: the apply engine reads-then-writes children without
//! optimistic-lock loops and assumes at most one reconcile per cluster at a
//! time. Since the operator runs a single controller, leadership is modeled
//! as one guard held for the life of the process: [`LeaderLease::acquire`]
//! blocks until the `coordination.k8s.io/v1` Lease is ours, [`LeaderLease::hold`]
//! keeps renewing it and resolves only when leadership is lost (the caller
//! treats that as a shutdown signal), and [`LeaderLease::release`] clears
//! the holder on shutdown so a standby takes over without waiting for the
//! lease to expire.

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const LEASE_NAME: &str = "osrm-operator-leader";
const LEASE_DURATION_SECS: i32 = 30;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const ACQUIRE_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Leadership guard backed by a Kubernetes Lease claimed with optimistic
/// concurrency (resourceVersion on replace, name conflict on create).
pub struct LeaderLease {
    api: Api<Lease>,
    identity: String,
}

impl LeaderLease {
    /// Resolves the Lease namespace (explicit flag, else the in-cluster
    /// service account namespace, else `default`) and the holder identity
    /// (pod name, else hostname, else a random suffix).
    pub fn new(client: Client, explicit_namespace: &str) -> Self {
        let namespace = if explicit_namespace.is_empty() {
            std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| "default".to_string())
        } else {
            explicit_namespace.to_string()
        };
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("osrm-operator-{:08x}", rand::random::<u32>()));
        info!(identity = %identity, namespace = %namespace, "Initialized leader lease");
        Self {
            api: Api::namespaced(client, &namespace),
            identity,
        }
    }

    /// Blocks until this replica holds the lease.
    pub async fn acquire(&self) -> anyhow::Result<()> {
        info!(identity = %self.identity, "Waiting for leader lease '{}'", LEASE_NAME);
        loop {
            match self.try_claim().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Acquired leader lease");
                    return Ok(());
                }
                Ok(false) => {
                    debug!(
                        "Lease held by another replica, retrying in {:?}",
                        ACQUIRE_RETRY_INTERVAL
                    );
                }
                Err(e) => {
                    warn!(
                        "Lease claim failed: {}, retrying in {:?}",
                        e, ACQUIRE_RETRY_INTERVAL
                    );
                }
            }
            tokio::time::sleep(ACQUIRE_RETRY_INTERVAL).await;
        }
    }

    /// Renews the lease on an interval; resolves only when leadership is
    /// lost. Transient API failures are tolerated until the lease duration
    /// elapses without a successful renewal, at which point another replica
    /// may already have taken over and this one must stand down.
    pub async fn hold(&self) {
        let mut last_renewal = Utc::now();
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            match self.try_claim().await {
                Ok(true) => {
                    last_renewal = Utc::now();
                    debug!("Renewed leader lease");
                }
                Ok(false) => {
                    warn!("Leader lease taken over by another replica");
                    return;
                }
                Err(e) => {
                    warn!("Lease renewal failed: {}", e);
                    let since = Utc::now().signed_duration_since(last_renewal).num_seconds();
                    if since > LEASE_DURATION_SECS as i64 {
                        warn!("Leader lease presumed lost after {}s without renewal", since);
                        return;
                    }
                }
            }
        }
    }

    /// Clears the holder so a standby acquires without waiting for expiry.
    pub async fn release(&self) {
        let mut lease = match self.api.get_opt(LEASE_NAME).await {
            Ok(Some(lease)) if held_by(&lease, &self.identity) => lease,
            Ok(_) => {
                debug!("Lease not held by us, skipping release");
                return;
            }
            Err(e) => {
                warn!("Failed to read lease for release: {}", e);
                return;
            }
        };

        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
        }
        match self
            .api
            .replace(LEASE_NAME, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => info!("Released leader lease"),
            Err(e) => warn!("Failed to release leader lease: {}", e),
        }
    }

    /// One claim attempt: renew when we already hold the lease, take it
    /// over when it is absent or expired, back off when another replica
    /// holds a live one.
    async fn try_claim(&self) -> anyhow::Result<bool> {
        let now = MicroTime(Utc::now());

        let previous = match self.api.get_opt(LEASE_NAME).await? {
            Some(lease) if held_by(&lease, &self.identity) || lease_expired(&lease, &now.0) => {
                Some(lease)
            }
            Some(_) => return Ok(false),
            None => None,
        };

        let desired = desired_lease(&self.identity, previous.as_ref(), &now);
        let result = match &previous {
            Some(_) => {
                self.api
                    .replace(LEASE_NAME, &PostParams::default(), &desired)
                    .await
            }
            None => self.api.create(&PostParams::default(), &desired).await,
        };

        match result {
            Ok(_) => Ok(true),
            // Another replica won the race
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn held_by(lease: &Lease, identity: &str) -> bool {
    lease
        .spec
        .as_ref()
        .and_then(|s| s.holder_identity.as_deref())
        == Some(identity)
}

/// A lease with no renew time, or one renewed longer ago than its duration,
/// is up for grabs.
fn lease_expired(lease: &Lease, now: &DateTime<Utc>) -> bool {
    let spec = lease.spec.as_ref();
    let duration = spec
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or(LEASE_DURATION_SECS) as i64;
    match spec.and_then(|s| s.renew_time.as_ref()) {
        Some(MicroTime(renewed)) => now.signed_duration_since(*renewed).num_seconds() > duration,
        None => true,
    }
}

/// The lease state this replica wants: holder set to us, renew time now.
/// A renewal carries the previous acquire time and transition count; a
/// fresh claim or takeover stamps a new acquire time, and a takeover also
/// increments `leaseTransitions`.
fn desired_lease(identity: &str, previous: Option<&Lease>, now: &MicroTime) -> Lease {
    let prev_spec = previous.and_then(|l| l.spec.as_ref());
    let renewal = previous.map(|l| held_by(l, identity)).unwrap_or(false);
    let takeover = previous.is_some() && !renewal;
    let transitions = prev_spec.and_then(|s| s.lease_transitions).unwrap_or(0);

    let mut lease = previous.cloned().unwrap_or_default();
    lease.metadata.name = Some(LEASE_NAME.to_string());
    let labels = lease.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert("app.kubernetes.io/name".to_string(), "osrm".to_string());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "osrm-operator".to_string(),
    );
    lease.spec = Some(LeaseSpec {
        holder_identity: Some(identity.to_string()),
        lease_duration_seconds: Some(LEASE_DURATION_SECS),
        acquire_time: if renewal {
            prev_spec
                .and_then(|s| s.acquire_time.clone())
                .or_else(|| Some(now.clone()))
        } else {
            Some(now.clone())
        },
        renew_time: Some(now.clone()),
        lease_transitions: Some(if takeover { transitions + 1 } else { transitions }),
        preferred_holder: prev_spec.and_then(|s| s.preferred_holder.clone()),
        strategy: prev_spec.and_then(|s| s.strategy.clone()),
    });
    lease
}
