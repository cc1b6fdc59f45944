//! Observed child state and status aggregation
//!
//! `ObservedChildren` is a read-only snapshot of every child the operator
//! owns for one cluster; the readiness predicates over it feed the builder
//! gates. `aggregate_status` is a pure fold from the snapshot plus the apply
//! outcome into the cluster's status, so the whole derivation is testable
//! without a live API server.

use crate::conditions::{
    build_condition, set_condition, CONDITION_AVAILABLE, CONDITION_FALSE,
    CONDITION_RECONCILE_SUCCESS, CONDITION_TRUE, CONDITION_UNKNOWN,
};
use crate::crd::{ClusterPhase, ClusterStatus, OSRMCluster};
use crate::error::OperatorError;
use crate::resources::{
    child_resource_name, profile_workloads_ready, DEPLOYMENT_SUFFIX, JOB_SUFFIX,
};
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::ResourceExt;

/// Snapshot of the owned children of one cluster, listed per kind.
#[derive(Default)]
pub struct ObservedChildren {
    pub deployments: Vec<Deployment>,
    pub services: Vec<Service>,
    pub config_maps: Vec<ConfigMap>,
    pub persistent_volume_claims: Vec<PersistentVolumeClaim>,
    pub jobs: Vec<Job>,
    pub horizontal_pod_autoscalers: Vec<HorizontalPodAutoscaler>,
    pub pod_disruption_budgets: Vec<PodDisruptionBudget>,
}

impl ObservedChildren {
    /// Whether the named PVC exists and reports phase `Bound`.
    pub fn is_pvc_bound(&self, name: &str) -> bool {
        self.persistent_volume_claims
            .iter()
            .filter(|pvc| pvc.name_any() == name)
            .any(|pvc| {
                pvc.status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .map(|phase| phase == "Bound")
                    .unwrap_or(false)
            })
    }

    /// Whether the named Job exists and carries a `Complete=True` condition.
    pub fn is_job_completed(&self, name: &str) -> bool {
        self.job_has_condition(name, "Complete")
    }

    /// Whether the named Job exists and carries a `Failed=True` condition.
    pub fn is_job_failed(&self, name: &str) -> bool {
        self.job_has_condition(name, "Failed")
    }

    /// Whether the named Deployment reports at least one available replica.
    pub fn is_deployment_available(&self, name: &str) -> bool {
        self.deployments
            .iter()
            .filter(|d| d.name_any() == name)
            .any(|d| {
                d.status
                    .as_ref()
                    .and_then(|s| s.available_replicas)
                    .unwrap_or(0)
                    >= 1
            })
    }

    fn job_has_condition(&self, name: &str, condition_type: &str) -> bool {
        self.jobs.iter().filter(|j| j.name_any() == name).any(|j| {
            j.status
                .as_ref()
                .and_then(|s| s.conditions.as_deref())
                .unwrap_or_default()
                .iter()
                .any(|c| c.type_ == condition_type && c.status == "True")
        })
    }
}

/// Outcome of one apply pass, fed into the status fold.
#[derive(Default)]
pub struct ApplyOutcome {
    /// First error encountered; applies continue past failures, but only the
    /// worst outcome surfaces in the condition.
    pub first_error: Option<OperatorError>,
    /// Whether any builder was skipped because its gate was not yet open.
    pub any_gate_closed: bool,
}

impl ApplyOutcome {
    pub fn record_error(&mut self, error: OperatorError) {
        if self.first_error.is_none() {
            self.first_error = Some(error);
        }
    }
}

/// Derives the cluster status from the post-apply snapshot. Pure fold:
/// no API access, previous conditions are carried so transition times are
/// preserved while a condition's status is unchanged.
pub fn aggregate_status(
    cluster: &OSRMCluster,
    observed: &ObservedChildren,
    outcome: &ApplyOutcome,
) -> ClusterStatus {
    let mut conditions = cluster
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();

    let availability = derive_availability(cluster, observed);
    set_condition(
        &mut conditions,
        build_condition(
            CONDITION_AVAILABLE,
            availability.status,
            availability.reason,
            &availability.message,
        ),
    );

    let (status, reason, message) = match &outcome.first_error {
        None => (
            CONDITION_TRUE,
            "ReconciliationSucceeded",
            "all gated resources applied".to_string(),
        ),
        Some(OperatorError::Validation(msg)) => {
            (CONDITION_FALSE, "SpecValidationFailed", msg.clone())
        }
        Some(OperatorError::Forbidden(msg)) => (CONDITION_FALSE, "APIRejected", msg.clone()),
        Some(OperatorError::ForeignObject(msg)) => {
            (CONDITION_FALSE, "ForeignObjectCollision", msg.clone())
        }
        // Transient failures keep the condition undecided until resolved
        Some(err) => (CONDITION_UNKNOWN, "TransientError", err.to_string()),
    };
    set_condition(
        &mut conditions,
        build_condition(CONDITION_RECONCILE_SUCCESS, status, reason, &message),
    );

    let phase = derive_phase(cluster, observed, availability.available);

    ClusterStatus {
        phase,
        conditions,
        observed_generation: cluster.metadata.generation,
        last_updated: Some(Utc::now().to_rfc3339()),
    }
}

struct Availability {
    available: bool,
    status: &'static str,
    reason: &'static str,
    message: String,
}

/// Available is True iff every profile's routing deployment (and the
/// gateway's) reports at least one available replica. Profiles still waiting
/// on map preparation count as unavailable; a failed preparation job surfaces
/// its own reason.
fn derive_availability(cluster: &OSRMCluster, observed: &ObservedChildren) -> Availability {
    let cluster_name = cluster.name_any();

    if cluster.spec.profiles.is_empty() {
        return Availability {
            available: true,
            status: CONDITION_TRUE,
            reason: "NoProfiles",
            message: "no routing profiles declared".to_string(),
        };
    }

    let mut ready = 0usize;
    for profile in &cluster.spec.profiles {
        let job_name = child_resource_name(&cluster_name, &profile.name, JOB_SUFFIX);
        if observed.is_job_failed(&job_name) {
            return Availability {
                available: false,
                status: CONDITION_FALSE,
                reason: "MapBuildingFailed",
                message: format!("map-preparation job {} failed", job_name),
            };
        }

        if !profile_workloads_ready(cluster, &profile.name, observed) {
            continue;
        }

        let deployment_name =
            child_resource_name(&cluster_name, &profile.name, DEPLOYMENT_SUFFIX);
        if observed.is_deployment_available(&deployment_name) {
            ready += 1;
        }
    }

    let total = cluster.spec.profiles.len();
    let gateway_name = child_resource_name(&cluster_name, "", DEPLOYMENT_SUFFIX);
    let gateway_available = observed.is_deployment_available(&gateway_name);

    if ready == total && gateway_available {
        Availability {
            available: true,
            status: CONDITION_TRUE,
            reason: "AllProfilesAvailable",
            message: format!("{}/{} routing deployments available", ready, total),
        }
    } else {
        Availability {
            available: false,
            status: CONDITION_FALSE,
            reason: "ProfilesUnavailable",
            message: format!("{}/{} routing deployments available", ready, total),
        }
    }
}

fn derive_phase(
    cluster: &OSRMCluster,
    observed: &ObservedChildren,
    available: bool,
) -> ClusterPhase {
    if available {
        return ClusterPhase::Ready;
    }

    // A spec edit on a previously ready cluster is a rollout, not a cold start
    let was_ready = cluster
        .status
        .as_ref()
        .map(|s| s.phase == ClusterPhase::Ready || s.phase == ClusterPhase::Reconfiguring)
        .unwrap_or(false);
    if was_ready {
        return ClusterPhase::Reconfiguring;
    }

    if observed.jobs.is_empty() {
        ClusterPhase::Pending
    } else {
        ClusterPhase::Preparing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::condition_status;
    use crate::resources::test_support::sample_cluster;
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use k8s_openapi::api::core::v1::PersistentVolumeClaimStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn named_meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        }
    }

    pub fn bound_pvc(name: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: named_meta(name),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn job_with_condition(name: &str, condition_type: &str) -> Job {
        Job {
            metadata: named_meta(name),
            status: Some(JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: condition_type.to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn deployment_with_available(name: &str, available: i32) -> Deployment {
        Deployment {
            metadata: named_meta(name),
            status: Some(DeploymentStatus {
                available_replicas: Some(available),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn ready_observed() -> ObservedChildren {
        ObservedChildren {
            persistent_volume_claims: vec![bound_pvc("rr-config-car-pvc")],
            jobs: vec![job_with_condition("rr-config-car-job", "Complete")],
            deployments: vec![
                deployment_with_available("rr-config-car-deployment", 1),
                deployment_with_available("rr-config-deployment", 1),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_pvc_bound_predicate() {
        let observed = ready_observed();
        assert!(observed.is_pvc_bound("rr-config-car-pvc"));
        assert!(!observed.is_pvc_bound("rr-config-foot-pvc"));

        let pending = ObservedChildren {
            persistent_volume_claims: vec![PersistentVolumeClaim {
                metadata: named_meta("rr-config-car-pvc"),
                status: Some(PersistentVolumeClaimStatus {
                    phase: Some("Pending".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(!pending.is_pvc_bound("rr-config-car-pvc"));
    }

    #[test]
    fn test_job_predicates() {
        let observed = ready_observed();
        assert!(observed.is_job_completed("rr-config-car-job"));
        assert!(!observed.is_job_failed("rr-config-car-job"));

        let failed = ObservedChildren {
            jobs: vec![job_with_condition("rr-config-car-job", "Failed")],
            ..Default::default()
        };
        assert!(!failed.is_job_completed("rr-config-car-job"));
        assert!(failed.is_job_failed("rr-config-car-job"));
    }

    #[test]
    fn test_deployment_available_predicate() {
        let observed = ready_observed();
        assert!(observed.is_deployment_available("rr-config-car-deployment"));
        assert!(!observed.is_deployment_available("missing"));

        let zero = ObservedChildren {
            deployments: vec![deployment_with_available("rr-config-car-deployment", 0)],
            ..Default::default()
        };
        assert!(!zero.is_deployment_available("rr-config-car-deployment"));
    }

    #[test]
    fn test_status_ready_when_all_available() {
        let cluster = sample_cluster();
        let status = aggregate_status(&cluster, &ready_observed(), &ApplyOutcome::default());

        assert_eq!(
            condition_status(&status.conditions, CONDITION_AVAILABLE),
            Some(CONDITION_TRUE)
        );
        assert_eq!(
            condition_status(&status.conditions, CONDITION_RECONCILE_SUCCESS),
            Some(CONDITION_TRUE)
        );
        assert_eq!(status.phase, ClusterPhase::Ready);
        assert_eq!(status.observed_generation, Some(1));
    }

    #[test]
    fn test_status_preparing_while_job_runs() {
        let cluster = sample_cluster();
        let observed = ObservedChildren {
            persistent_volume_claims: vec![bound_pvc("rr-config-car-pvc")],
            jobs: vec![Job {
                metadata: named_meta("rr-config-car-job"),
                ..Default::default()
            }],
            ..Default::default()
        };

        let status = aggregate_status(&cluster, &observed, &ApplyOutcome::default());
        assert_eq!(
            condition_status(&status.conditions, CONDITION_AVAILABLE),
            Some(CONDITION_FALSE)
        );
        assert_eq!(status.phase, ClusterPhase::Preparing);
    }

    #[test]
    fn test_status_pending_before_any_job() {
        let cluster = sample_cluster();
        let status =
            aggregate_status(&cluster, &ObservedChildren::default(), &ApplyOutcome::default());
        assert_eq!(status.phase, ClusterPhase::Pending);
    }

    #[test]
    fn test_status_surfaces_job_failure() {
        let cluster = sample_cluster();
        let observed = ObservedChildren {
            persistent_volume_claims: vec![bound_pvc("rr-config-car-pvc")],
            jobs: vec![job_with_condition("rr-config-car-job", "Failed")],
            ..Default::default()
        };

        let status = aggregate_status(&cluster, &observed, &ApplyOutcome::default());
        let available = status
            .conditions
            .iter()
            .find(|c| c.r#type == CONDITION_AVAILABLE)
            .unwrap();
        assert_eq!(available.status, CONDITION_FALSE);
        assert_eq!(available.reason.as_deref(), Some("MapBuildingFailed"));
    }

    #[test]
    fn test_status_reconfiguring_after_ready() {
        let mut cluster = sample_cluster();
        cluster.status = Some(ClusterStatus {
            phase: ClusterPhase::Ready,
            ..Default::default()
        });
        // Rollout in progress: the deployment momentarily has no available pods
        let observed = ObservedChildren {
            persistent_volume_claims: vec![bound_pvc("rr-config-car-pvc")],
            jobs: vec![job_with_condition("rr-config-car-job", "Complete")],
            deployments: vec![deployment_with_available("rr-config-car-deployment", 0)],
            ..Default::default()
        };

        let status = aggregate_status(&cluster, &observed, &ApplyOutcome::default());
        assert_eq!(status.phase, ClusterPhase::Reconfiguring);
    }

    #[test]
    fn test_validation_error_sets_reconcile_success_false() {
        let cluster = sample_cluster();
        let mut outcome = ApplyOutcome::default();
        outcome.record_error(OperatorError::Validation(
            "spec.profiles[car].minReplicas must not be negative, got -1".to_string(),
        ));

        let status = aggregate_status(&cluster, &ObservedChildren::default(), &outcome);
        let reconcile = status
            .conditions
            .iter()
            .find(|c| c.r#type == CONDITION_RECONCILE_SUCCESS)
            .unwrap();
        assert_eq!(reconcile.status, CONDITION_FALSE);
        assert_eq!(reconcile.reason.as_deref(), Some("SpecValidationFailed"));
        assert!(reconcile.message.as_deref().unwrap().contains("minReplicas"));
    }

    #[test]
    fn test_transient_error_leaves_reconcile_success_unknown() {
        let cluster = sample_cluster();
        let mut outcome = ApplyOutcome::default();
        outcome.record_error(OperatorError::KubeApi("connection refused".to_string()));

        let status = aggregate_status(&cluster, &ObservedChildren::default(), &outcome);
        assert_eq!(
            condition_status(&status.conditions, CONDITION_RECONCILE_SUCCESS),
            Some(CONDITION_UNKNOWN)
        );
    }

    #[test]
    fn test_first_error_wins() {
        let mut outcome = ApplyOutcome::default();
        outcome.record_error(OperatorError::Validation("first".to_string()));
        outcome.record_error(OperatorError::KubeApi("second".to_string()));
        match outcome.first_error {
            Some(OperatorError::Validation(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_empty_profile_list_is_vacuously_available() {
        let mut cluster = sample_cluster();
        cluster.spec.profiles.clear();
        let status =
            aggregate_status(&cluster, &ObservedChildren::default(), &ApplyOutcome::default());
        assert_eq!(
            condition_status(&status.conditions, CONDITION_AVAILABLE),
            Some(CONDITION_TRUE)
        );
    }
}
