//! Child-resource builders for OSRMCluster
//!
//! Each child kind has a builder exposing the same three operations:
//! `build` returns an identity-only object (used on the create path),
//! `update` writes the full desired projection into an object, and
//! `should_deploy` decides whether the child may exist yet given the
//! observed state of its prerequisites. Builders are pure over the cluster
//! spec snapshot: two calls with the same inputs produce identical output.

mod deployment;
mod gateway;
mod hpa;
mod job;
mod pdb;
mod pvc;
mod service;

pub use deployment::DeploymentBuilder;
pub use gateway::{
    gateway_config_version, render_nginx_conf, GatewayConfigMapBuilder, GatewayDeploymentBuilder,
    GatewayServiceBuilder, GATEWAY_CONFIG_VERSION_ANNOTATION,
};
pub use hpa::HorizontalPodAutoscalerBuilder;
pub use job::JobBuilder;
pub use pdb::PodDisruptionBudgetBuilder;
pub use pvc::PersistentVolumeClaimBuilder;
pub use service::ServiceBuilder;

use crate::crd::OSRMCluster;
use crate::status::ObservedChildren;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

// Child name suffixes. A child's identity is a pure function of
// (clusterName, profileName, suffix); gateway children have no profile part.
pub const DEPLOYMENT_SUFFIX: &str = "deployment";
pub const SERVICE_SUFFIX: &str = "svc";
pub const HORIZONTAL_POD_AUTOSCALER_SUFFIX: &str = "hpa";
pub const POD_DISRUPTION_BUDGET_SUFFIX: &str = "pdb";
pub const PERSISTENT_VOLUME_CLAIM_SUFFIX: &str = "pvc";
pub const JOB_SUFFIX: &str = "job";
pub const CONFIG_MAP_SUFFIX: &str = "cm";

/// Label carrying the cluster generation a child was last applied for.
pub const GENERATION_LABEL_KEY: &str = "generation";

pub const OSRM_CONTAINER_NAME: &str = "osrm-backend";
pub const DEFAULT_IMAGE: &str = "osrm/osrm-backend";
pub const GATEWAY_POSTFIX: &str = "gateway";
pub const DATA_VOLUME: &str = "data";
pub const DATA_DIR: &str = "/data";
pub const OSRM_PORT: i32 = 5000;

/// Joins the non-empty parts of (cluster, profile, suffix) with '-'.
pub fn child_resource_name(cluster_name: &str, profile_name: &str, suffix: &str) -> String {
    [cluster_name, profile_name, suffix]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("-")
}

/// Value of the `app` selector label for a profile's workload, or for the
/// gateway when `profile_name` is empty.
pub fn selector_name(cluster_name: &str, profile_name: &str) -> String {
    if profile_name.is_empty() {
        format!("{}-{}", cluster_name, GATEWAY_POSTFIX)
    } else {
        format!("{}-{}", cluster_name, profile_name)
    }
}

/// Labels stamped on every child resource.
pub fn standard_labels(cluster: &OSRMCluster) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), "osrm".to_string());
    labels.insert(
        "app.kubernetes.io/instance".to_string(),
        cluster.name_any(),
    );
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "osrm-operator".to_string(),
    );
    labels
}

/// The controller owner reference every child carries.
pub fn owner_reference(cluster: &OSRMCluster) -> OwnerReference {
    OwnerReference {
        api_version: OSRMCluster::api_version(&()).to_string(),
        kind: OSRMCluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Whether `meta` carries a controller owner reference with the given UID.
pub fn is_owned_by(meta: &ObjectMeta, owner_uid: &str) -> bool {
    meta.owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|r| r.uid == owner_uid)
}

/// Whether `meta`'s generation label is absent or different from the
/// cluster's current generation, making the object a GC candidate.
pub fn is_stale_generation(meta: &ObjectMeta, generation: i64) -> bool {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(GENERATION_LABEL_KEY))
        .map(|v| v != &generation.to_string())
        .unwrap_or(true)
}

/// One builder per child the operator manages, in apply order.
pub enum ResourceBuilder<'a> {
    PersistentVolumeClaim(PersistentVolumeClaimBuilder<'a>),
    Job(JobBuilder<'a>),
    Deployment(DeploymentBuilder<'a>),
    Service(ServiceBuilder<'a>),
    HorizontalPodAutoscaler(HorizontalPodAutoscalerBuilder<'a>),
    PodDisruptionBudget(PodDisruptionBudgetBuilder<'a>),
    GatewayConfigMap(GatewayConfigMapBuilder<'a>),
    GatewayService(GatewayServiceBuilder<'a>),
    GatewayDeployment(GatewayDeploymentBuilder<'a>),
}

impl ResourceBuilder<'_> {
    pub fn name(&self) -> String {
        match self {
            ResourceBuilder::PersistentVolumeClaim(b) => b.name(),
            ResourceBuilder::Job(b) => b.name(),
            ResourceBuilder::Deployment(b) => b.name(),
            ResourceBuilder::Service(b) => b.name(),
            ResourceBuilder::HorizontalPodAutoscaler(b) => b.name(),
            ResourceBuilder::PodDisruptionBudget(b) => b.name(),
            ResourceBuilder::GatewayConfigMap(b) => b.name(),
            ResourceBuilder::GatewayService(b) => b.name(),
            ResourceBuilder::GatewayDeployment(b) => b.name(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ResourceBuilder::PersistentVolumeClaim(_) => "PersistentVolumeClaim",
            ResourceBuilder::Job(_) => "Job",
            ResourceBuilder::Deployment(_) => "Deployment",
            ResourceBuilder::Service(_) => "Service",
            ResourceBuilder::HorizontalPodAutoscaler(_) => "HorizontalPodAutoscaler",
            ResourceBuilder::PodDisruptionBudget(_) => "PodDisruptionBudget",
            ResourceBuilder::GatewayConfigMap(_) => "ConfigMap",
            ResourceBuilder::GatewayService(_) => "Service",
            ResourceBuilder::GatewayDeployment(_) => "Deployment",
        }
    }

    /// The readiness gate: may this child exist yet, given observed state?
    /// An ungated builder is skipped during apply, never deleted.
    pub fn should_deploy(&self, observed: &ObservedChildren) -> bool {
        match self {
            ResourceBuilder::PersistentVolumeClaim(b) => b.should_deploy(observed),
            ResourceBuilder::GatewayConfigMap(b) => b.should_deploy(observed),
            ResourceBuilder::Job(b) => b.should_deploy(observed),
            ResourceBuilder::Deployment(b) => b.should_deploy(observed),
            ResourceBuilder::Service(b) => b.should_deploy(observed),
            ResourceBuilder::HorizontalPodAutoscaler(b) => b.should_deploy(observed),
            ResourceBuilder::PodDisruptionBudget(b) => b.should_deploy(observed),
            ResourceBuilder::GatewayService(b) => b.should_deploy(observed),
            ResourceBuilder::GatewayDeployment(b) => b.should_deploy(observed),
        }
    }
}

/// The ordered builder catalog for a cluster: profile-scoped builders first,
/// grouped per profile in declaration order, then the cluster-scoped gateway
/// builders. An empty profile list yields no builders at all.
pub fn resource_builders(cluster: &OSRMCluster) -> Vec<ResourceBuilder<'_>> {
    let mut builders = Vec::new();

    for profile in &cluster.spec.profiles {
        builders.push(ResourceBuilder::PersistentVolumeClaim(
            PersistentVolumeClaimBuilder { cluster, profile },
        ));
        builders.push(ResourceBuilder::Job(JobBuilder { cluster, profile }));
        builders.push(ResourceBuilder::Deployment(DeploymentBuilder {
            cluster,
            profile,
        }));
        builders.push(ResourceBuilder::Service(ServiceBuilder { cluster, profile }));
        builders.push(ResourceBuilder::HorizontalPodAutoscaler(
            HorizontalPodAutoscalerBuilder { cluster, profile },
        ));
        builders.push(ResourceBuilder::PodDisruptionBudget(
            PodDisruptionBudgetBuilder { cluster, profile },
        ));
    }

    if !cluster.spec.profiles.is_empty() {
        builders.push(ResourceBuilder::GatewayConfigMap(GatewayConfigMapBuilder {
            cluster,
        }));
        builders.push(ResourceBuilder::GatewayService(GatewayServiceBuilder {
            cluster,
        }));
        builders.push(ResourceBuilder::GatewayDeployment(
            GatewayDeploymentBuilder { cluster },
        ));
    }

    builders
}

/// Profile-scoped readiness: the routing workloads for a profile may exist
/// once its volume is bound and its map-preparation job has completed.
pub(crate) fn profile_workloads_ready(
    cluster: &OSRMCluster,
    profile_name: &str,
    observed: &ObservedChildren,
) -> bool {
    let cluster_name = cluster.name_any();
    observed.is_pvc_bound(&child_resource_name(
        &cluster_name,
        profile_name,
        PERSISTENT_VOLUME_CLAIM_SUFFIX,
    )) && observed.is_job_completed(&child_resource_name(
        &cluster_name,
        profile_name,
        JOB_SUFFIX,
    ))
}
