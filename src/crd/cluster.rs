//! OSRMCluster Custom Resource Definition
//!
//! Defines the specification for deploying an OSRM routing cluster on
//! Kubernetes: a map data source, a storage policy, a set of routing
//! profiles, and the gateway exposure policy.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Annotation that pauses reconciliation of a cluster when set to `"true"`.
pub const PAUSED_ANNOTATION: &str = "osrm.itayankri/operator.paused";

/// OSRM services that the gateway may expose.
pub const EXPOSABLE_SERVICES: &[&str] = &["route", "table", "match", "nearest", "trip", "tile"];

/// OSRMCluster is the Schema for the osrmclusters API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "osrm.itayankri",
    version = "v1alpha1",
    kind = "OSRMCluster",
    namespaced,
    status = "ClusterStatus",
    shortname = "osrm",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Absolute URL of the OpenStreetMap PBF extract to preprocess
    pub pbf_url: String,

    /// Container image override for OSRM workloads
    #[serde(default)]
    pub image: Option<String>,

    /// Storage configuration for the per-profile graph volumes
    #[serde(default)]
    pub persistence: PersistenceSpec,

    /// Routing profiles to materialize (car, foot, bicycle, ...)
    #[serde(default)]
    pub profiles: Vec<ProfileSpec>,

    /// Exposure policy for the per-profile services and the gateway
    #[serde(default)]
    pub service: ServiceSpec,
}

/// A single routing profile: its own preprocessed graph, deployment,
/// service, and autoscaler.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSpec {
    /// Stable identity key; becomes part of every child resource name
    pub name: String,

    /// External URL prefix served by the gateway
    pub endpoint_name: String,

    /// OSRM profile name in routed URLs when different from `name`
    #[serde(default)]
    pub internal_endpoint: Option<String>,

    /// Lua profile passed to osrm-extract (defaults to `name`)
    #[serde(default)]
    pub osrm_profile: Option<String>,

    /// Minimum replicas for the routing deployment and its HPA
    #[serde(default)]
    pub min_replicas: Option<i32>,

    /// Maximum replicas for the HPA
    #[serde(default)]
    pub max_replicas: Option<i32>,

    /// Resource requirements for the routing containers
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
}

impl ProfileSpec {
    pub fn min_replicas(&self) -> i32 {
        self.min_replicas.unwrap_or(DEFAULT_MIN_REPLICAS)
    }

    pub fn max_replicas(&self) -> i32 {
        self.max_replicas.unwrap_or(DEFAULT_MAX_REPLICAS)
    }

    /// OSRM profile name used in routed URLs inside the cluster.
    pub fn internal_endpoint(&self) -> &str {
        self.internal_endpoint.as_deref().unwrap_or(&self.name)
    }

    /// Lua profile used during map extraction.
    pub fn osrm_profile(&self) -> &str {
        self.osrm_profile.as_deref().unwrap_or(&self.name)
    }
}

/// Resource requirements for containers
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// Resource limits
    #[serde(default)]
    pub limits: ResourceList,
    /// Resource requests
    #[serde(default)]
    pub requests: ResourceList,
}

/// Resource quantities
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct ResourceList {
    /// CPU limit/request (e.g., "500m", "2")
    #[serde(default)]
    pub cpu: Option<String>,
    /// Memory limit/request (e.g., "512Mi", "4Gi")
    #[serde(default)]
    pub memory: Option<String>,
}

/// Storage configuration for the per-profile persistent volumes
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceSpec {
    /// Storage class name for the PVCs
    #[serde(default)]
    pub storage_class_name: Option<String>,
    /// Requested volume size (e.g., "10Gi")
    #[serde(default = "default_storage")]
    pub storage: String,
    /// Access mode for the PVCs
    #[serde(default)]
    pub access_mode: Option<String>,
}

impl PersistenceSpec {
    pub fn access_mode(&self) -> &str {
        self.access_mode.as_deref().unwrap_or("ReadWriteOnce")
    }
}

impl Default for PersistenceSpec {
    fn default() -> Self {
        Self {
            storage_class_name: None,
            storage: default_storage(),
            access_mode: None,
        }
    }
}

/// Exposure policy: service type, exposed OSRM services, and annotations
/// propagated to the per-profile services.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Service type for the per-profile services (default ClusterIP)
    #[serde(default)]
    pub r#type: Option<String>,

    /// OSRM services routed through the gateway (route, table, match, ...)
    #[serde(default)]
    pub exposing_services: Vec<String>,

    /// Annotations applied to the per-profile services
    #[serde(default)]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ServiceSpec {
    pub fn get_type(&self) -> &str {
        self.r#type.as_deref().unwrap_or("ClusterIP")
    }
}

impl ClusterSpec {
    /// Validates the spec against the constraints the operator enforces.
    /// Violations are deterministic: the same spec always produces the same
    /// error, and no mutation happens for an invalid spec.
    pub fn validate(&self) -> Result<(), String> {
        if !is_absolute_http_url(&self.pbf_url) {
            return Err(format!(
                "spec.pbfUrl {:?} is not an absolute http(s) URL",
                self.pbf_url
            ));
        }
        if self.map_name().is_empty() {
            return Err(format!(
                "spec.pbfUrl {:?} has no file name in its path",
                self.pbf_url
            ));
        }

        let mut seen = std::collections::BTreeSet::new();
        for profile in &self.profiles {
            if !is_dns1123_label(&profile.name) {
                return Err(format!(
                    "spec.profiles[{}].name is not a DNS-1123 label",
                    profile.name
                ));
            }
            if !seen.insert(profile.name.as_str()) {
                return Err(format!(
                    "spec.profiles[{}].name is declared more than once",
                    profile.name
                ));
            }
            let min = profile.min_replicas();
            let max = profile.max_replicas();
            if min < 0 {
                return Err(format!(
                    "spec.profiles[{}].minReplicas must not be negative, got {}",
                    profile.name, min
                ));
            }
            if max < min {
                return Err(format!(
                    "spec.profiles[{}].maxReplicas ({}) must be >= minReplicas ({})",
                    profile.name, max, min
                ));
            }
        }

        for service in &self.service.exposing_services {
            if !EXPOSABLE_SERVICES.contains(&service.as_str()) {
                return Err(format!(
                    "spec.service.exposingServices[{}] is not a known OSRM service",
                    service
                ));
            }
        }

        Ok(())
    }

    /// Base name of the prepared dataset, derived from the PBF URL:
    /// the final path segment with the `.osm.pbf` extension stripped.
    /// The routing servers load `/data/<map_name>.osrm`.
    pub fn map_name(&self) -> &str {
        let path = self
            .pbf_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.pbf_url);
        let path = path.split(['?', '#']).next().unwrap_or(path);
        let file = path.rsplit('/').next().unwrap_or("");
        file.strip_suffix(".osm.pbf")
            .or_else(|| file.strip_suffix(".pbf"))
            .unwrap_or(file)
    }
}

impl OSRMCluster {
    /// Whether reconciliation of this cluster is paused via annotation.
    pub fn paused(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(PAUSED_ANNOTATION))
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}

/// Status of the OSRMCluster
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Current phase of the cluster
    #[serde(default)]
    pub phase: ClusterPhase,
    /// Conditions representing cluster state
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,
    /// Last observed generation
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Last update timestamp
    #[serde(default)]
    pub last_updated: Option<String>,
}

/// Phase of the cluster lifecycle. Failure is not a phase — it surfaces
/// through the ReconcileSuccess condition while the controller keeps retrying.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Awaiting map preparation
    #[default]
    Pending,
    /// Map-building jobs are running
    Preparing,
    /// All gated children applied and available
    Ready,
    /// A spec edit is being rolled out
    Reconfiguring,
}

/// Condition of the cluster
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last time the condition transitioned
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

// Default value functions
pub(crate) const DEFAULT_MIN_REPLICAS: i32 = 1;
pub(crate) const DEFAULT_MAX_REPLICAS: i32 = 3;

fn default_storage() -> String {
    "10Gi".to_string()
}

fn is_absolute_http_url(url: &str) -> bool {
    let rest = match url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
    {
        Some(rest) => rest,
        None => return false,
    };
    let host = rest.split('/').next().unwrap_or("");
    !host.is_empty()
}

/// RFC 1123 label: lowercase alphanumeric or '-', alphanumeric at both ends,
/// at most 63 characters.
fn is_dns1123_label(name: &str) -> bool {
    if name.is_empty() || name.len() > 63 {
        return false;
    }
    let bytes = name.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes.iter().all(|&b| alnum(b) || b == b'-')
}
