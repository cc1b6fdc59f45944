//! Custom Resource Definitions for the OSRM Kubernetes Operator
//!
//! A single CRD is managed:
//! - OSRMCluster: a full OSRM routing cluster (map preparation, per-profile
//!   routing servers, and a shared gateway)

mod cluster;

pub use cluster::{
    ClusterCondition, ClusterPhase, ClusterSpec, ClusterStatus, OSRMCluster, PersistenceSpec,
    ProfileSpec, ResourceList, ResourceRequirements, ServiceSpec, EXPOSABLE_SERVICES,
    PAUSED_ANNOTATION,
};
