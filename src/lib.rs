//! OSRM Kubernetes Operator
//!
//! A Kubernetes operator that materializes OSRM routing clusters from a
//! single declarative custom resource.
//!
//! ## Custom Resources
//!
//! - `OSRMCluster`: a map data source, storage policy, and a set of routing
//!   profiles; reconciled into map-preparation Jobs, routing Deployments,
//!   Services, HPAs, PDBs, and a shared NGINX gateway.
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: osrm.itayankri/v1alpha1
//! kind: OSRMCluster
//! metadata:
//!   name: routing
//! spec:
//!   pbfUrl: https://download.geofabrik.de/europe/berlin-latest.osm.pbf
//!   persistence:
//!     storage: 10Gi
//!   profiles:
//!     - name: car
//!       endpointName: driving
//!   service:
//!     exposingServices: [route]
//! ```

pub mod conditions;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod leader_election;
pub mod resources;
pub mod status;

pub use controllers::ClusterController;
pub use crd::{
    ClusterCondition, ClusterPhase, ClusterSpec, ClusterStatus, OSRMCluster, PersistenceSpec,
    ProfileSpec, ServiceSpec,
};
pub use error::{OperatorError, Result};
