//! Controllers for the OSRM Kubernetes Operator
//!
//! The cluster controller watches OSRMCluster resources and reconciles the
//! actual child-resource topology with the declared state.

mod cluster;

pub use cluster::ClusterController;

use crate::error::OperatorError;
use kube::runtime::controller::Action;
use std::time::Duration;

/// Exponential backoff error policy for controller reconciliation failures.
/// Categorizes errors by severity to choose appropriate retry delays.
pub(crate) fn error_policy_backoff<K>(
    _object: std::sync::Arc<K>,
    error: &OperatorError,
    _ctx: std::sync::Arc<impl std::any::Any + Send + Sync>,
) -> Action {
    let delay_secs = match error {
        // Transient K8s API errors — retry quickly
        OperatorError::KubeApi(_) => 10,
        // A foreign object may be cleaned up out of band — moderate wait
        OperatorError::ForeignObject(_) => 30,
        // Reconciliation/state issues — longer wait
        OperatorError::Reconciliation(_) => 30,
        // Validation and permanent rejections only resolve on a spec edit,
        // which triggers its own watch event — back off further
        OperatorError::Validation(_)
        | OperatorError::Forbidden(_)
        | OperatorError::Serialization(_) => 60,
    };

    Action::requeue(Duration::from_secs(delay_secs))
}
