//! Error types for the OSRM Kubernetes Operator

use std::fmt;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur during operator operations
#[derive(Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    KubeApi(String),
    /// Spec failed validation; retrying without a spec edit cannot help
    Validation(String),
    /// The API server rejected the request permanently (forbidden, invalid)
    Forbidden(String),
    /// A child resource name is taken by an object this cluster does not own
    ForeignObject(String),
    /// Reconciliation error
    Reconciliation(String),
    /// Serialization error
    Serialization(String),
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorError::KubeApi(msg) => write!(f, "Kubernetes API error: {}", msg),
            OperatorError::Validation(msg) => write!(f, "Invalid spec: {}", msg),
            OperatorError::Forbidden(msg) => write!(f, "Request rejected: {}", msg),
            OperatorError::ForeignObject(msg) => write!(f, "Foreign object: {}", msg),
            OperatorError::Reconciliation(msg) => write!(f, "Reconciliation error: {}", msg),
            OperatorError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for OperatorError {}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        match &err {
            // 403 and 422 will not resolve on their own; everything else is
            // treated as transient and retried with backoff.
            kube::Error::Api(ae) if ae.code == 403 || ae.code == 422 => {
                OperatorError::Forbidden(err.to_string())
            }
            _ => OperatorError::KubeApi(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}
