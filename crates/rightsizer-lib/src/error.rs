//! Error taxonomy for the right-sizing controller
//!
//! Every failure the controller can observe maps onto one of these
//! variants. The reconcile loop decides per variant whether a failure
//! aborts the pass, skips one workload, or is retried.

use thiserror::Error;

/// Errors produced by the controller library
#[derive(Debug, Error)]
pub enum Error {
    /// Object was deleted while a pass was in flight
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// Malformed label or namespace selector
    #[error("invalid selector: {0}")]
    Selector(String),

    /// Metrics backend could not serve a query for one workload
    #[error("metrics unavailable for {target}: {reason}")]
    MetricsUnavailable { target: String, reason: String },

    /// Too few samples to compute a recommendation for one resource
    #[error("insufficient {resource} data points: {got} < {required}")]
    InsufficientData {
        resource: &'static str,
        got: usize,
        required: usize,
    },

    /// Optimistic concurrency conflict that survived every retry
    #[error("conflict updating {0}")]
    Conflict(String),

    /// Failure while writing recommended resources to a workload
    #[error("failed to update {workload}: {reason}")]
    WorkloadUpdate { workload: String, reason: String },

    /// Policy spec failed defensive validation
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("invalid quantity {0:?}")]
    Quantity(String),

    #[error("invalid duration {0:?}")]
    Duration(String),

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for a missing object, whether reported locally or by the API server
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// True for a resourceVersion conflict (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// Short label used for the `reason` of status conditions and metric labels
    pub fn reason(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "NotFound",
            Error::Selector(_) => "SelectorError",
            Error::MetricsUnavailable { .. } => "MetricsUnavailable",
            Error::InsufficientData { .. } => "InsufficientData",
            Error::Conflict(_) => "UpdateConflict",
            Error::WorkloadUpdate { .. } => "WorkloadUpdateError",
            Error::InvalidPolicy(_) => "InvalidPolicy",
            Error::Quantity(_) | Error::Duration(_) => "InvalidValue",
            Error::Kube(_) => "KubeApiError",
            Error::Http(_) => "HttpError",
            Error::Serialization(_) => "SerializationError",
        }
    }
}
