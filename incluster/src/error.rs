use thiserror::Error;

use crate::types::ClusterId;

/// Errors returned by incluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("incluster: dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("incluster: invalid embedding: {0}")]
    InvalidEmbedding(String),

    #[error("incluster: unknown cluster {0}")]
    UnknownCluster(ClusterId),

    #[error("incluster: cluster must have at least one member")]
    EmptyCluster,

    #[error("incluster: clustering unavailable: {0}")]
    ClusteringUnavailable(String),

    #[error("incluster: reconciliation pass already in progress")]
    ReconcileInProgress,

    #[error("incluster: registry already has clusters")]
    AlreadyBootstrapped,

    #[error("incluster: invalid config: {0}")]
    InvalidConfig(String),

    #[error("incluster: config: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("incluster: io: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by the numerical capabilities (reduction, clustering).
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Failed(String),
}

impl From<CapabilityError> for ClusterError {
    fn from(err: CapabilityError) -> Self {
        ClusterError::ClusteringUnavailable(err.to_string())
    }
}
