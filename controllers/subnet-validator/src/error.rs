//! Controller-specific error types.

use controller_util::NamespacedName;
use kube::Error as KubeError;
use thiserror::Error;

use crate::conflicts::RecordConflictError;
use crate::summary::SummaryError;

/// Errors that can occur in the subnet validator. Every variant surfaces as
/// either a rate-limited requeue or a logged drop; none is fatal to the
/// process.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Subnet spec failed to parse into a summary
    #[error(transparent)]
    Summary(#[from] SummaryError),

    /// Rival registration raced with a concurrent writer
    #[error(transparent)]
    RecordConflict(#[from] RecordConflictError),

    /// The cluster-wide live list by VNI failed
    #[error("live list of all subnets against API server failed: {0}")]
    LiveList(#[source] KubeError),

    /// The verdict write failed
    #[error("failed to write validation outcome into {nsn}'s status: {source}")]
    StatusWrite {
        nsn: NamespacedName,
        source: KubeError,
    },

    /// Object serialization failed
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Resource watch failed
    #[error("resource watch failed: {0}")]
    Watch(String),
}
