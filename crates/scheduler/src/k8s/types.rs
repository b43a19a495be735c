use thiserror::Error;

use crate::inventory::PodIdentifier;

/// Pod lifecycle changes that matter to reservation bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodEvent {
    /// The pod was deleted or reached a terminal phase; its devices can be reused
    Released {
        pod: PodIdentifier,
        /// UID of the released pod instance; a recreated pod keeps the name but not the UID
        uid: Option<String>,
        reason: ReleaseReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    Deleted,
    Succeeded,
    Failed,
}

impl std::fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReleaseReason::Deleted => write!(f, "deleted"),
            ReleaseReason::Succeeded => write!(f, "succeeded"),
            ReleaseReason::Failed => write!(f, "failed"),
        }
    }
}

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, Error)]
pub enum KubernetesError {
    #[error("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[error("Failed to watch pods: {message}")]
    WatchFailed { message: String },
    #[error("Failed to list pods: {message}")]
    ListFailed { message: String },
    #[error("Pod not found: {pod_name} in namespace {namespace}")]
    PodNotFound { pod_name: String, namespace: String },
    #[error("Failed to annotate pod {pod}: {message}")]
    PatchFailed { pod: String, message: String },
    #[error("Failed to bind pod {pod} to node {node}: {message}")]
    BindFailed {
        pod: String,
        node: String,
        message: String,
    },
}
