//! Seams between the scheduling service and the Kubernetes API

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;

use crate::inventory::PodIdentifier;
use crate::k8s::KubernetesError;

/// Writes the scheduling decision back to the cluster.
#[async_trait::async_trait]
pub trait PodBinder: Send + Sync {
    /// Fetches the current pod object.
    async fn get_pod(&self, pod: &PodIdentifier) -> Result<Pod, Report<KubernetesError>>;

    /// Merges `annotations` into the pod metadata.
    async fn annotate(
        &self,
        pod: &PodIdentifier,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Report<KubernetesError>>;

    /// Binds the pod to `node`.
    async fn bind(
        &self,
        pod: &PodIdentifier,
        uid: &str,
        node: &str,
    ) -> Result<(), Report<KubernetesError>>;
}

/// Source of the pods that are still alive, used by the reconciler.
#[async_trait::async_trait]
pub trait PodLister: Send + Sync {
    async fn live_pods(&self) -> Result<BTreeSet<PodIdentifier>, Report<KubernetesError>>;
}
