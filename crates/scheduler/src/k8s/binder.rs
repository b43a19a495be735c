use std::collections::BTreeMap;
use std::collections::BTreeSet;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Binding;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::ListParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::api::PostParams;
use kube::Api;
use kube::Client;
use serde_json::json;
use tracing::debug;

use super::pod_request::pod_identifier;
use super::pod_watcher::is_terminal;
use super::types::KubernetesError;
use crate::inventory::PodIdentifier;
use crate::scheduling::PodBinder;
use crate::scheduling::PodLister;

/// Writes bind decisions through the API server: a merge patch for the
/// annotations, then the pod `binding` subresource.
pub struct KubePodBinder {
    client: Client,
}

impl KubePodBinder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl PodBinder for KubePodBinder {
    async fn get_pod(&self, pod: &PodIdentifier) -> Result<Pod, Report<KubernetesError>> {
        self.pods(&pod.namespace).get(&pod.name).await.map_err(|e| {
            Report::new(KubernetesError::PodNotFound {
                pod_name: pod.name.clone(),
                namespace: pod.namespace.clone(),
            })
            .attach_printable(format!("Kubernetes API error: {e}"))
        })
    }

    async fn annotate(
        &self,
        pod: &PodIdentifier,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Report<KubernetesError>> {
        let patch = json!({ "metadata": { "annotations": annotations } });
        self.pods(&pod.namespace)
            .patch(&pod.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                Report::new(KubernetesError::PatchFailed {
                    pod: pod.to_string(),
                    message: e.to_string(),
                })
            })?;
        debug!(pod = %pod, "Pod annotated");
        Ok(())
    }

    async fn bind(
        &self,
        pod: &PodIdentifier,
        uid: &str,
        node: &str,
    ) -> Result<(), Report<KubernetesError>> {
        let failed = |message: String| KubernetesError::BindFailed {
            pod: pod.to_string(),
            node: node.to_string(),
            message,
        };
        let binding = Binding {
            metadata: ObjectMeta {
                name: Some(pod.name.clone()),
                namespace: Some(pod.namespace.clone()),
                uid: (!uid.is_empty()).then(|| uid.to_string()),
                ..Default::default()
            },
            target: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Node".to_string()),
                name: Some(node.to_string()),
                ..Default::default()
            },
        };
        let data = serde_json::to_vec(&binding)
            .change_context_lazy(|| failed("failed to encode binding".to_string()))?;

        self.pods(&pod.namespace)
            .create_subresource::<serde_json::Value>("binding", &pod.name, &PostParams::default(), data)
            .await
            .map_err(|e| Report::new(failed(e.to_string())))?;
        debug!(pod = %pod, node = node, "Pod binding created");
        Ok(())
    }
}

/// Lists the pods handled by this scheduler that are not finished yet.
pub struct KubePodLister {
    client: Client,
    scheduler_name: String,
}

impl KubePodLister {
    pub fn new(client: Client, scheduler_name: String) -> Self {
        Self {
            client,
            scheduler_name,
        }
    }
}

#[async_trait::async_trait]
impl PodLister for KubePodLister {
    async fn live_pods(&self) -> Result<BTreeSet<PodIdentifier>, Report<KubernetesError>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params =
            ListParams::default().fields(&format!("spec.schedulerName={}", self.scheduler_name));
        let pods = api.list(&params).await.map_err(|e| {
            Report::new(KubernetesError::ListFailed {
                message: e.to_string(),
            })
        })?;

        Ok(pods
            .items
            .iter()
            .filter(|pod| is_terminal(pod).is_none())
            .filter_map(|pod| pod_identifier(pod).ok())
            .collect())
    }
}
