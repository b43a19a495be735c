//! In-memory [`PodBinder`] and [`PodLister`] for tests and local runs

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::PoisonError;

use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;

use super::binder::PodBinder;
use super::binder::PodLister;
use crate::inventory::PodIdentifier;
use crate::k8s::KubernetesError;

/// Records annotations and bindings instead of talking to an API server
#[derive(Default)]
pub struct MockPodBinder {
    pods: Mutex<HashMap<PodIdentifier, Pod>>,
    annotations: Mutex<HashMap<PodIdentifier, BTreeMap<String, String>>>,
    bound: Mutex<HashMap<PodIdentifier, String>>,
    fail_annotate: AtomicBool,
    fail_bind: AtomicBool,
    bind_calls: AtomicUsize,
}

impl MockPodBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `pod` visible to [`PodBinder::get_pod`].
    pub fn insert_pod(&self, pod: Pod) {
        let id = PodIdentifier::new(
            pod.metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            pod.metadata.name.clone().unwrap_or_default(),
        );
        self.pods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, pod);
    }

    pub fn set_fail_annotate(&self, enabled: bool) {
        self.fail_annotate.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_bind(&self, enabled: bool) {
        self.fail_bind.store(enabled, Ordering::SeqCst);
    }

    pub fn annotations_of(&self, pod: &PodIdentifier) -> Option<BTreeMap<String, String>> {
        self.annotations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pod)
            .cloned()
    }

    pub fn node_of(&self, pod: &PodIdentifier) -> Option<String> {
        self.bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pod)
            .cloned()
    }

    /// Number of bind calls that reached the binder, successful or not
    pub fn bind_calls(&self) -> usize {
        self.bind_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PodBinder for MockPodBinder {
    async fn get_pod(&self, pod: &PodIdentifier) -> Result<Pod, Report<KubernetesError>> {
        self.pods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pod)
            .cloned()
            .ok_or_else(|| {
                Report::new(KubernetesError::PodNotFound {
                    pod_name: pod.name.clone(),
                    namespace: pod.namespace.clone(),
                })
            })
    }

    async fn annotate(
        &self,
        pod: &PodIdentifier,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Report<KubernetesError>> {
        if self.fail_annotate.load(Ordering::SeqCst) {
            return Err(Report::new(KubernetesError::PatchFailed {
                pod: pod.to_string(),
                message: "injected failure".to_string(),
            }));
        }
        self.annotations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(pod.clone())
            .or_default()
            .extend(annotations);
        Ok(())
    }

    async fn bind(
        &self,
        pod: &PodIdentifier,
        _uid: &str,
        node: &str,
    ) -> Result<(), Report<KubernetesError>> {
        self.bind_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_bind.load(Ordering::SeqCst) {
            return Err(Report::new(KubernetesError::BindFailed {
                pod: pod.to_string(),
                node: node.to_string(),
                message: "injected failure".to_string(),
            }));
        }
        self.bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pod.clone(), node.to_string());
        Ok(())
    }
}

/// Lister returning a fixed, replaceable set of live pods
#[derive(Default)]
pub struct StaticPodLister {
    live: Mutex<BTreeSet<PodIdentifier>>,
}

impl StaticPodLister {
    pub fn new(live: BTreeSet<PodIdentifier>) -> Self {
        Self {
            live: Mutex::new(live),
        }
    }

    pub fn set_live(&self, live: BTreeSet<PodIdentifier>) {
        *self.live.lock().unwrap_or_else(PoisonError::into_inner) = live;
    }
}

#[async_trait::async_trait]
impl PodLister for StaticPodLister {
    async fn live_pods(&self) -> Result<BTreeSet<PodIdentifier>, Report<KubernetesError>> {
        Ok(self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}
