//! Kubernetes integration: pod request extraction, binding, lifecycle watching

pub mod annotations;
pub mod binder;
pub mod kube_client;
pub mod pod_request;
pub mod pod_watcher;
pub mod types;

pub use binder::KubePodBinder;
pub use binder::KubePodLister;
pub use pod_watcher::PodWatcher;
pub use types::KubernetesError;
pub use types::PodEvent;
pub use types::ReleaseReason;
