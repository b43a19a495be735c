use std::sync::Arc;

use crate::inventory::InventoryService;
use crate::k8s::PodWatcher;
use crate::scheduling::PodLister;
use crate::scheduling::SchedulingService;

/// Kubernetes-backed services, absent when Kubernetes integration is disabled
pub struct KubernetesServices {
    pub pod_watcher: Arc<PodWatcher>,
    pub pod_lister: Arc<dyn PodLister>,
}

/// Application dependencies - simple struct with Arc-wrapped services
pub struct ApplicationServices {
    pub inventory: Arc<InventoryService>,
    pub scheduling: Arc<SchedulingService>,
    pub kubernetes: Option<KubernetesServices>,
}
