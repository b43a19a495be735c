use std::sync::Arc;

use anyhow::Result;

use crate::allocation::AllocationEngine;
use crate::app::services::KubernetesServices;
use crate::app::Application;
use crate::app::ApplicationServices;
use crate::config::ServeArgs;
use crate::inventory::DeviceRecordStore;
use crate::inventory::InventoryService;
use crate::k8s::kube_client::init_kube_client;
use crate::k8s::pod_request::PodRequestParser;
use crate::k8s::KubePodBinder;
use crate::k8s::KubePodLister;
use crate::k8s::PodWatcher;
use crate::scheduling::mock::MockPodBinder;
use crate::scheduling::PodBinder;
use crate::scheduling::SchedulingService;

/// Application builder
pub struct ApplicationBuilder {
    serve_args: ServeArgs,
}

impl ApplicationBuilder {
    pub fn new(serve_args: ServeArgs) -> Self {
        Self { serve_args }
    }

    /// Build complete application
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");
        let args = &self.serve_args;

        let store = Arc::new(DeviceRecordStore::new());
        let inventory = Arc::new(InventoryService::new(
            Arc::clone(&store),
            args.inventory_config(),
        ));
        let engine = AllocationEngine::new(Arc::clone(&store), args.engine_config());
        let parser = PodRequestParser::new(args.resource_names(), args.slice_defaults())
            .with_max_slices(args.max_slices_per_container);

        let binder: Arc<dyn PodBinder>;
        let kubernetes = if args.enable_k8s {
            let client = init_kube_client(args.kubeconfig.clone())
                .await
                .map_err(|e| anyhow::anyhow!("Failed to initialize Kubernetes client: {e:?}"))?;
            binder = Arc::new(KubePodBinder::new(client.clone()));
            Some(KubernetesServices {
                pod_watcher: Arc::new(PodWatcher::new(
                    args.kubeconfig.clone(),
                    args.scheduler_name.clone(),
                )),
                pod_lister: Arc::new(KubePodLister::new(client, args.scheduler_name.clone())),
            })
        } else {
            tracing::warn!("Kubernetes integration disabled, binds are only recorded in memory");
            binder = Arc::new(MockPodBinder::new());
            None
        };

        let scheduling = Arc::new(SchedulingService::new(engine, store, parser, binder));

        let services = ApplicationServices {
            inventory,
            scheduling,
            kubernetes,
        };
        Ok(Application::new(services, self.serve_args))
    }
}
