use std::path::PathBuf;
use std::time::Duration;

use error_stack::Report;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::watcher;
use kube::runtime::watcher::Config;
use kube::runtime::watcher::Event;
use kube::Api;
use kube::Client;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::kube_client;
use super::pod_request::pod_identifier;
use super::types::KubernetesError;
use super::types::PodEvent;
use super::types::ReleaseReason;

/// Why a pod no longer needs its devices, or `None` while it still runs.
pub fn is_terminal(pod: &Pod) -> Option<ReleaseReason> {
    if pod.metadata.deletion_timestamp.is_some() {
        return Some(ReleaseReason::Deleted);
    }
    match pod.status.as_ref()?.phase.as_deref()? {
        "Succeeded" => Some(ReleaseReason::Succeeded),
        "Failed" => Some(ReleaseReason::Failed),
        _ => None,
    }
}

/// Watches the pods handled by this scheduler and reports the ones whose
/// devices can be given back.
pub struct PodWatcher {
    kubeconfig: Option<PathBuf>,
    scheduler_name: String,
}

impl PodWatcher {
    pub fn new(kubeconfig: Option<PathBuf>, scheduler_name: String) -> Self {
        Self {
            kubeconfig,
            scheduler_name,
        }
    }

    /// Start watching pods for changes.
    ///
    /// Runs until cancelled; a failed watch stream is restarted after five seconds.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError::ConnectionFailed`] if no client can be built
    #[tracing::instrument(skip(self, event_sender, cancellation_token), fields(scheduler_name = %self.scheduler_name))]
    pub async fn run(
        &self,
        event_sender: mpsc::Sender<PodEvent>,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<KubernetesError>> {
        info!("Starting pod watcher");
        let client = kube_client::init_kube_client(self.kubeconfig.clone()).await?;
        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Pod watcher shutdown requested");
                    break;
                }
                result = self.watch_pods(&client, &event_sender) => {
                    match result {
                        Ok(()) => {
                            warn!("Pod watch stream ended unexpectedly, restarting...");
                        }
                        Err(e) => {
                            error!("Pod watch failed: {e:?}");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn watch_pods(
        &self,
        client: &Client,
        event_sender: &mpsc::Sender<PodEvent>,
    ) -> Result<(), Report<KubernetesError>> {
        let api: Api<Pod> = Api::all(client.clone());
        let config =
            Config::default().fields(&format!("spec.schedulerName={}", self.scheduler_name));

        let mut stream = watcher(api, config).boxed();

        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Applied(pod)) => Self::forward(release_event(&pod, false), event_sender).await,
                Ok(Event::Deleted(pod)) => Self::forward(release_event(&pod, true), event_sender).await,
                Ok(Event::Restarted(pods)) => {
                    for pod in &pods {
                        Self::forward(release_event(pod, false), event_sender).await;
                    }
                }
                Err(e) => {
                    return Err(Report::new(KubernetesError::WatchFailed {
                        message: format!("Watch stream error: {e}"),
                    }));
                }
            }
        }

        Ok(())
    }

    async fn forward(event: Option<PodEvent>, event_sender: &mpsc::Sender<PodEvent>) {
        let Some(event) = event else {
            return;
        };
        if let Err(e) = event_sender.send(event).await {
            warn!("Failed to send pod event: {e}");
        }
    }
}

fn release_event(pod: &Pod, deleted: bool) -> Option<PodEvent> {
    let reason = if deleted {
        ReleaseReason::Deleted
    } else {
        is_terminal(pod)?
    };
    match pod_identifier(pod) {
        Ok(id) => Some(PodEvent::Released {
            pod: id,
            uid: pod.metadata.uid.clone(),
            reason,
        }),
        Err(e) => {
            warn!("Ignoring pod event without identity: {e:?}");
            None
        }
    }
}
