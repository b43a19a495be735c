use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;
use tracing::info;

use super::types::KubernetesError;

fn connection_failed(message: impl Into<String>) -> KubernetesError {
    KubernetesError::ConnectionFailed {
        message: message.into(),
    }
}

/// Client for the API server the scheduler binds pods against.
///
/// Without an explicit kubeconfig the in-cluster service account is tried
/// first, then `~/.kube/config`.
pub async fn init_kube_client(
    kubeconfig: Option<PathBuf>,
) -> Result<Client, Report<KubernetesError>> {
    let config = match kubeconfig.as_deref() {
        Some(path) => config_from_file(path).await?,
        None => Config::infer()
            .await
            .change_context_lazy(|| connection_failed("no in-cluster or local kubeconfig found"))?,
    };
    info!(cluster_url = %config.cluster_url, "Connecting to Kubernetes API server");

    Client::try_from(config)
        .change_context_lazy(|| connection_failed("failed to create Kubernetes client"))
}

async fn config_from_file(path: &Path) -> Result<Config, Report<KubernetesError>> {
    let kubeconfig = Kubeconfig::read_from(path).change_context_lazy(|| {
        connection_failed(format!("failed to read kubeconfig {}", path.display()))
    })?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .change_context_lazy(|| {
            connection_failed(format!("invalid kubeconfig {}", path.display()))
        })
}
