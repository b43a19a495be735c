use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::ApiServer;
use crate::api::WebhookConfig;
use crate::app::core::Application;
use crate::k8s::PodEvent;
use crate::k8s::PodWatcher;
use crate::scheduling::PodLister;
use crate::scheduling::SchedulingService;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(unix)]
fn shutdown_signal() -> Result<impl std::future::Future<Output = &'static str>> {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> Result<impl std::future::Future<Output = &'static str>> {
    Ok(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
        "Ctrl+C"
    })
}

/// Background tasks of the scheduler, sharing one cancellation token
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, app: &Application) -> Result<()> {
        let stale_sweeper_task = self.spawn_stale_sweeper_task(app);
        self.tasks.push(stale_sweeper_task);

        if let Some(kubernetes) = &app.services().kubernetes {
            let (pod_event_sender, pod_event_receiver) = mpsc::channel::<PodEvent>(64);

            let watcher_task =
                self.spawn_k8s_watcher_task(kubernetes.pod_watcher.clone(), pod_event_sender);
            self.tasks.push(watcher_task);

            let processor_task = self.spawn_pod_event_processor_task(
                app.services().scheduling.clone(),
                pod_event_receiver,
            );
            self.tasks.push(processor_task);

            let reconciler_task = self.spawn_reconciler_task(
                app,
                app.services().scheduling.clone(),
                kubernetes.pod_lister.clone(),
            );
            self.tasks.push(reconciler_task);
        }

        let api_server_task = self.spawn_api_server_task(app);
        self.tasks.push(api_server_task);

        Ok(())
    }

    /// Waits for SIGTERM/SIGINT or for the first task to exit, then cancels the rest.
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal = shutdown_signal()?;

        tokio::select! {
            name = signal => {
                tracing::info!(signal = name, "Received shutdown signal, cancelling all tasks");
                self.cancellation_token.cancel();
                self.wait_for_tasks_with_timeout(SHUTDOWN_TIMEOUT).await;
            }
            (result, index, _remaining) = futures::future::select_all(&mut self.tasks) => {
                self.cancellation_token.cancel();
                if let Err(e) = result {
                    tracing::error!(task = index, "Task completed with error: {e}");
                    return Err(e.into());
                }
                tracing::warn!(task = index, "Task completed unexpectedly");
            }
        }

        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        let drained = tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!("Task shutdown timed out after {timeout:?}");
        }
    }

    fn spawn_stale_sweeper_task(&self, app: &Application) -> JoinHandle<()> {
        let inventory = app.services().inventory.clone();
        let interval = Duration::from_secs(app.serve_args().stale_sweep_interval_secs.max(1));
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting stale node sweeper task");
            inventory.run_stale_sweeper(interval, token).await;
            tracing::info!("Stale node sweeper task completed");
        })
    }

    fn spawn_k8s_watcher_task(
        &self,
        pod_watcher: Arc<PodWatcher>,
        pod_event_sender: mpsc::Sender<PodEvent>,
    ) -> JoinHandle<()> {
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting Kubernetes pod watcher task");
            if let Err(e) = pod_watcher.run(pod_event_sender, token).await {
                tracing::error!("Kubernetes pod watcher failed: {e:?}");
            } else {
                tracing::info!("Kubernetes pod watcher completed");
            }
        })
    }

    fn spawn_pod_event_processor_task(
        &self,
        scheduling: Arc<SchedulingService>,
        pod_event_receiver: mpsc::Receiver<PodEvent>,
    ) -> JoinHandle<()> {
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting pod event processor task");
            scheduling
                .process_pod_events(pod_event_receiver, token)
                .await;
            tracing::info!("Pod event processor task completed");
        })
    }

    fn spawn_reconciler_task(
        &self,
        app: &Application,
        scheduling: Arc<SchedulingService>,
        pod_lister: Arc<dyn PodLister>,
    ) -> JoinHandle<()> {
        let interval = Duration::from_secs(app.serve_args().reconcile_interval_secs.max(1));
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting reservation reconciler task");
            scheduling.run_reconciler(pod_lister, interval, token).await;
            tracing::info!("Reservation reconciler task completed");
        })
    }

    fn spawn_api_server_task(&self, app: &Application) -> JoinHandle<()> {
        let args = app.serve_args();
        let api_server = ApiServer::new(
            app.services().scheduling.clone(),
            app.services().inventory.clone(),
            WebhookConfig {
                scheduler_name: args.scheduler_name.clone(),
            },
            args.http_bind.clone(),
            args.tls(),
        );
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            if let Err(e) = api_server.run(token).await {
                tracing::error!("API server failed: {e:?}");
            } else {
                tracing::info!("API server completed");
            }
        })
    }
}
