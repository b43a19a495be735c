use anyhow::Result;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::ServeArgs;

/// Built scheduler: services plus the arguments the tasks are configured from
pub struct Application {
    services: ApplicationServices,
    serve_args: ServeArgs,
}

impl Application {
    pub fn new(services: ApplicationServices, serve_args: ServeArgs) -> Self {
        Self {
            services,
            serve_args,
        }
    }

    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    pub fn serve_args(&self) -> &ServeArgs {
        &self.serve_args
    }

    /// Serves until a shutdown signal arrives or one of the tasks exits.
    pub async fn run(&self) -> Result<()> {
        let mut tasks = Tasks::new();
        tasks
            .spawn_all_tasks(self)
            .inspect_err(|e| tracing::error!("Failed to spawn scheduler tasks: {e}"))?;
        tracing::info!(
            tasks = tasks.tasks.len(),
            kubernetes = self.services.kubernetes.is_some(),
            "Scheduler tasks started"
        );

        tasks
            .wait_for_completion()
            .await
            .inspect_err(|e| tracing::error!("Scheduler task failed: {e}"))?;

        let nodes = self.services.inventory.store().node_ids().len();
        tracing::info!(registered_nodes = nodes, "Scheduler stopped");
        Ok(())
    }
}
