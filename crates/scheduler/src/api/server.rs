use std::path::PathBuf;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use poem::delete;
use poem::get;
use poem::handler;
use poem::listener::Listener;
use poem::listener::RustlsCertificate;
use poem::listener::RustlsConfig;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::post;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::errors::ApiError;
use super::extender;
use super::inventory;
use super::webhook;
use super::webhook::WebhookConfig;
use crate::inventory::InventoryService;
use crate::scheduling::SchedulingService;

/// Certificate and key served when TLS is enabled
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[handler]
pub async fn ping() -> &'static str {
    "ok"
}

/// Every route served by the scheduler
pub fn routes(
    scheduling: Arc<SchedulingService>,
    inventory: Arc<InventoryService>,
    webhook: Arc<WebhookConfig>,
) -> impl Endpoint {
    let inventory_routes = Route::new()
        .at("/register", post(inventory::register))
        .at("/heartbeat", post(inventory::heartbeat))
        .at("/query", post(inventory::query))
        .at("/nodes", get(inventory::list_nodes))
        .at("/nodes/:node", delete(inventory::deregister));

    Route::new()
        .at("/healthz", get(ping))
        .at("/readyz", get(ping))
        .at("/filter", post(extender::filter))
        .at("/prioritize", post(extender::prioritize))
        .at("/bind", post(extender::bind))
        .at("/webhook", post(webhook::mutate))
        .nest("/api/v1/inventory", inventory_routes)
        .data(scheduling)
        .data(inventory)
        .data(webhook)
        .with(Tracing)
}

/// HTTP server for the extender, webhook and inventory routes
pub struct ApiServer {
    scheduling: Arc<SchedulingService>,
    inventory: Arc<InventoryService>,
    webhook: Arc<WebhookConfig>,
    listen_addr: String,
    tls: Option<TlsFiles>,
}

impl ApiServer {
    pub fn new(
        scheduling: Arc<SchedulingService>,
        inventory: Arc<InventoryService>,
        webhook: WebhookConfig,
        listen_addr: String,
        tls: Option<TlsFiles>,
    ) -> Self {
        Self {
            scheduling,
            inventory,
            webhook: Arc::new(webhook),
            listen_addr,
            tls,
        }
    }

    /// Start the API server
    ///
    /// # Errors
    ///
    /// - [`ApiError::TlsConfig`] if the certificate or key cannot be read
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, cancellation_token: CancellationToken) -> Result<(), Report<ApiError>> {
        let app = routes(
            self.scheduling.clone(),
            self.inventory.clone(),
            self.webhook.clone(),
        );
        let listener = TcpListener::bind(self.listen_addr.clone());

        match &self.tls {
            Some(tls) => {
                let config = load_tls(tls).await?;
                info!("Starting HTTPS API server on {}", self.listen_addr);
                serve(listener.rustls(config), app, cancellation_token).await
            }
            None => {
                info!("Starting HTTP API server on {}", self.listen_addr);
                serve(listener, app, cancellation_token).await
            }
        }
    }
}

async fn load_tls(tls: &TlsFiles) -> Result<RustlsConfig, Report<ApiError>> {
    let cert = tokio::fs::read(&tls.cert_file)
        .await
        .change_context_lazy(|| ApiError::TlsConfig {
            message: format!("failed to read {}", tls.cert_file.display()),
        })?;
    let key = tokio::fs::read(&tls.key_file)
        .await
        .change_context_lazy(|| ApiError::TlsConfig {
            message: format!("failed to read {}", tls.key_file.display()),
        })?;
    Ok(RustlsConfig::new().fallback(RustlsCertificate::new().cert(cert).key(key)))
}

async fn serve<L, E>(
    listener: L,
    app: E,
    cancellation_token: CancellationToken,
) -> Result<(), Report<ApiError>>
where
    L: Listener + 'static,
    E: Endpoint + 'static,
{
    let server = Server::new(listener);

    tokio::select! {
        result = server.run(app) => {
            match result {
                Ok(()) => {
                    info!("API server stopped normally");
                    Ok(())
                }
                Err(e) => {
                    error!("API server failed: {e}");
                    Err(Report::new(ApiError::ServerError {
                        message: format!("Server failed: {e}"),
                    }))
                }
            }
        }
        _ = cancellation_token.cancelled() => {
            info!("API server shutdown requested");
            Ok(())
        }
    }
}
