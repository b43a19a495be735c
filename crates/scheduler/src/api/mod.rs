//! HTTP transport: extender verbs, admission webhook and inventory endpoints

pub mod errors;
pub mod extender;
pub mod inventory;
pub mod server;
pub mod webhook;

pub use errors::ApiError;
pub use server::routes;
pub use server::ApiServer;
pub use server::TlsFiles;
pub use webhook::WebhookConfig;
