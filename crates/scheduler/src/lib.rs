pub mod allocation;
pub mod api;
pub mod app;
pub mod config;
pub mod inventory;
pub mod k8s;
pub mod scheduling;
