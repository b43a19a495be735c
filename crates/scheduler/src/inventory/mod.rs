//! Device inventory: the authoritative record of GPU capacity and reservations.
//!
//! - [`DeviceRecordStore`]: concurrent node → device → reservation table
//! - [`InventoryService`]: registration, heartbeat, query and stale-node cleanup

pub mod error;
pub mod service;
pub mod store;
pub mod types;

pub use error::StoreError;
pub use service::InventoryConfig;
pub use service::InventoryService;
pub use store::DeviceRecordStore;
pub use store::ReplaceOutcome;
pub use store::StoreResult;
pub use types::*;
