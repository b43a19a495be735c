//! Scheduler extender protocol on top of the allocation engine
//!
//! - [`SchedulingService`]: `filter`, `prioritize`, `bind`, `pod_deleted`, `pod_released`, `reconcile`
//! - [`PodBinder`] / [`PodLister`]: the Kubernetes side effects it depends on

pub mod binder;
pub mod error;
pub mod mock;
pub mod service;

pub use binder::PodBinder;
pub use binder::PodLister;
pub use error::SchedulingError;
pub use service::FilterOutcome;
pub use service::PodBinding;
pub use service::SchedulingResult;
pub use service::SchedulingService;
pub use service::MAX_EXTENDER_SCORE;
