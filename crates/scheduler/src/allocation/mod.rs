//! Placement of vGPU slices onto devices
//!
//! Packing and scoring are pure functions over [`NodeSnapshot`](crate::inventory::NodeSnapshot)s;
//! [`AllocationEngine`] combines them with the store to filter, rank and reserve.

pub mod engine;
pub mod error;
pub mod packing;
pub mod request;
pub mod score;

pub use engine::Allocation;
pub use engine::AllocationEngine;
pub use engine::AllocationResult;
pub use engine::EngineConfig;
pub use engine::FeasibilityReport;
pub use engine::Infeasibility;
pub use engine::ReservedSlice;
pub use engine::ScoredNode;
pub use error::AllocationError;
pub use packing::pack;
pub use packing::SlicePlacement;
pub use request::PlacementHints;
pub use request::Request;
pub use request::SliceRequest;
pub use score::ScoreWeights;
pub use score::MAX_NODE_SCORE;
