use api_types::PackingPolicy;

use crate::inventory::Capacity;
use crate::inventory::PodIdentifier;

/// One vGPU slice: a fractional claim that must land on a single device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceRequest {
    /// Container the slice belongs to; slices of one container use distinct devices
    pub container: String,
    pub demand: Capacity,
}

/// Optional placement preferences carried by the pod
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlacementHints {
    /// Overrides the node and cluster packing policy
    pub policy: Option<PackingPolicy>,
    /// Every slice owns its device exclusively
    pub exclusive: bool,
}

/// vGPU demand of one pod, derived from its spec for the duration of one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub pod: PodIdentifier,
    pub slices: Vec<SliceRequest>,
    pub hints: PlacementHints,
}

impl Request {
    pub fn new(pod: PodIdentifier, slices: Vec<SliceRequest>) -> Self {
        Self {
            pod,
            slices,
            hints: PlacementHints::default(),
        }
    }

    pub fn with_hints(mut self, hints: PlacementHints) -> Self {
        self.hints = hints;
        self
    }

    /// A pod without vGPU slices needs nothing from this extender
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Convenience constructor for `count` identical slices of one container
    pub fn uniform(
        pod: PodIdentifier,
        container: impl Into<String>,
        count: usize,
        demand: Capacity,
    ) -> Self {
        let container = container.into();
        let slices = (0..count)
            .map(|_| SliceRequest {
                container: container.clone(),
                demand,
            })
            .collect();
        Self::new(pod, slices)
    }
}
