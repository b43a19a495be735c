//! Allocation engine
//!
//! Two entry points mirror the scheduler's two-phase protocol:
//! [`AllocationEngine::feasible_nodes`] is a read-only simulation over fresh
//! snapshots, [`AllocationEngine::plan_and_reserve`] re-validates on the chosen
//! node and claims capacity through the store's atomic `reserve`. A failed
//! reservation sequence releases every token it acquired, so a partial
//! reservation never outlives the call.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use api_types::PackingPolicy;
use error_stack::bail;
use error_stack::Report;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::error::AllocationError;
use super::packing::pack_projected;
use super::packing::SlicePlacement;
use super::request::Request;
use super::score::score_node;
use super::score::ScoreWeights;
use crate::inventory::Capacity;
use crate::inventory::DeviceId;
use crate::inventory::DeviceRecordStore;
use crate::inventory::NewReservation;
use crate::inventory::NodeAbsence;
use crate::inventory::NodeId;
use crate::inventory::NodeSnapshot;
use crate::inventory::ReservationToken;
use crate::inventory::StoreError;

pub type AllocationResult<T> = Result<T, Report<AllocationError>>;

/// Engine settings
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    /// Cluster-wide policy when neither the pod nor the node chooses one
    pub default_policy: PackingPolicy,
    pub weights: ScoreWeights,
}

/// A node that can host the request, with the placement that proves it
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredNode {
    pub node: NodeId,
    pub score: i64,
    /// Node generation the simulation ran against
    pub generation: u64,
    pub placement: Vec<SlicePlacement>,
}

/// Why a candidate node was filtered out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Infeasibility {
    UnknownNode,
    StaleNode,
    InsufficientCapacity,
}

impl fmt::Display for Infeasibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Infeasibility::UnknownNode => write!(f, "node has no registered vGPU devices"),
            Infeasibility::StaleNode => write!(f, "node vGPU inventory is stale"),
            Infeasibility::InsufficientCapacity => write!(f, "insufficient vGPU capacity"),
        }
    }
}

impl From<NodeAbsence> for Infeasibility {
    fn from(absence: NodeAbsence) -> Self {
        match absence {
            NodeAbsence::Unknown => Infeasibility::UnknownNode,
            NodeAbsence::Stale => Infeasibility::StaleNode,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeasibilityReport {
    /// Sorted by score descending, then node id ascending
    pub feasible: Vec<ScoredNode>,
    pub infeasible: BTreeMap<NodeId, Infeasibility>,
}

/// A slice that now holds a pending reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedSlice {
    pub token: ReservationToken,
    pub container: String,
    pub device: DeviceId,
    pub demand: Capacity,
    pub exclusive: bool,
}

/// Outcome of a successful [`AllocationEngine::plan_and_reserve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub node: NodeId,
    pub generation: u64,
    pub slices: Vec<ReservedSlice>,
}

impl Allocation {
    pub fn tokens(&self) -> Vec<ReservationToken> {
        self.slices.iter().map(|s| s.token).collect()
    }
}

pub struct AllocationEngine {
    store: Arc<DeviceRecordStore>,
    config: EngineConfig,
}

impl AllocationEngine {
    pub fn new(store: Arc<DeviceRecordStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    fn policy_for(&self, request: &Request, node: &NodeSnapshot) -> PackingPolicy {
        request
            .hints
            .policy
            .or(node.policy)
            .unwrap_or(self.config.default_policy)
    }

    /// Rejects slices no registered device could ever hold, without reading any
    /// reservation state.
    fn ensure_satisfiable(&self, request: &Request) -> AllocationResult<()> {
        let Some(ceiling) = self.store.capacity_ceiling() else {
            return Ok(());
        };
        if let Some(slice) = request
            .slices
            .iter()
            .find(|slice| !slice.demand.fits_within(ceiling))
        {
            bail!(AllocationError::RequestUnsatisfiable {
                message: format!(
                    "container {} asks for {} per slice, the largest device offers {}",
                    slice.container, slice.demand, ceiling
                ),
            });
        }
        Ok(())
    }

    fn validate(request: &Request) -> AllocationResult<()> {
        if let Some(slice) = request.slices.iter().find(|s| s.container.is_empty()) {
            bail!(AllocationError::BadRequest {
                message: format!("slice {} has no container name", slice.demand),
            });
        }
        Ok(())
    }

    /// Simulates the request on every candidate node. Read-only and deterministic.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::BadRequest`] for malformed requests
    /// - [`AllocationError::RequestUnsatisfiable`] when a slice exceeds every device
    #[tracing::instrument(skip(self, request, candidates), fields(pod = %request.pod, slices = request.slices.len(), candidates = candidates.len()))]
    pub fn feasible_nodes(
        &self,
        request: &Request,
        candidates: &[NodeId],
    ) -> AllocationResult<FeasibilityReport> {
        Self::validate(request)?;

        let mut report = FeasibilityReport::default();
        if request.is_empty() {
            report.feasible = candidates
                .iter()
                .map(|node| ScoredNode {
                    node: node.clone(),
                    score: 0,
                    generation: 0,
                    placement: Vec::new(),
                })
                .collect();
            report.feasible.sort_by(|a, b| a.node.cmp(&b.node));
            report.feasible.dedup_by(|a, b| a.node == b.node);
            return Ok(report);
        }

        self.ensure_satisfiable(request)?;

        for candidate in candidates {
            if report.infeasible.contains_key(candidate)
                || report.feasible.iter().any(|n| &n.node == candidate)
            {
                continue;
            }
            let Some(snapshot) = self.store.snapshot_node(candidate) else {
                let absence = self
                    .store
                    .node_absence(candidate)
                    .unwrap_or(NodeAbsence::Unknown);
                report.infeasible.insert(candidate.clone(), absence.into());
                continue;
            };

            let policy = self.policy_for(request, &snapshot);
            match pack_projected(request, &snapshot, policy) {
                Some((placement, projected)) => {
                    let score = score_node(&projected, policy, self.config.weights);
                    report.feasible.push(ScoredNode {
                        node: candidate.clone(),
                        score,
                        generation: snapshot.generation,
                        placement,
                    });
                }
                None => {
                    report
                        .infeasible
                        .insert(candidate.clone(), Infeasibility::InsufficientCapacity);
                }
            }
        }

        report
            .feasible
            .sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.node.cmp(&b.node)));
        debug!(
            feasible = report.feasible.len(),
            infeasible = report.infeasible.len(),
            "Feasibility computed"
        );
        Ok(report)
    }

    /// Re-plans the request on `node` and reserves every slice.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::Oversubscribed`] if capacity was consumed since filtering;
    ///   nothing stays reserved
    /// - [`AllocationError::UnknownNode`] / [`AllocationError::StaleNode`]
    /// - [`AllocationError::BadRequest`], [`AllocationError::RequestUnsatisfiable`]
    #[tracing::instrument(skip(self, request), fields(pod = %request.pod, slices = request.slices.len()))]
    pub fn plan_and_reserve(&self, request: &Request, node: &str) -> AllocationResult<Allocation> {
        Self::validate(request)?;
        if request.is_empty() {
            return Ok(Allocation {
                node: node.to_string(),
                generation: 0,
                slices: Vec::new(),
            });
        }
        self.ensure_satisfiable(request)?;

        let Some(snapshot) = self.store.snapshot_node(node) else {
            match self.store.node_absence(node) {
                Some(NodeAbsence::Stale) => bail!(AllocationError::StaleNode {
                    node: node.to_string(),
                }),
                _ => bail!(AllocationError::UnknownNode {
                    node: node.to_string(),
                }),
            }
        };

        let policy = self.policy_for(request, &snapshot);
        let Some((placement, _)) = pack_projected(request, &snapshot, policy) else {
            warn!(node = node, "Node no longer fits the request");
            bail!(AllocationError::Oversubscribed {
                node: node.to_string(),
            });
        };

        let mut reserved: Vec<ReservedSlice> = Vec::with_capacity(placement.len());
        for slice in placement {
            let claim = NewReservation {
                pod: request.pod.clone(),
                container: slice.container.clone(),
                demand: slice.demand,
                exclusive: slice.exclusive,
            };
            match self.store.reserve(node, &slice.device, claim) {
                Ok(token) => reserved.push(ReservedSlice {
                    token,
                    container: slice.container,
                    device: slice.device,
                    demand: slice.demand,
                    exclusive: slice.exclusive,
                }),
                Err(report) => {
                    for acquired in &reserved {
                        self.store.release(acquired.token);
                    }
                    warn!(
                        node = node,
                        device = %slice.device,
                        rolled_back = reserved.len(),
                        error = %report,
                        "Reservation sequence failed, rolled back"
                    );
                    let context = match report.current_context() {
                        StoreError::StaleNode { .. } => AllocationError::StaleNode {
                            node: node.to_string(),
                        },
                        StoreError::UnknownNode { .. } => AllocationError::UnknownNode {
                            node: node.to_string(),
                        },
                        _ => AllocationError::Oversubscribed {
                            node: node.to_string(),
                        },
                    };
                    return Err(report.change_context(context));
                }
            }
        }

        info!(
            node = node,
            generation = snapshot.generation,
            devices = ?reserved.iter().map(|s| s.device.as_str()).collect::<Vec<_>>(),
            "Slices reserved"
        );
        Ok(Allocation {
            node: node.to_string(),
            generation: snapshot.generation,
            slices: reserved,
        })
    }
}
