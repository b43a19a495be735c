//! Node, device and reservation records owned by the device record store

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use api_types::DeviceView;
use api_types::NodeView;
use api_types::PackingPolicy;
use api_types::ReservationState;
use api_types::ReservationView;

pub type NodeId = String;
pub type DeviceId = String;

/// Namespace-qualified pod name, unique per live pod
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodIdentifier {
    pub namespace: String,
    pub name: String,
}

impl PodIdentifier {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Amount of device resources: memory in MiB and compute-share units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capacity {
    pub memory: u64,
    pub compute_share: u32,
}

impl Capacity {
    pub const fn new(memory: u64, compute_share: u32) -> Self {
        Self {
            memory,
            compute_share,
        }
    }

    pub fn checked_add(self, other: Capacity) -> Option<Capacity> {
        Some(Capacity {
            memory: self.memory.checked_add(other.memory)?,
            compute_share: self.compute_share.checked_add(other.compute_share)?,
        })
    }

    pub fn saturating_sub(self, other: Capacity) -> Capacity {
        Capacity {
            memory: self.memory.saturating_sub(other.memory),
            compute_share: self.compute_share.saturating_sub(other.compute_share),
        }
    }

    /// True when `self` fits inside `limit` on every dimension
    pub fn fits_within(self, limit: Capacity) -> bool {
        self.memory <= limit.memory && self.compute_share <= limit.compute_share
    }

    /// Per-dimension maximum
    pub fn max(self, other: Capacity) -> Capacity {
        Capacity {
            memory: self.memory.max(other.memory),
            compute_share: self.compute_share.max(other.compute_share),
        }
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{memory {}, compute {}}}", self.memory, self.compute_share)
    }
}

/// Monotonic handle of one reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReservationToken(pub(crate) u64);

impl ReservationToken {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReservationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rsv-{}", self.0)
    }
}

/// Capacity description of a device as published by its node agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub id: DeviceId,
    pub total: Capacity,
    /// Maximum number of concurrent reservations
    pub max_slices: u32,
}

/// Claim to be placed on a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub pod: PodIdentifier,
    pub container: String,
    pub demand: Capacity,
    /// Whole-device ownership
    pub exclusive: bool,
}

/// One pod's claim on one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub token: ReservationToken,
    pub pod: PodIdentifier,
    pub container: String,
    pub demand: Capacity,
    pub exclusive: bool,
    pub state: ReservationState,
}

impl Reservation {
    pub(crate) fn pending(token: ReservationToken, new: NewReservation) -> Self {
        Self {
            token,
            pod: new.pod,
            container: new.container,
            demand: new.demand,
            exclusive: new.exclusive,
            state: ReservationState::Pending,
        }
    }

    pub fn to_view(&self) -> ReservationView {
        ReservationView {
            token: self.token.get(),
            pod: self.pod.to_string(),
            container: self.container.clone(),
            memory: self.demand.memory,
            compute_share: self.demand.compute_share,
            exclusive: self.exclusive,
            state: self.state,
        }
    }
}

/// A device with its live reservations. Snapshots hand out owned copies of this record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub spec: DeviceSpec,
    pub reservations: Vec<Reservation>,
}

impl DeviceRecord {
    pub fn new(spec: DeviceSpec) -> Self {
        Self {
            spec,
            reservations: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// Sum of pending and committed reservations
    pub fn used(&self) -> Capacity {
        self.reservations
            .iter()
            .fold(Capacity::default(), |acc, r| Capacity {
                memory: acc.memory + r.demand.memory,
                compute_share: acc.compute_share + r.demand.compute_share,
            })
    }

    pub fn free(&self) -> Capacity {
        self.spec.total.saturating_sub(self.used())
    }

    pub fn has_exclusive(&self) -> bool {
        self.reservations.iter().any(|r| r.exclusive)
    }

    /// Whether one more reservation of `demand` keeps every capacity dimension,
    /// the slice limit and exclusivity intact.
    pub fn admits(&self, demand: Capacity, exclusive: bool) -> bool {
        if self.reservations.len() >= self.spec.max_slices as usize {
            return false;
        }
        if self.has_exclusive() || (exclusive && !self.reservations.is_empty()) {
            return false;
        }
        match self.used().checked_add(demand) {
            Some(projected) => projected.fits_within(self.spec.total),
            None => false,
        }
    }

    pub fn to_view(&self) -> DeviceView {
        let used = self.used();
        DeviceView {
            id: self.spec.id.clone(),
            total_memory: self.spec.total.memory,
            total_compute_share: self.spec.total.compute_share,
            max_slices: self.spec.max_slices,
            used_memory: used.memory,
            used_compute_share: used.compute_share,
            reservations: self.reservations.iter().map(Reservation::to_view).collect(),
        }
    }
}

/// Live node entry inside the store
#[derive(Debug, Clone)]
pub(crate) struct NodeRecord {
    pub devices: Vec<DeviceRecord>,
    pub generation: u64,
    pub last_heartbeat: Instant,
    pub policy: Option<PackingPolicy>,
}

impl NodeRecord {
    pub fn new(now: Instant) -> Self {
        Self {
            devices: Vec::new(),
            generation: 0,
            last_heartbeat: now,
            policy: None,
        }
    }

    pub fn device_mut(&mut self, device: &str) -> Option<&mut DeviceRecord> {
        self.devices.iter_mut().find(|d| d.spec.id == device)
    }

    /// Largest device totals on this node, per dimension
    pub fn ceiling(&self) -> Option<Capacity> {
        self.devices
            .iter()
            .map(|d| d.spec.total)
            .reduce(Capacity::max)
    }
}

/// Point-in-time copy of one node, taken under a single lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub node: NodeId,
    pub generation: u64,
    pub policy: Option<PackingPolicy>,
    pub devices: Vec<DeviceRecord>,
}

impl NodeSnapshot {
    pub fn device(&self, id: &str) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| d.spec.id == id)
    }

    pub fn to_view(&self) -> NodeView {
        NodeView {
            node: self.node.clone(),
            generation: self.generation,
            policy: self.policy,
            devices: self.devices.iter().map(DeviceRecord::to_view).collect(),
        }
    }
}

/// Why a requested node is missing from a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAbsence {
    /// Never registered, or deregistered
    Unknown,
    /// Removed after missing heartbeats
    Stale,
}

impl fmt::Display for NodeAbsence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeAbsence::Unknown => write!(f, "node is not registered"),
            NodeAbsence::Stale => write!(f, "node is stale"),
        }
    }
}

/// Snapshot of a set of nodes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventorySnapshot {
    pub nodes: BTreeMap<NodeId, NodeSnapshot>,
    pub missing: BTreeMap<NodeId, NodeAbsence>,
}
