//! Shared API type definitions
//!
//! This crate contains the wire types spoken by the vgpu scheduler: the inventory
//! calls made by node agents (register, heartbeat, query) and the kube-scheduler
//! extender protocol (filter, prioritize, bind).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use serde::Deserialize;
use serde::Serialize;

/// Placement policy for vGPU slices on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackingPolicy {
    /// Fill nearly-full devices first
    #[default]
    Binpack,
    /// Prefer the least loaded devices
    Spread,
}

impl fmt::Display for PackingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackingPolicy::Binpack => write!(f, "binpack"),
            PackingPolicy::Spread => write!(f, "spread"),
        }
    }
}

impl FromStr for PackingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binpack" => Ok(PackingPolicy::Binpack),
            "spread" => Ok(PackingPolicy::Spread),
            other => Err(format!("unknown packing policy `{other}`, expected binpack or spread")),
        }
    }
}

/// Lifecycle of a single device reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    /// Registered during bind, waiting for the pod binding to succeed
    Pending,
    /// The pod was bound successfully
    Committed,
    /// The claim was given back
    Released,
}

/// Generic response envelope for inventory calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryResponse<T> {
    /// Whether the request was successful
    pub success: bool,
    /// Payload (present when successful)
    pub data: Option<T>,
    /// Response message
    pub message: String,
}

impl<T> InventoryResponse<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: message.into(),
        }
    }
}

/// One physical device as reported by a node agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    /// Stable device identifier, e.g. `0-GPU-7d8429d5-...`
    pub id: String,
    /// Total device memory in MiB
    pub total_memory: u64,
    /// Total compute-share units (100 per card unless time-sliced)
    pub total_compute_share: u32,
    /// Maximum number of concurrent slices; the scheduler default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_slices: Option<u32>,
}

/// Full-replace registration of a node's devices
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub node: String,
    pub devices: Vec<DeviceRegistration>,
    /// Per-node packing policy override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PackingPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub node: String,
    pub generation: u64,
    /// Reservations dropped because their device disappeared from the node
    pub released_reservations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub node: String,
    pub generation: u64,
}

/// Inventory query; an empty node list selects every node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Nodes found by a query, plus the reason each missing node is absent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub nodes: Vec<NodeView>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub missing: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeregisterResponse {
    pub node: String,
    pub released_reservations: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationView {
    pub token: u64,
    /// Owning pod as `namespace/name`
    pub pod: String,
    pub container: String,
    pub memory: u64,
    pub compute_share: u32,
    pub exclusive: bool,
    pub state: ReservationState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub id: String,
    pub total_memory: u64,
    pub total_compute_share: u32,
    pub max_slices: u32,
    pub used_memory: u64,
    pub used_compute_share: u32,
    pub reservations: Vec<ReservationView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub node: String,
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PackingPolicy>,
    pub devices: Vec<DeviceView>,
}

/// Node list as embedded in extender requests; only the items are used
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtenderNodeList {
    #[serde(default)]
    pub items: Vec<Node>,
}

/// Arguments of the `filter` and `prioritize` extender verbs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtenderArgs {
    #[serde(default)]
    pub pod: Option<Pod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<ExtenderNodeList>,
    #[serde(default, rename = "nodenames", skip_serializing_if = "Option::is_none")]
    pub node_names: Option<Vec<String>>,
}

impl ExtenderArgs {
    /// Candidate node names, whether they were sent as names or as full objects
    pub fn candidate_names(&self) -> Option<Vec<String>> {
        if let Some(names) = &self.node_names {
            return Some(names.clone());
        }
        self.nodes.as_ref().map(|list| {
            list.items
                .iter()
                .filter_map(|node| node.metadata.name.clone())
                .collect()
        })
    }
}

/// Result of the `filter` extender verb
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtenderFilterResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<ExtenderNodeList>,
    #[serde(default, rename = "nodenames", skip_serializing_if = "Option::is_none")]
    pub node_names: Option<Vec<String>>,
    #[serde(default, rename = "failedNodes", skip_serializing_if = "BTreeMap::is_empty")]
    pub failed_nodes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Score of one host, as returned by the `prioritize` verb
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPriority {
    pub host: String,
    pub score: i64,
}

pub type HostPriorityList = Vec<HostPriority>;

/// Arguments of the `bind` extender verb
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtenderBindingArgs {
    pub pod_name: String,
    pub pod_namespace: String,
    #[serde(rename = "podUID", default)]
    pub pod_uid: String,
    pub node: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtenderBindingResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}
