//! Inventory service: the only writer of node and device topology

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use api_types::DeviceRegistration;
use api_types::PackingPolicy;
use error_stack::bail;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::error::StoreError;
use super::store::DeviceRecordStore;
use super::store::ReplaceOutcome;
use super::store::StoreResult;
use super::types::Capacity;
use super::types::DeviceSpec;
use super::types::InventorySnapshot;
use super::types::NodeId;
use super::types::Reservation;

/// Inventory settings taken from the command line
#[derive(Debug, Clone)]
pub struct InventoryConfig {
    /// Slice limit for devices that do not report one
    pub default_max_slices: u32,
    /// A node is stale after this long without heartbeat or registration
    pub heartbeat_timeout: Duration,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            default_max_slices: 10,
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

pub struct InventoryService {
    store: Arc<DeviceRecordStore>,
    config: InventoryConfig,
}

impl InventoryService {
    pub fn new(store: Arc<DeviceRecordStore>, config: InventoryConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<DeviceRecordStore> {
        &self.store
    }

    /// Replaces the device list of `node`. Calling it again with the same payload
    /// changes nothing but the generation.
    #[tracing::instrument(skip(self, devices), fields(devices = devices.len()))]
    pub fn register(
        &self,
        node: &str,
        devices: Vec<DeviceRegistration>,
        policy: Option<PackingPolicy>,
    ) -> StoreResult<ReplaceOutcome> {
        if node.trim().is_empty() {
            bail!(StoreError::InvalidDevice {
                message: "node name must not be empty".to_string(),
            });
        }

        let specs = devices
            .into_iter()
            .map(|d| DeviceSpec {
                id: d.id,
                total: Capacity::new(d.total_memory, d.total_compute_share),
                max_slices: d.max_slices.unwrap_or(self.config.default_max_slices),
            })
            .collect();

        let outcome = self.store.replace_devices(node, specs, policy)?;
        info!(
            generation = outcome.generation,
            released = outcome.released.len(),
            "Node registered"
        );
        Ok(outcome)
    }

    /// Refreshes liveness of a registered node.
    ///
    /// # Errors
    ///
    /// - [`StoreError::UnknownNode`] / [`StoreError::StaleNode`] when the agent must register again
    pub fn heartbeat(&self, node: &str) -> StoreResult<u64> {
        self.store.heartbeat(node)
    }

    pub fn query(&self, nodes: &[NodeId]) -> InventorySnapshot {
        if nodes.is_empty() {
            self.store.snapshot(None)
        } else {
            self.store.snapshot(Some(nodes))
        }
    }

    pub fn deregister(&self, node: &str) -> Vec<Reservation> {
        self.store.remove_node(node)
    }

    /// Marks every node silent for longer than the heartbeat timeout as stale,
    /// releasing its reservations.
    pub fn sweep_stale(&self, now: Instant) -> Vec<(NodeId, Vec<Reservation>)> {
        self.store
            .nodes_silent_since(now, self.config.heartbeat_timeout)
            .into_iter()
            .filter_map(|node| {
                let timeout = self.config.heartbeat_timeout;
                let Some(released) = self.store.mark_node_stale_if_silent(&node, now, timeout) else {
                    debug!(node = %node, "Node heartbeated while being swept, kept");
                    return None;
                };
                warn!(
                    node = %node,
                    released = released.len(),
                    timeout_secs = timeout.as_secs(),
                    "Node missed heartbeats and was marked stale"
                );
                Some((node, released))
            })
            .collect()
    }

    /// Runs [`Self::sweep_stale`] every `interval` until cancelled.
    pub async fn run_stale_sweeper(&self, interval: Duration, cancellation_token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Stale node sweeper shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep_stale(Instant::now());
                }
            }
        }
    }
}
