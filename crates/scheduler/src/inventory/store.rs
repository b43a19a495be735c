//! Device record store
//!
//! The single authoritative, concurrently mutated table of nodes, devices and
//! reservations. Every node lives in its own map entry: mutations of a node run
//! under that entry's write lock, so the capacity check and the append of a
//! reservation are one critical section, and a snapshot copies a node under one
//! read lock. Operations on different nodes never wait on each other.
//!
//! Lock order: a `nodes` entry may be held while touching `tokens` or
//! `ceilings`, never the other way round.

use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use api_types::PackingPolicy;
use api_types::ReservationState;
use dashmap::DashMap;
use error_stack::bail;
use error_stack::Report;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::error::StoreError;
use super::types::Capacity;
use super::types::DeviceId;
use super::types::DeviceRecord;
use super::types::DeviceSpec;
use super::types::InventorySnapshot;
use super::types::NewReservation;
use super::types::NodeAbsence;
use super::types::NodeId;
use super::types::NodeRecord;
use super::types::NodeSnapshot;
use super::types::PodIdentifier;
use super::types::Reservation;
use super::types::ReservationToken;

pub type StoreResult<T> = Result<T, Report<StoreError>>;

#[derive(Debug, Clone)]
struct TokenLocation {
    node: NodeId,
    device: DeviceId,
}

/// Result of a full device-list replacement
#[derive(Debug, Clone)]
pub struct ReplaceOutcome {
    pub generation: u64,
    /// Reservations dropped together with devices that left the node
    pub released: Vec<Reservation>,
}

#[derive(Debug)]
pub struct DeviceRecordStore {
    nodes: DashMap<NodeId, NodeRecord>,
    tokens: DashMap<ReservationToken, TokenLocation>,
    /// Largest device totals per node, read by the fast-fail check
    ceilings: DashMap<NodeId, Capacity>,
    /// Nodes removed for missing heartbeats, until they register again
    stale: DashMap<NodeId, Instant>,
    next_token: AtomicU64,
}

impl Default for DeviceRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRecordStore {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            tokens: DashMap::new(),
            ceilings: DashMap::new(),
            stale: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    fn absence(&self, node: &str) -> NodeAbsence {
        if self.stale.contains_key(node) {
            NodeAbsence::Stale
        } else {
            NodeAbsence::Unknown
        }
    }

    fn missing_node_error(&self, node: &str) -> Report<StoreError> {
        match self.absence(node) {
            NodeAbsence::Stale => Report::new(StoreError::StaleNode {
                node: node.to_string(),
            }),
            NodeAbsence::Unknown => Report::new(StoreError::UnknownNode {
                node: node.to_string(),
            }),
        }
    }

    fn refresh_ceiling(&self, node: &str, record: &NodeRecord) {
        match record.ceiling() {
            Some(ceiling) => {
                self.ceilings.insert(node.to_string(), ceiling);
            }
            None => {
                self.ceilings.remove(node);
            }
        }
    }

    /// Inserts or replaces the capacity of one device, creating the node on first use.
    ///
    /// Reservations on an existing device are kept; the new totals must still hold them.
    pub fn upsert_device(&self, node: &str, spec: DeviceSpec) -> StoreResult<u64> {
        validate_spec(&spec)?;

        let mut record = self
            .nodes
            .entry(node.to_string())
            .or_insert_with(|| NodeRecord::new(Instant::now()));

        match record.device_mut(&spec.id) {
            Some(existing) => {
                ensure_still_fits(node, existing, &spec)?;
                existing.spec = spec;
            }
            None => record.devices.push(DeviceRecord::new(spec)),
        }
        record.generation += 1;
        let generation = record.generation;
        self.refresh_ceiling(node, &record);
        drop(record);

        self.stale.remove(node);
        Ok(generation)
    }

    /// Replaces the whole device list of a node.
    ///
    /// Devices whose id is kept retain their reservations, devices absent from
    /// `specs` are dropped with theirs. The call is validated completely before
    /// anything changes, so it either applies entirely or not at all.
    pub fn replace_devices(
        &self,
        node: &str,
        specs: Vec<DeviceSpec>,
        policy: Option<PackingPolicy>,
    ) -> StoreResult<ReplaceOutcome> {
        let mut seen = HashSet::new();
        for spec in &specs {
            validate_spec(spec)?;
            if !seen.insert(spec.id.as_str()) {
                bail!(StoreError::InvalidDevice {
                    message: format!("duplicate device id {} on node {node}", spec.id),
                });
            }
        }

        let now = Instant::now();
        let mut record = self
            .nodes
            .entry(node.to_string())
            .or_insert_with(|| NodeRecord::new(now));

        for spec in &specs {
            if let Some(existing) = record.devices.iter().find(|d| d.spec.id == spec.id) {
                ensure_still_fits(node, existing, spec)?;
            }
        }

        let mut previous = std::mem::take(&mut record.devices);
        let mut devices = Vec::with_capacity(specs.len());
        for spec in specs {
            let reservations = previous
                .iter()
                .position(|d| d.spec.id == spec.id)
                .map(|idx| previous.swap_remove(idx).reservations)
                .unwrap_or_default();
            devices.push(DeviceRecord { spec, reservations });
        }
        let released: Vec<Reservation> = previous
            .into_iter()
            .flat_map(|d| d.reservations)
            .collect();

        record.devices = devices;
        record.policy = policy;
        record.last_heartbeat = now;
        record.generation += 1;
        let generation = record.generation;
        self.refresh_ceiling(node, &record);
        for reservation in &released {
            self.tokens.remove(&reservation.token);
        }
        drop(record);

        self.stale.remove(node);
        if !released.is_empty() {
            warn!(
                node = node,
                released = released.len(),
                "Devices left the node, their reservations were released"
            );
        }
        Ok(ReplaceOutcome {
            generation,
            released,
        })
    }

    /// Removes a node with all devices and reservations.
    pub fn remove_node(&self, node: &str) -> Vec<Reservation> {
        let released = self
            .nodes
            .remove(node)
            .map(|(_, record)| self.drop_record(node, record))
            .unwrap_or_default();
        self.stale.remove(node);
        released
    }

    /// Removes `node` if its last heartbeat is older than `timeout` at `now`.
    /// Later lookups report it as stale until it registers again.
    ///
    /// The heartbeat is re-read under the entry lock, so a node that registered or
    /// heartbeated since it was listed as silent is kept. Returns `None` then.
    pub fn mark_node_stale_if_silent(
        &self,
        node: &str,
        now: Instant,
        timeout: Duration,
    ) -> Option<Vec<Reservation>> {
        self.take_stale(node, |record| {
            now.saturating_duration_since(record.last_heartbeat) > timeout
        })
    }

    /// Removes a node regardless of its heartbeat and reports it as stale.
    pub fn mark_node_stale(&self, node: &str) -> Vec<Reservation> {
        self.take_stale(node, |_| true).unwrap_or_default()
    }

    fn take_stale(
        &self,
        node: &str,
        condition: impl FnOnce(&NodeRecord) -> bool,
    ) -> Option<Vec<Reservation>> {
        let (_, record) = self.nodes.remove_if(node, |_, record| condition(record))?;
        let released = self.drop_record(node, record);
        self.stale.insert(node.to_string(), Instant::now());
        Some(released)
    }

    fn drop_record(&self, node: &str, record: NodeRecord) -> Vec<Reservation> {
        self.ceilings.remove(node);

        let released: Vec<Reservation> = record
            .devices
            .into_iter()
            .flat_map(|d| d.reservations)
            .collect();
        // reserve indexes its token before unlocking the entry, so the removed
        // record holds every token pointing at it
        for reservation in &released {
            self.tokens.remove(&reservation.token);
        }

        info!(
            node = node,
            released = released.len(),
            "Node removed from inventory"
        );
        released
    }

    /// Refreshes liveness without changing topology; returns the current generation.
    pub fn heartbeat(&self, node: &str) -> StoreResult<u64> {
        let mut record = self
            .nodes
            .get_mut(node)
            .ok_or_else(|| self.missing_node_error(node))?;
        record.last_heartbeat = Instant::now();
        Ok(record.generation)
    }

    /// Nodes whose last heartbeat is older than `timeout` at instant `now`.
    pub fn nodes_silent_since(&self, now: Instant, timeout: Duration) -> Vec<NodeId> {
        let mut silent: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_heartbeat) > timeout)
            .map(|entry| entry.key().clone())
            .collect();
        silent.sort();
        silent
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Copies the requested nodes (all nodes for `None`). Each node is copied under
    /// its own read lock.
    pub fn snapshot(&self, filter: Option<&[NodeId]>) -> InventorySnapshot {
        let mut snapshot = InventorySnapshot::default();
        let ids = match filter {
            Some(ids) => ids.to_vec(),
            None => self.node_ids(),
        };

        for id in ids {
            match self.snapshot_node(&id) {
                Some(node) => {
                    snapshot.nodes.insert(id, node);
                }
                None => {
                    let absence = self.absence(&id);
                    snapshot.missing.insert(id, absence);
                }
            }
        }
        snapshot
    }

    /// Copy of a single node, or `None` when it is not registered.
    pub fn snapshot_node(&self, node: &str) -> Option<NodeSnapshot> {
        self.nodes.get(node).map(|record| NodeSnapshot {
            node: node.to_string(),
            generation: record.generation,
            policy: record.policy,
            devices: record.devices.clone(),
        })
    }

    /// Error describing why `node` is absent.
    pub fn node_absence(&self, node: &str) -> Option<NodeAbsence> {
        if self.nodes.contains_key(node) {
            None
        } else {
            Some(self.absence(node))
        }
    }

    /// Atomically appends a pending reservation when it fits on every dimension.
    ///
    /// # Errors
    ///
    /// - [`StoreError::CapacityExceeded`] if the device has no room left
    /// - [`StoreError::UnknownNode`], [`StoreError::StaleNode`], [`StoreError::UnknownDevice`]
    pub fn reserve(
        &self,
        node: &str,
        device: &str,
        reservation: NewReservation,
    ) -> StoreResult<ReservationToken> {
        let mut record = self
            .nodes
            .get_mut(node)
            .ok_or_else(|| self.missing_node_error(node))?;

        let Some(target) = record.device_mut(device) else {
            bail!(StoreError::UnknownDevice {
                node: node.to_string(),
                device: device.to_string(),
            });
        };

        if !target.admits(reservation.demand, reservation.exclusive) {
            debug!(
                node = node,
                device = device,
                pod = %reservation.pod,
                demand = %reservation.demand,
                free = %target.free(),
                "Reservation rejected"
            );
            bail!(StoreError::CapacityExceeded {
                node: node.to_string(),
                device: device.to_string(),
            });
        }

        let token = ReservationToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        debug!(
            node = node,
            device = device,
            pod = %reservation.pod,
            token = %token,
            "Reservation pending"
        );
        target.reservations.push(Reservation::pending(token, reservation));
        record.generation += 1;
        self.tokens.insert(
            token,
            TokenLocation {
                node: node.to_string(),
                device: device.to_string(),
            },
        );
        Ok(token)
    }

    /// Moves a pending reservation to committed; committing twice is a no-op.
    pub fn commit(&self, token: ReservationToken) -> StoreResult<()> {
        let location = self
            .tokens
            .get(&token)
            .map(|loc| loc.value().clone())
            .ok_or_else(|| Report::new(StoreError::UnknownReservation { token: token.get() }))?;

        let committed = self
            .nodes
            .get_mut(&location.node)
            .and_then(|mut record| {
                let reservation = record
                    .device_mut(&location.device)?
                    .reservations
                    .iter_mut()
                    .find(|r| r.token == token)?;
                reservation.state = ReservationState::Committed;
                record.generation += 1;
                Some(())
            });

        if committed.is_none() {
            self.tokens.remove(&token);
            bail!(StoreError::UnknownReservation { token: token.get() });
        }
        Ok(())
    }

    /// Gives a reservation back. Unknown or already released tokens are ignored.
    pub fn release(&self, token: ReservationToken) -> Option<Reservation> {
        let (_, location) = self.tokens.remove(&token)?;
        let mut record = self.nodes.get_mut(&location.node)?;
        let device = record.device_mut(&location.device)?;
        let idx = device.reservations.iter().position(|r| r.token == token)?;
        let mut reservation = device.reservations.remove(idx);
        reservation.state = ReservationState::Released;
        record.generation += 1;

        debug!(
            node = %location.node,
            device = %location.device,
            pod = %reservation.pod,
            token = %token,
            "Reservation released"
        );
        Some(reservation)
    }

    /// Releases every reservation owned by `pod` on every node.
    pub fn release_owned_by(&self, pod: &PodIdentifier) -> Vec<Reservation> {
        let mut released = Vec::new();
        for mut entry in self.nodes.iter_mut() {
            let mut touched = false;
            for device in entry.devices.iter_mut() {
                let before = device.reservations.len();
                device.reservations.retain(|r| {
                    if &r.pod == pod {
                        let mut gone = r.clone();
                        gone.state = ReservationState::Released;
                        released.push(gone);
                        false
                    } else {
                        true
                    }
                });
                touched |= device.reservations.len() != before;
            }
            if touched {
                entry.generation += 1;
            }
        }
        for reservation in &released {
            self.tokens.remove(&reservation.token);
        }
        released
    }

    /// Every pod that currently owns at least one reservation.
    pub fn reservation_owners(&self) -> BTreeSet<PodIdentifier> {
        self.nodes
            .iter()
            .flat_map(|entry| {
                entry
                    .devices
                    .iter()
                    .flat_map(|d| d.reservations.iter().map(|r| r.pod.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Largest device totals registered anywhere, per dimension.
    pub fn capacity_ceiling(&self) -> Option<Capacity> {
        self.ceilings
            .iter()
            .map(|entry| *entry.value())
            .reduce(Capacity::max)
    }
}

fn validate_spec(spec: &DeviceSpec) -> StoreResult<()> {
    if spec.id.trim().is_empty() {
        bail!(StoreError::InvalidDevice {
            message: "device id must not be empty".to_string(),
        });
    }
    if spec.total.memory == 0 || spec.total.compute_share == 0 || spec.max_slices == 0 {
        bail!(StoreError::InvalidDevice {
            message: format!(
                "device {} must have non-zero memory, compute share and slice limit",
                spec.id
            ),
        });
    }
    Ok(())
}

fn ensure_still_fits(node: &str, existing: &DeviceRecord, spec: &DeviceSpec) -> StoreResult<()> {
    let fits = existing.used().fits_within(spec.total)
        && existing.reservations.len() <= spec.max_slices as usize;
    if !fits {
        bail!(StoreError::CapacityExceeded {
            node: node.to_string(),
            device: spec.id.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Barrier;
    use std::thread;

    use similar_asserts::assert_eq;

    use super::*;

    fn spec(id: &str, memory: u64, compute: u32) -> DeviceSpec {
        DeviceSpec {
            id: id.to_string(),
            total: Capacity::new(memory, compute),
            max_slices: 10,
        }
    }

    fn claim(pod: &str, memory: u64, compute: u32) -> NewReservation {
        NewReservation {
            pod: PodIdentifier::new("default", pod),
            container: "main".to_string(),
            demand: Capacity::new(memory, compute),
            exclusive: false,
        }
    }

    fn store_with_device(memory: u64, compute: u32) -> DeviceRecordStore {
        let store = DeviceRecordStore::new();
        store
            .replace_devices("node-a", vec![spec("gpu-0", memory, compute)], None)
            .expect("should register node");
        store
    }

    fn used(store: &DeviceRecordStore, node: &str, device: &str) -> Capacity {
        store
            .snapshot_node(node)
            .and_then(|n| n.device(device).map(DeviceRecord::used))
            .expect("device should exist")
    }

    #[test]
    fn reserve_fails_when_any_dimension_overflows() {
        let store = store_with_device(8, 100);

        store
            .reserve("node-a", "gpu-0", claim("p1", 6, 10))
            .expect("first claim fits");
        let err = store
            .reserve("node-a", "gpu-0", claim("p2", 4, 10))
            .expect_err("memory is exhausted");

        assert!(matches!(
            err.current_context(),
            StoreError::CapacityExceeded { .. }
        ));
        assert_eq!(used(&store, "node-a", "gpu-0"), Capacity::new(6, 10));
    }

    #[test]
    fn concurrent_reserves_never_double_book() {
        const CALLERS: usize = 8;
        // room for exactly CALLERS - 1 claims of {1, 10}
        let store = Arc::new(store_with_device((CALLERS - 1) as u64, 100));
        let barrier = Arc::new(Barrier::new(CALLERS));

        let results: Vec<bool> = thread::scope(|scope| {
            let handles: Vec<_> = (0..CALLERS)
                .map(|i| {
                    let store = Arc::clone(&store);
                    let barrier = Arc::clone(&barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        store
                            .reserve("node-a", "gpu-0", claim(&format!("p{i}"), 1, 10))
                            .is_ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("thread should not panic"))
                .collect()
        });

        assert_eq!(results.iter().filter(|ok| **ok).count(), CALLERS - 1);
        assert_eq!(
            used(&store, "node-a", "gpu-0"),
            Capacity::new((CALLERS - 1) as u64, 10 * (CALLERS as u32 - 1))
        );
    }

    #[test]
    fn release_is_idempotent() {
        let store = store_with_device(8, 100);
        let token = store
            .reserve("node-a", "gpu-0", claim("p1", 4, 40))
            .expect("claim fits");

        let first = store.release(token).expect("first release returns the claim");
        assert_eq!(first.state, ReservationState::Released);
        assert!(store.release(token).is_none());
        assert!(store.release(ReservationToken(9_999)).is_none());
        assert_eq!(used(&store, "node-a", "gpu-0"), Capacity::default());
    }

    #[test]
    fn commit_marks_reservation_committed() {
        let store = store_with_device(8, 100);
        let token = store
            .reserve("node-a", "gpu-0", claim("p1", 4, 40))
            .expect("claim fits");

        store.commit(token).expect("commit should succeed");

        let node = store.snapshot_node("node-a").expect("node exists");
        let reservation = &node.device("gpu-0").expect("device exists").reservations[0];
        assert_eq!(reservation.state, ReservationState::Committed);

        store.release(token);
        let err = store.commit(token).expect_err("released token cannot commit");
        assert!(matches!(
            err.current_context(),
            StoreError::UnknownReservation { .. }
        ));
    }

    #[test]
    fn replace_devices_keeps_reservations_of_retained_devices() {
        let store = DeviceRecordStore::new();
        store
            .replace_devices(
                "node-a",
                vec![spec("gpu-0", 8, 100), spec("gpu-1", 8, 100)],
                None,
            )
            .expect("register");
        store
            .reserve("node-a", "gpu-0", claim("keep", 2, 20))
            .expect("claim on gpu-0");
        let dropped = store
            .reserve("node-a", "gpu-1", claim("drop", 2, 20))
            .expect("claim on gpu-1");

        let outcome = store
            .replace_devices(
                "node-a",
                vec![spec("gpu-0", 16, 100), spec("gpu-2", 8, 100)],
                None,
            )
            .expect("re-register");

        assert_eq!(outcome.released.len(), 1);
        assert_eq!(outcome.released[0].token, dropped);
        assert_eq!(used(&store, "node-a", "gpu-0"), Capacity::new(2, 20));
        assert!(store.release(dropped).is_none());

        let node = store.snapshot_node("node-a").expect("node exists");
        let ids: Vec<&str> = node.devices.iter().map(DeviceRecord::id).collect();
        assert_eq!(ids, vec!["gpu-0", "gpu-2"]);
        assert_eq!(node.generation, outcome.generation);
    }

    #[test]
    fn replace_devices_rejects_shrinking_below_reserved() {
        let store = store_with_device(8, 100);
        store
            .reserve("node-a", "gpu-0", claim("p1", 6, 60))
            .expect("claim fits");

        let err = store
            .replace_devices("node-a", vec![spec("gpu-0", 4, 100)], None)
            .expect_err("cannot shrink below reservations");

        assert!(matches!(
            err.current_context(),
            StoreError::CapacityExceeded { .. }
        ));
        let node = store.snapshot_node("node-a").expect("node exists");
        assert_eq!(node.devices[0].spec.total, Capacity::new(8, 100));
    }

    #[test]
    fn generation_increases_on_every_mutation() {
        let store = store_with_device(8, 100);
        let g0 = store.snapshot_node("node-a").expect("node").generation;

        let token = store
            .reserve("node-a", "gpu-0", claim("p1", 1, 1))
            .expect("claim fits");
        let g1 = store.snapshot_node("node-a").expect("node").generation;
        store.commit(token).expect("commit");
        let g2 = store.snapshot_node("node-a").expect("node").generation;
        store.heartbeat("node-a").expect("heartbeat");
        let g3 = store.snapshot_node("node-a").expect("node").generation;

        assert!(g0 < g1 && g1 < g2);
        assert_eq!(g2, g3, "heartbeat does not change topology");
    }

    #[test]
    fn upsert_device_keeps_reservations_and_guards_shrinking() {
        let store = store_with_device(8, 100);
        store
            .reserve("node-a", "gpu-0", claim("p1", 4, 40))
            .expect("claim fits");

        let generation = store
            .upsert_device("node-a", spec("gpu-0", 16, 100))
            .expect("growing is allowed");
        assert_eq!(used(&store, "node-a", "gpu-0"), Capacity::new(4, 40));
        assert_eq!(store.capacity_ceiling(), Some(Capacity::new(16, 100)));

        let err = store
            .upsert_device("node-a", spec("gpu-0", 2, 100))
            .expect_err("cannot shrink below the reserved amount");
        assert!(matches!(err.current_context(), StoreError::CapacityExceeded { .. }));

        let next = store
            .upsert_device("node-b", spec("gpu-0", 8, 100))
            .expect("creates the node");
        assert_eq!(next, 1);
        assert!(generation > 1);
        assert_eq!(store.node_ids().len(), 2);
    }

    #[test]
    fn stale_node_cascades_and_is_reported() {
        let store = store_with_device(8, 100);
        let token = store
            .reserve("node-a", "gpu-0", claim("p1", 4, 40))
            .expect("claim fits");

        let later = Instant::now() + Duration::from_secs(120);
        let released = store
            .mark_node_stale_if_silent("node-a", later, Duration::from_secs(60))
            .expect("node is silent");

        assert_eq!(released.len(), 1);
        assert!(store.release(token).is_none());
        assert!(store.capacity_ceiling().is_none());
        assert_eq!(store.node_absence("node-a"), Some(NodeAbsence::Stale));
        let err = store
            .reserve("node-a", "gpu-0", claim("p2", 1, 1))
            .expect_err("stale node cannot take reservations");
        assert!(matches!(err.current_context(), StoreError::StaleNode { .. }));

        store
            .replace_devices("node-a", vec![spec("gpu-0", 8, 100)], None)
            .expect("re-register");
        assert_eq!(store.node_absence("node-a"), None);
    }

    #[test]
    fn snapshot_reports_missing_nodes() {
        let store = store_with_device(8, 100);

        let ids = vec!["node-a".to_string(), "ghost".to_string()];
        let snapshot = store.snapshot(Some(ids.as_slice()));

        assert!(snapshot.nodes.contains_key("node-a"));
        assert_eq!(snapshot.missing.get("ghost"), Some(&NodeAbsence::Unknown));
    }

    #[test]
    fn exclusive_claims_own_the_whole_device() {
        let store = store_with_device(8, 100);
        let mut exclusive = claim("owner", 1, 10);
        exclusive.exclusive = true;

        store
            .reserve("node-a", "gpu-0", exclusive.clone())
            .expect("empty device accepts exclusive claim");
        assert!(store.reserve("node-a", "gpu-0", claim("other", 1, 1)).is_err());

        let fresh = store_with_device(8, 100);
        fresh
            .reserve("node-a", "gpu-0", claim("other", 1, 1))
            .expect("shared claim");
        assert!(fresh.reserve("node-a", "gpu-0", exclusive).is_err());
    }

    #[test]
    fn release_owned_by_and_owners() {
        let store = store_with_device(8, 100);
        store
            .reserve("node-a", "gpu-0", claim("p1", 1, 10))
            .expect("claim");
        store
            .reserve("node-a", "gpu-0", claim("p1", 1, 10))
            .expect("claim");
        store
            .reserve("node-a", "gpu-0", claim("p2", 1, 10))
            .expect("claim");

        let released = store.release_owned_by(&PodIdentifier::new("default", "p1"));

        assert_eq!(released.len(), 2);
        let owners: Vec<String> = store
            .reservation_owners()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(owners, vec!["default/p2".to_string()]);
    }

    #[test]
    fn heartbeat_after_listing_keeps_the_node() {
        let store = store_with_device(8, 100);
        store
            .reserve("node-a", "gpu-0", claim("p1", 4, 40))
            .expect("claim fits");
        let timeout = Duration::from_millis(1);
        std::thread::sleep(Duration::from_millis(5));
        let swept_at = Instant::now();
        assert_eq!(
            store.nodes_silent_since(swept_at, timeout),
            vec!["node-a".to_string()]
        );

        store.heartbeat("node-a").expect("node is registered");
        let token = store
            .reserve("node-a", "gpu-0", claim("p2", 2, 20))
            .expect("claim fits");

        assert!(store
            .mark_node_stale_if_silent("node-a", swept_at, timeout)
            .is_none());
        assert_eq!(store.node_absence("node-a"), None);
        assert_eq!(used(&store, "node-a", "gpu-0"), Capacity::new(6, 60));
        store.commit(token).expect("token is still indexed");
    }

    #[test]
    fn removing_a_node_keeps_other_tokens() {
        let store = store_with_device(8, 100);
        store
            .replace_devices("node-b", vec![spec("gpu-0", 8, 100)], None)
            .expect("should register node");
        let kept = store
            .reserve("node-b", "gpu-0", claim("p1", 1, 10))
            .expect("claim fits");
        store
            .reserve("node-a", "gpu-0", claim("p2", 1, 10))
            .expect("claim fits");

        assert_eq!(store.remove_node("node-a").len(), 1);

        store.commit(kept).expect("node-b token survives");
        assert_eq!(store.release(kept).map(|r| r.token), Some(kept));
    }

    #[test]
    fn silent_nodes_are_detected() {
        let store = store_with_device(8, 100);
        let later = Instant::now() + Duration::from_secs(120);

        assert_eq!(
            store.nodes_silent_since(later, Duration::from_secs(60)),
            vec!["node-a".to_string()]
        );
        assert!(store
            .nodes_silent_since(Instant::now(), Duration::from_secs(60))
            .is_empty());
    }
}
