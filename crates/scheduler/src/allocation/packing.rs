//! Dry-run placement of slices onto the devices of one node
//!
//! Best fit: candidate devices are ordered by ascending free compute share, then
//! ascending free memory, then registration order, and each slice takes the first
//! device that still admits it. Nearly-full devices fill up first, leaving large
//! contiguous capacity for later multi-slice pods. `spread` reverses both capacity
//! keys so the emptiest device wins. Devices are re-ordered after every slice
//! because each assignment changes their free capacity.

use std::cmp::Ordering;

use api_types::PackingPolicy;

use super::request::Request;
use crate::inventory::Capacity;
use crate::inventory::DeviceId;
use crate::inventory::DeviceRecord;
use crate::inventory::NodeSnapshot;

/// Planned position of one slice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlicePlacement {
    pub container: String,
    pub device: DeviceId,
    pub demand: Capacity,
    pub exclusive: bool,
}

/// A device as it would look after the slices planned so far
#[derive(Debug)]
pub(crate) struct ProjectedDevice<'a> {
    pub record: &'a DeviceRecord,
    pub index: usize,
    pub used: Capacity,
    pub slices: usize,
    pub exclusive_held: bool,
}

impl<'a> ProjectedDevice<'a> {
    fn new(index: usize, record: &'a DeviceRecord) -> Self {
        Self {
            record,
            index,
            used: record.used(),
            slices: record.reservations.len(),
            exclusive_held: record.has_exclusive(),
        }
    }

    pub fn free(&self) -> Capacity {
        self.record.spec.total.saturating_sub(self.used)
    }

    fn admits(&self, demand: Capacity, exclusive: bool) -> bool {
        if self.slices >= self.record.spec.max_slices as usize {
            return false;
        }
        if self.exclusive_held || (exclusive && self.slices > 0) {
            return false;
        }
        self.used
            .checked_add(demand)
            .is_some_and(|projected| projected.fits_within(self.record.spec.total))
    }

    fn take(&mut self, demand: Capacity, exclusive: bool) {
        self.used = self.used.checked_add(demand).unwrap_or(self.record.spec.total);
        self.slices += 1;
        self.exclusive_held |= exclusive;
    }
}

/// Whether a slice must own its device
pub(crate) fn is_exclusive(demand: Capacity, device: &DeviceRecord, hinted: bool) -> bool {
    hinted || demand.compute_share >= device.spec.total.compute_share
}

fn compare(policy: PackingPolicy, a: &ProjectedDevice<'_>, b: &ProjectedDevice<'_>) -> Ordering {
    let (fa, fb) = (a.free(), b.free());
    let by_capacity = fa
        .compute_share
        .cmp(&fb.compute_share)
        .then(fa.memory.cmp(&fb.memory));
    let by_capacity = match policy {
        PackingPolicy::Binpack => by_capacity,
        PackingPolicy::Spread => by_capacity.reverse(),
    };
    by_capacity.then(a.index.cmp(&b.index))
}

/// Plans every slice of `request` on `node` without touching the store.
///
/// Returns `None` when the node cannot host the whole request.
pub fn pack(
    request: &Request,
    node: &NodeSnapshot,
    policy: PackingPolicy,
) -> Option<Vec<SlicePlacement>> {
    let (placements, _) = pack_projected(request, node, policy)?;
    Some(placements)
}

pub(crate) fn pack_projected<'a>(
    request: &Request,
    node: &'a NodeSnapshot,
    policy: PackingPolicy,
) -> Option<(Vec<SlicePlacement>, Vec<ProjectedDevice<'a>>)> {
    let mut devices: Vec<ProjectedDevice<'a>> = node
        .devices
        .iter()
        .enumerate()
        .map(|(index, record)| ProjectedDevice::new(index, record))
        .collect();
    let mut placements: Vec<SlicePlacement> = Vec::with_capacity(request.slices.len());

    for slice in &request.slices {
        devices.sort_by(|a, b| compare(policy, a, b));

        let chosen = devices.iter_mut().find(|device| {
            let taken_by_container = placements
                .iter()
                .any(|p| p.container == slice.container && p.device == device.record.spec.id);
            let exclusive = is_exclusive(slice.demand, device.record, request.hints.exclusive);
            !taken_by_container && device.admits(slice.demand, exclusive)
        })?;

        let exclusive = is_exclusive(slice.demand, chosen.record, request.hints.exclusive);
        chosen.take(slice.demand, exclusive);
        placements.push(SlicePlacement {
            container: slice.container.clone(),
            device: chosen.record.spec.id.clone(),
            demand: slice.demand,
            exclusive,
        });
    }

    devices.sort_by_key(|d| d.index);
    Some((placements, devices))
}
