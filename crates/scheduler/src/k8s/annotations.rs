//! Pod annotations read and written by the scheduler

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;

use crate::allocation::ReservedSlice;

/// Packing policy hint (`binpack` or `spread`)
pub const PACKING_POLICY_HINT: &str = "vgpu-scheduler.io/packing-policy";
/// Exclusive device hint (`true` or `false`)
pub const EXCLUSIVE_HINT: &str = "vgpu-scheduler.io/exclusive";

/// Node the pod was bound to
pub const ASSIGNED_NODE: &str = "vgpu-scheduler.io/node";
/// Per-container device assignment, see [`encode_devices_allocated`]
pub const DEVICES_ALLOCATED: &str = "vgpu-scheduler.io/devices-allocated";
/// RFC 3339 time of the bind
pub const BIND_TIME: &str = "vgpu-scheduler.io/bind-time";

/// Encodes the assignment as `container=dev,mem,cores:dev,mem,cores;container=...`.
///
/// Containers keep the order in which their first slice appears.
pub fn encode_devices_allocated(slices: &[ReservedSlice]) -> String {
    let mut containers: Vec<(&str, Vec<String>)> = Vec::new();
    for slice in slices {
        let entry = format!(
            "{},{},{}",
            slice.device, slice.demand.memory, slice.demand.compute_share
        );
        match containers
            .iter_mut()
            .find(|(name, _)| *name == slice.container)
        {
            Some((_, devices)) => devices.push(entry),
            None => containers.push((slice.container.as_str(), vec![entry])),
        }
    }

    containers
        .into_iter()
        .map(|(name, devices)| format!("{name}={}", devices.join(":")))
        .collect::<Vec<_>>()
        .join(";")
}

/// Annotations written on the pod right before it is bound.
pub fn bind_annotations(
    node: &str,
    slices: &[ReservedSlice],
    bound_at: DateTime<Utc>,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (ASSIGNED_NODE.to_string(), node.to_string()),
        (DEVICES_ALLOCATED.to_string(), encode_devices_allocated(slices)),
        (
            BIND_TIME.to_string(),
            bound_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::inventory::Capacity;
    use crate::inventory::ReservationToken;

    fn slice(token: u64, container: &str, device: &str, memory: u64, cores: u32) -> ReservedSlice {
        ReservedSlice {
            token: ReservationToken(token),
            container: container.to_string(),
            device: device.to_string(),
            demand: Capacity::new(memory, cores),
            exclusive: false,
        }
    }

    #[test]
    fn encodes_devices_grouped_by_container() {
        let slices = vec![
            slice(1, "main", "GPU-a", 4096, 30),
            slice(2, "side", "GPU-a", 1024, 10),
            slice(3, "main", "GPU-b", 4096, 30),
        ];

        assert_eq!(
            encode_devices_allocated(&slices),
            "main=GPU-a,4096,30:GPU-b,4096,30;side=GPU-a,1024,10"
        );
    }

    #[test]
    fn empty_assignment_encodes_to_empty_string() {
        assert_eq!(encode_devices_allocated(&[]), "");
    }

    #[test]
    fn bind_annotations_carry_node_and_time() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let annotations = bind_annotations("node-a", &[slice(1, "main", "GPU-a", 10, 10)], at);

        assert_eq!(annotations[ASSIGNED_NODE], "node-a");
        assert_eq!(annotations[DEVICES_ALLOCATED], "main=GPU-a,10,10");
        assert_eq!(annotations[BIND_TIME], "2024-05-01T12:30:00Z");
        assert_eq!(annotations.len(), 3);
    }
}
