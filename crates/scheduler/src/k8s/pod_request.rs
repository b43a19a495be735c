//! Extraction of a vGPU [`Request`] from a pod spec
//!
//! Each container asks for `<count>` slices through its resource limits (requests
//! are used when no limit is set). Memory and compute share are per slice; when a
//! container leaves them out the configured defaults apply.

use std::collections::BTreeMap;
use std::str::FromStr;

use api_types::PackingPolicy;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use super::annotations::EXCLUSIVE_HINT;
use super::annotations::PACKING_POLICY_HINT;
use crate::allocation::PlacementHints;
use crate::allocation::Request;
use crate::allocation::SliceRequest;
use crate::inventory::Capacity;
use crate::inventory::PodIdentifier;

const MIB: u64 = 1024 * 1024;

/// Slices a single container may ask for unless configured otherwise
pub const DEFAULT_MAX_SLICES_PER_CONTAINER: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum RequestParseError {
    #[display("Pod has no {field}")]
    MissingMetadata { field: &'static str },
    #[display("Container {container} has an invalid {resource} value `{value}`")]
    InvalidQuantity {
        container: String,
        resource: String,
        value: String,
    },
    #[display("Annotation {key} has an invalid value `{value}`")]
    InvalidAnnotation { key: String, value: String },
}

impl core::error::Error for RequestParseError {}

/// Extended resource names a container uses to ask for vGPU slices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    /// Number of slices
    pub count: String,
    /// MiB per slice
    pub memory: String,
    /// Compute share per slice
    pub cores: String,
}

impl Default for ResourceNames {
    fn default() -> Self {
        Self {
            count: "nvidia.com/gpu".to_string(),
            memory: "nvidia.com/gpumem".to_string(),
            cores: "nvidia.com/gpucores".to_string(),
        }
    }
}

/// Per-slice values used when a container omits them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliceDefaults {
    pub memory: u64,
    pub compute_share: u32,
}

#[derive(Debug, Clone)]
pub struct PodRequestParser {
    names: ResourceNames,
    defaults: SliceDefaults,
    max_slices: u32,
}

impl Default for PodRequestParser {
    fn default() -> Self {
        Self::new(ResourceNames::default(), SliceDefaults::default())
    }
}

impl PodRequestParser {
    pub fn new(names: ResourceNames, defaults: SliceDefaults) -> Self {
        Self {
            names,
            defaults,
            max_slices: DEFAULT_MAX_SLICES_PER_CONTAINER,
        }
    }

    /// Caps the slice count of a single container; larger counts are rejected.
    pub fn with_max_slices(mut self, max_slices: u32) -> Self {
        self.max_slices = max_slices;
        self
    }

    /// Builds the vGPU request of `pod`.
    ///
    /// # Errors
    ///
    /// - [`RequestParseError::MissingMetadata`] if the pod has no name
    /// - [`RequestParseError::InvalidQuantity`] for unparsable resource values or a
    ///   container asking for more slices than the configured maximum
    /// - [`RequestParseError::InvalidAnnotation`] for unparsable placement hints
    pub fn parse(&self, pod: &Pod) -> Result<Request, Report<RequestParseError>> {
        let identifier = pod_identifier(pod)?;
        let mut slices = Vec::new();
        if let Some(spec) = &pod.spec {
            for container in &spec.containers {
                self.container_slices(container, &mut slices)?;
            }
        }
        let hints = placement_hints(pod)?;
        Ok(Request::new(identifier, slices).with_hints(hints))
    }

    /// Whether any container asks for at least one slice.
    pub fn requests_vgpu(&self, pod: &Pod) -> bool {
        pod.spec.as_ref().is_some_and(|spec| {
            spec.containers.iter().any(|container| {
                resource(container, &self.names.count)
                    .and_then(|q| q.0.trim().parse::<u32>().ok())
                    .is_some_and(|count| count > 0)
            })
        })
    }

    fn container_slices(
        &self,
        container: &Container,
        slices: &mut Vec<SliceRequest>,
    ) -> Result<(), Report<RequestParseError>> {
        let Some(quantity) = resource(container, &self.names.count) else {
            return Ok(());
        };
        let count = quantity
            .0
            .trim()
            .parse::<u32>()
            .change_context_lazy(|| invalid_quantity(container, &self.names.count, quantity))?;
        if count == 0 {
            return Ok(());
        }
        if count > self.max_slices {
            return Err(Report::new(invalid_quantity(container, &self.names.count, quantity))
                .attach_printable(format!("at most {} slices per container", self.max_slices)));
        }

        let memory = match resource(container, &self.names.memory) {
            Some(quantity) => parse_memory_mib(&quantity.0)
                .change_context_lazy(|| invalid_quantity(container, &self.names.memory, quantity))?,
            None => self.defaults.memory,
        };
        let compute_share = match resource(container, &self.names.cores) {
            Some(quantity) => quantity
                .0
                .trim()
                .parse::<u32>()
                .change_context_lazy(|| invalid_quantity(container, &self.names.cores, quantity))?,
            None => self.defaults.compute_share,
        };

        let demand = Capacity::new(memory, compute_share);
        slices.extend((0..count).map(|_| SliceRequest {
            container: container.name.clone(),
            demand,
        }));
        Ok(())
    }
}

/// Namespace-qualified identity of a pod; an unset namespace means `default`.
pub fn pod_identifier(pod: &Pod) -> Result<PodIdentifier, Report<RequestParseError>> {
    let name = pod
        .metadata
        .name
        .clone()
        .ok_or_else(|| Report::new(RequestParseError::MissingMetadata { field: "name" }))?;
    let namespace = pod
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    Ok(PodIdentifier::new(namespace, name))
}

fn resource<'a>(container: &'a Container, name: &str) -> Option<&'a Quantity> {
    let resources = container.resources.as_ref()?;
    resources
        .limits
        .as_ref()
        .and_then(|limits| limits.get(name))
        .or_else(|| resources.requests.as_ref().and_then(|r| r.get(name)))
}

fn invalid_quantity(container: &Container, resource: &str, value: &Quantity) -> RequestParseError {
    RequestParseError::InvalidQuantity {
        container: container.name.clone(),
        resource: resource.to_string(),
        value: value.0.clone(),
    }
}

fn placement_hints(pod: &Pod) -> Result<PlacementHints, Report<RequestParseError>> {
    let empty = BTreeMap::new();
    let annotations = pod.metadata.annotations.as_ref().unwrap_or(&empty);

    let policy = annotations
        .get(PACKING_POLICY_HINT)
        .map(|value| {
            PackingPolicy::from_str(value).map_err(|_| {
                Report::new(RequestParseError::InvalidAnnotation {
                    key: PACKING_POLICY_HINT.to_string(),
                    value: value.clone(),
                })
            })
        })
        .transpose()?;

    let exclusive = match annotations.get(EXCLUSIVE_HINT) {
        Some(value) => value.trim().to_ascii_lowercase().parse::<bool>().change_context_lazy(|| {
            RequestParseError::InvalidAnnotation {
                key: EXCLUSIVE_HINT.to_string(),
                value: value.clone(),
            }
        })?,
        None => false,
    };

    Ok(PlacementHints { policy, exclusive })
}

#[derive(Debug, derive_more::Display)]
#[display("Invalid memory value `{_0}`")]
struct MemoryValueError(String);

impl core::error::Error for MemoryValueError {}

/// Parses a per-slice memory value into MiB.
///
/// A plain number is already MiB. Suffixed values are byte quantities and are
/// rounded up to whole MiB:
/// - binary: "Ki", "Mi", "Gi", "Ti"
/// - decimal: "K", "M", "G", "T"
fn parse_memory_mib(value: &str) -> Result<u64, Report<MemoryValueError>> {
    let value = value.trim();

    if let Ok(mib) = value.parse::<u64>() {
        return Ok(mib);
    }

    let Some(pos) = value.find(|c: char| c.is_alphabetic()) else {
        return Err(Report::new(MemoryValueError(value.to_string())));
    };
    let (numeric_part, unit) = value.split_at(pos);

    let numeric_value: f64 = numeric_part
        .trim()
        .parse::<f64>()
        .change_context_lazy(|| MemoryValueError(value.to_string()))?;
    if !numeric_value.is_finite() || numeric_value < 0.0 {
        return Err(Report::new(MemoryValueError(value.to_string())));
    }

    let multiplier: u64 = match unit {
        "Ki" => 1024,
        "Mi" => MIB,
        "Gi" => 1024 * MIB,
        "Ti" => 1024_u64.pow(4),
        "k" | "K" => 1000,
        "M" => 1000_u64.pow(2),
        "G" => 1000_u64.pow(3),
        "T" => 1000_u64.pow(4),
        _ => {
            return Err(Report::new(MemoryValueError(value.to_string()))
                .attach_printable(format!("Unsupported memory unit: {unit}")));
        }
    };

    let bytes = (numeric_value * multiplier as f64).ceil() as u64;
    Ok(bytes.div_ceil(MIB))
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use similar_asserts::assert_eq;

    use super::*;

    fn container(name: &str, limits: &[(&str, &str)]) -> Container {
        Container {
            name: name.to_string(),
            resources: Some(ResourceRequirements {
                limits: Some(
                    limits
                        .iter()
                        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod(containers: Vec<Container>, annotations: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("trainer".to_string()),
                namespace: Some("ml".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers,
                ..Default::default()
            }),
            status: None,
        }
    }

    fn parser() -> PodRequestParser {
        PodRequestParser::new(
            ResourceNames::default(),
            SliceDefaults {
                memory: 512,
                compute_share: 5,
            },
        )
    }

    #[test]
    fn parse_memory_plain_number_is_mib() {
        assert_eq!(parse_memory_mib("3000").unwrap(), 3000);
    }

    #[test]
    fn parse_memory_with_units() {
        assert_eq!(parse_memory_mib("2Gi").unwrap(), 2048);
        assert_eq!(parse_memory_mib("512Mi").unwrap(), 512);
        assert_eq!(parse_memory_mib("1.5Gi").unwrap(), 1536);
        assert_eq!(parse_memory_mib("1G").unwrap(), 954);
        assert_eq!(parse_memory_mib("1Ki").unwrap(), 1);
    }

    #[test]
    fn parse_memory_rejects_garbage() {
        assert!(parse_memory_mib("lots").is_err());
        assert!(parse_memory_mib("2Xi").is_err());
        assert!(parse_memory_mib("-1Gi").is_err());
    }

    #[test]
    fn parses_slices_per_container() {
        let pod = pod(
            vec![
                container(
                    "main",
                    &[
                        ("nvidia.com/gpu", "2"),
                        ("nvidia.com/gpumem", "4Gi"),
                        ("nvidia.com/gpucores", "30"),
                    ],
                ),
                container("sidecar", &[("cpu", "1")]),
                container("helper", &[("nvidia.com/gpu", "1")]),
            ],
            &[],
        );

        let request = parser().parse(&pod).unwrap();

        assert_eq!(request.pod, PodIdentifier::new("ml", "trainer"));
        let slices: Vec<(&str, Capacity)> = request
            .slices
            .iter()
            .map(|s| (s.container.as_str(), s.demand))
            .collect();
        assert_eq!(
            slices,
            vec![
                ("main", Capacity::new(4096, 30)),
                ("main", Capacity::new(4096, 30)),
                ("helper", Capacity::new(512, 5)),
            ]
        );
        assert_eq!(request.hints, PlacementHints::default());
    }

    #[test]
    fn pod_without_vgpu_has_no_slices() {
        let pod = pod(vec![container("main", &[("cpu", "2")])], &[]);
        let request = parser().parse(&pod).unwrap();
        assert!(request.is_empty());
        assert!(!parser().requests_vgpu(&pod));
    }

    #[test]
    fn reads_placement_hints() {
        let pod = pod(
            vec![container("main", &[("nvidia.com/gpu", "1")])],
            &[
                (PACKING_POLICY_HINT, "spread"),
                (EXCLUSIVE_HINT, "True"),
            ],
        );

        let request = parser().parse(&pod).unwrap();

        assert_eq!(
            request.hints,
            PlacementHints {
                policy: Some(PackingPolicy::Spread),
                exclusive: true,
            }
        );
        assert!(parser().requests_vgpu(&pod));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let bad_count = pod(vec![container("main", &[("nvidia.com/gpu", "two")])], &[]);
        let err = parser().parse(&bad_count).unwrap_err();
        assert!(matches!(
            err.current_context(),
            RequestParseError::InvalidQuantity { .. }
        ));

        let bad_hint = pod(
            vec![container("main", &[("nvidia.com/gpu", "1")])],
            &[(PACKING_POLICY_HINT, "roundrobin")],
        );
        let err = parser().parse(&bad_hint).unwrap_err();
        assert!(matches!(
            err.current_context(),
            RequestParseError::InvalidAnnotation { .. }
        ));
    }

    #[test]
    fn oversized_slice_count_is_rejected() {
        let huge = pod(vec![container("main", &[("nvidia.com/gpu", "4000000000")])], &[]);
        let err = parser().parse(&huge).unwrap_err();
        assert_eq!(
            err.current_context(),
            &RequestParseError::InvalidQuantity {
                container: "main".to_string(),
                resource: "nvidia.com/gpu".to_string(),
                value: "4000000000".to_string(),
            }
        );

        let limited = parser().with_max_slices(2);
        let three = pod(vec![container("main", &[("nvidia.com/gpu", "3")])], &[]);
        assert!(limited.parse(&three).is_err());
        let two = pod(vec![container("main", &[("nvidia.com/gpu", "2")])], &[]);
        assert_eq!(limited.parse(&two).unwrap().slices.len(), 2);
    }

    #[test]
    fn custom_resource_names() {
        let parser = PodRequestParser::new(
            ResourceNames {
                count: "example.com/vgpu".to_string(),
                memory: "example.com/vgpu-memory".to_string(),
                cores: "example.com/vgpu-cores".to_string(),
            },
            SliceDefaults::default(),
        );
        let pod = pod(
            vec![container(
                "main",
                &[("example.com/vgpu", "1"), ("example.com/vgpu-memory", "100")],
            )],
            &[],
        );

        let request = parser.parse(&pod).unwrap();
        assert_eq!(request.slices[0].demand, Capacity::new(100, 0));
    }
}
