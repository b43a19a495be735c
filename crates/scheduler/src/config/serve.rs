use std::path::PathBuf;
use std::time::Duration;

use api_types::PackingPolicy;
use clap::Parser;

use crate::allocation::EngineConfig;
use crate::allocation::ScoreWeights;
use crate::api::TlsFiles;
use crate::inventory::InventoryConfig;
use crate::k8s::pod_request::ResourceNames;
use crate::k8s::pod_request::SliceDefaults;
use crate::k8s::pod_request::DEFAULT_MAX_SLICES_PER_CONTAINER;

#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    #[arg(
        long,
        env = "HTTP_BIND",
        default_value = "127.0.0.1:8080",
        help = "HTTP server bind address"
    )]
    pub http_bind: String,

    #[arg(
        long,
        env = "TLS_CERT_FILE",
        value_hint = clap::ValueHint::FilePath,
        requires = "key_file",
        help = "TLS certificate file; TLS is enabled when both cert and key are set"
    )]
    pub cert_file: Option<PathBuf>,

    #[arg(
        long,
        env = "TLS_KEY_FILE",
        value_hint = clap::ValueHint::FilePath,
        requires = "cert_file",
        help = "TLS private key file"
    )]
    pub key_file: Option<PathBuf>,

    #[arg(
        long,
        env = "SCHEDULER_NAME",
        default_value = "vgpu-scheduler",
        help = "Scheduler name set on vGPU pods by the admission webhook"
    )]
    pub scheduler_name: String,

    #[arg(
        long,
        default_value_t = PackingPolicy::Binpack,
        help = "Cluster-wide packing policy, either 'binpack' or 'spread'"
    )]
    pub default_policy: PackingPolicy,

    #[arg(
        long,
        default_value_t = 10,
        help = "Maximum concurrent slices per device when the node agent does not report one"
    )]
    pub device_split_count: u32,

    #[arg(
        long,
        default_value_t = 0,
        help = "Device memory in MiB per slice when a container does not ask for any"
    )]
    pub default_memory: u64,

    #[arg(
        long,
        default_value_t = 0,
        help = "Compute share per slice when a container does not ask for any"
    )]
    pub default_cores: u32,

    #[arg(
        long,
        default_value_t = DEFAULT_MAX_SLICES_PER_CONTAINER,
        value_parser = clap::value_parser!(u32).range(1..),
        help = "Most vGPU slices a single container may request"
    )]
    pub max_slices_per_container: u32,

    #[arg(long, default_value_t = 1.0, help = "Weight of memory utilization in node scores")]
    pub score_memory_weight: f64,

    #[arg(long, default_value_t = 1.0, help = "Weight of compute utilization in node scores")]
    pub score_compute_weight: f64,

    #[arg(
        long,
        default_value = "nvidia.com/gpu",
        help = "Resource name carrying the number of vGPU slices"
    )]
    pub resource_count_name: String,

    #[arg(
        long,
        default_value = "nvidia.com/gpumem",
        help = "Resource name carrying the device memory per slice"
    )]
    pub resource_memory_name: String,

    #[arg(
        long,
        default_value = "nvidia.com/gpucores",
        help = "Resource name carrying the compute share per slice"
    )]
    pub resource_cores_name: String,

    #[arg(
        long,
        default_value_t = 60,
        help = "Seconds without heartbeat after which a node is marked stale"
    )]
    pub node_heartbeat_timeout_secs: u64,

    #[arg(long, default_value_t = 15, help = "Interval in seconds of the stale node sweep")]
    pub stale_sweep_interval_secs: u64,

    #[arg(
        long,
        help = "Enable Kubernetes pod binding and monitoring",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_k8s: bool,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        default_value_t = 60,
        help = "Interval in seconds between reservation reconciliation passes"
    )]
    pub reconcile_interval_secs: u64,

    #[arg(
        long,
        env = "VGPU_SCHEDULER_LOG_DIR",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory for daily rotated log files; stderr only when unset"
    )]
    pub log_dir: Option<PathBuf>,
}

impl ServeArgs {
    pub fn inventory_config(&self) -> InventoryConfig {
        InventoryConfig {
            default_max_slices: self.device_split_count,
            heartbeat_timeout: Duration::from_secs(self.node_heartbeat_timeout_secs),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            default_policy: self.default_policy,
            weights: ScoreWeights {
                memory: self.score_memory_weight,
                compute: self.score_compute_weight,
            },
        }
    }

    pub fn resource_names(&self) -> ResourceNames {
        ResourceNames {
            count: self.resource_count_name.clone(),
            memory: self.resource_memory_name.clone(),
            cores: self.resource_cores_name.clone(),
        }
    }

    pub fn slice_defaults(&self) -> SliceDefaults {
        SliceDefaults {
            memory: self.default_memory,
            compute_share: self.default_cores,
        }
    }

    pub fn tls(&self) -> Option<TlsFiles> {
        match (&self.cert_file, &self.key_file) {
            (Some(cert_file), Some(key_file)) => Some(TlsFiles {
                cert_file: cert_file.clone(),
                key_file: key_file.clone(),
            }),
            _ => None,
        }
    }
}
