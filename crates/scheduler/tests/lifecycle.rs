//! Reservation lifecycle across concurrent binds, pod deletion and node loss

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use api_types::DeviceRegistration;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use similar_asserts::assert_eq;
use test_log::test;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vgpu_scheduler::allocation::AllocationEngine;
use vgpu_scheduler::allocation::EngineConfig;
use vgpu_scheduler::allocation::Infeasibility;
use vgpu_scheduler::inventory::DeviceRecordStore;
use vgpu_scheduler::inventory::InventoryConfig;
use vgpu_scheduler::inventory::InventoryService;
use vgpu_scheduler::inventory::PodIdentifier;
use vgpu_scheduler::k8s::pod_request::PodRequestParser;
use vgpu_scheduler::k8s::PodEvent;
use vgpu_scheduler::k8s::ReleaseReason;
use vgpu_scheduler::scheduling::mock::MockPodBinder;
use vgpu_scheduler::scheduling::mock::StaticPodLister;
use vgpu_scheduler::scheduling::PodBinder;
use vgpu_scheduler::scheduling::PodLister;
use vgpu_scheduler::scheduling::SchedulingService;

struct Cluster {
    inventory: Arc<InventoryService>,
    binder: Arc<MockPodBinder>,
    scheduling: Arc<SchedulingService>,
}

fn cluster(config: InventoryConfig) -> Cluster {
    let store = Arc::new(DeviceRecordStore::new());
    let inventory = Arc::new(InventoryService::new(Arc::clone(&store), config));
    let engine = AllocationEngine::new(Arc::clone(&store), EngineConfig::default());
    let binder = Arc::new(MockPodBinder::new());
    let scheduling = Arc::new(SchedulingService::new(
        engine,
        store,
        PodRequestParser::default(),
        Arc::clone(&binder) as Arc<dyn PodBinder>,
    ));
    Cluster {
        inventory,
        binder,
        scheduling,
    }
}

fn register(cluster: &Cluster, node: &str) {
    cluster
        .inventory
        .register(
            node,
            vec![DeviceRegistration {
                id: format!("{node}-gpu0"),
                total_memory: 8000,
                total_compute_share: 100,
                max_slices: None,
            }],
            None,
        )
        .unwrap();
}

fn gpu_pod(name: &str, memory: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(format!("uid-{name}")),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                resources: Some(ResourceRequirements {
                    limits: Some(BTreeMap::from([
                        ("nvidia.com/gpu".to_string(), Quantity("1".to_string())),
                        ("nvidia.com/gpumem".to_string(), Quantity(memory.to_string())),
                        ("nvidia.com/gpucores".to_string(), Quantity("10".to_string())),
                    ])),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    }
}

fn id(name: &str) -> PodIdentifier {
    PodIdentifier::new("default", name)
}

fn used_memory(cluster: &Cluster, node: &str) -> u64 {
    cluster.inventory.query(&[node.to_string()]).nodes[node].devices[0]
        .used()
        .memory
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn concurrent_binds_never_oversubscribe() {
    let c = cluster(InventoryConfig::default());
    register(&c, "node-a");
    let names: Vec<String> = (0..8).map(|i| format!("p{i}")).collect();
    for name in &names {
        c.binder.insert_pod(gpu_pod(name, "2000"));
    }

    let handles: Vec<_> = names
        .iter()
        .map(|name| {
            let scheduling = Arc::clone(&c.scheduling);
            let pod = id(name);
            let uid = format!("uid-{name}");
            tokio::spawn(async move { scheduling.bind(&pod, &uid, "node-a").await.is_ok() })
        })
        .collect();
    let mut bound = 0;
    for handle in handles {
        if handle.await.unwrap() {
            bound += 1;
        }
    }

    assert_eq!(bound, 4);
    assert_eq!(c.binder.bind_calls(), 4);
    assert_eq!(used_memory(&c, "node-a"), 8000);
}

#[test(tokio::test)]
async fn deleted_pod_frees_capacity_for_the_next_one() {
    let c = cluster(InventoryConfig::default());
    register(&c, "node-a");
    let candidates = vec!["node-a".to_string()];

    c.scheduling.filter(&gpu_pod("big", "6000"), &candidates).unwrap();
    c.scheduling.bind(&id("big"), "uid-big", "node-a").await.unwrap();

    let blocked = c
        .scheduling
        .filter(&gpu_pod("next", "6000"), &candidates)
        .unwrap();
    assert!(blocked.report.feasible.is_empty());

    let released = c.scheduling.pod_deleted(&id("big")).await;
    assert_eq!(released.len(), 1);
    assert_eq!(used_memory(&c, "node-a"), 0);

    let outcome = c
        .scheduling
        .filter(&gpu_pod("next", "6000"), &candidates)
        .unwrap();
    assert_eq!(outcome.report.feasible.len(), 1);
    c.scheduling.bind(&id("next"), "uid-next", "node-a").await.unwrap();
    assert_eq!(used_memory(&c, "node-a"), 6000);
}

#[test(tokio::test)]
async fn watcher_events_and_reconciler_release_reservations() {
    let c = cluster(InventoryConfig::default());
    register(&c, "node-a");
    for name in ["gone", "orphan", "alive"] {
        c.binder.insert_pod(gpu_pod(name, "1000"));
        c.scheduling
            .bind(&id(name), &format!("uid-{name}"), "node-a")
            .await
            .unwrap();
    }
    assert_eq!(used_memory(&c, "node-a"), 3000);

    let (tx, rx) = mpsc::channel(4);
    tx.send(PodEvent::Released {
        pod: id("gone"),
        uid: Some("uid-gone".to_string()),
        reason: ReleaseReason::Succeeded,
    })
    .await
    .unwrap();
    drop(tx);
    c.scheduling
        .process_pod_events(rx, CancellationToken::new())
        .await;
    assert_eq!(used_memory(&c, "node-a"), 2000);

    let live = BTreeSet::from([id("alive")]);
    let cleaned = c.scheduling.reconcile(&live, Instant::now()).await;

    assert_eq!(cleaned, vec![id("orphan")]);
    assert_eq!(used_memory(&c, "node-a"), 1000);
    assert!(c.scheduling.binding(&id("alive")).is_some());
}

#[test(tokio::test)]
async fn stale_node_drops_reservations_until_it_registers_again() {
    let c = cluster(InventoryConfig {
        default_max_slices: 10,
        heartbeat_timeout: Duration::from_secs(30),
    });
    register(&c, "node-a");
    c.binder.insert_pod(gpu_pod("p1", "2000"));
    c.scheduling.bind(&id("p1"), "uid-p1", "node-a").await.unwrap();

    let swept = c
        .inventory
        .sweep_stale(Instant::now() + Duration::from_secs(60));

    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].0, "node-a");
    assert_eq!(swept[0].1.len(), 1);
    let snapshot = c.inventory.query(&["node-a".to_string()]);
    assert!(snapshot.nodes.is_empty());
    assert!(snapshot.missing.contains_key("node-a"));

    let outcome = c
        .scheduling
        .filter(&gpu_pod("p2", "1000"), &["node-a".to_string()])
        .unwrap();
    assert!(matches!(
        outcome.report.infeasible.get("node-a"),
        Some(Infeasibility::StaleNode)
    ));

    register(&c, "node-a");
    let outcome = c
        .scheduling
        .filter(&gpu_pod("p2", "1000"), &["node-a".to_string()])
        .unwrap();
    assert_eq!(outcome.report.feasible.len(), 1);
    assert_eq!(used_memory(&c, "node-a"), 0);
}

#[test(tokio::test)]
async fn reconciler_task_picks_up_vanished_pods() {
    let c = cluster(InventoryConfig::default());
    register(&c, "node-a");
    c.binder.insert_pod(gpu_pod("p1", "2000"));
    c.scheduling.bind(&id("p1"), "uid-p1", "node-a").await.unwrap();

    let lister = Arc::new(StaticPodLister::new(BTreeSet::from([id("p1")])));
    let token = CancellationToken::new();
    let reconciler = {
        let scheduling = Arc::clone(&c.scheduling);
        let lister = Arc::clone(&lister) as Arc<dyn PodLister>;
        let token = token.clone();
        tokio::spawn(async move {
            scheduling
                .run_reconciler(lister, Duration::from_millis(10), token)
                .await;
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(used_memory(&c, "node-a"), 2000);

    lister.set_live(BTreeSet::new());
    tokio::time::timeout(Duration::from_secs(2), async {
        while used_memory(&c, "node-a") != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    token.cancel();
    reconciler.await.unwrap();
    assert!(c.scheduling.binding(&id("p1")).is_none());
}
