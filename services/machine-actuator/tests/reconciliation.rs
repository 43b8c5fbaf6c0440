//! Integration tests for reconciliation passes over a whole cluster.

use std::sync::Arc;
use std::time::Duration;

use capx_machine_actuator::memory::{
    LaunchFailure, MemoryCompute, MemoryLoadBalancer, MemoryMachineStore,
    MemorySecretClientFactory, StaticEndpoints,
};
use capx_machine_actuator::reconciler::{ReconcileStats, Reconciler};
use capx_machine_actuator::tokens::KubeadmTokenIssuer;
use capx_machine_actuator::types::{ApiEndpoint, ROLE_LABEL};
use capx_machine_actuator::{
    Actuator, ActuatorParams, Cluster, InstanceState, Machine, ScopeFactory,
};

fn test_cluster() -> Cluster {
    let mut cluster = Cluster::default();
    cluster.metadata.name = "dev".to_string();
    cluster.metadata.namespace = "capx".to_string();
    cluster.status.api_endpoints.push(ApiEndpoint {
        host: "10.0.0.10".to_string(),
        port: 6443,
    });
    cluster
}

fn test_machine(name: &str, role: &str) -> Machine {
    let mut m = Machine::default();
    m.metadata.name = name.to_string();
    m.metadata.namespace = "capx".to_string();
    m.metadata
        .labels
        .insert(ROLE_LABEL.to_string(), role.to_string());
    m
}

fn setup() -> (Reconciler, Arc<MemoryMachineStore>, Arc<MemoryCompute>) {
    let store = Arc::new(MemoryMachineStore::new());
    let compute = Arc::new(MemoryCompute::new());

    let actuator = Actuator::new(ActuatorParams {
        scopes: ScopeFactory::new(store.clone()),
        compute: compute.clone(),
        load_balancer: Arc::new(MemoryLoadBalancer::new()),
        endpoints: Arc::new(StaticEndpoints::new("kubeconfig")),
        tokens: Arc::new(KubeadmTokenIssuer::new(Arc::new(
            MemorySecretClientFactory::new(),
        ))),
    });

    (Reconciler::new(actuator, store.clone()), store, compute)
}

#[tokio::test]
async fn test_pass_lifecycle() {
    let (reconciler, store, compute) = setup();
    let cluster = test_cluster();
    store.insert(test_machine("cp-0", "controlplane"));
    store.insert(test_machine("w-0", "node"));

    let stats = reconciler.reconcile_pass(&cluster).await.unwrap();
    assert_eq!(
        stats,
        ReconcileStats {
            created: 2,
            ..Default::default()
        }
    );
    assert_eq!(compute.launch_calls(), 2);

    let stats = reconciler.reconcile_pass(&cluster).await.unwrap();
    assert_eq!(stats.updated, 2);
    assert_eq!(compute.launch_calls(), 2);

    let mut deleting = store.get(&test_machine("w-0", "node").key()).unwrap();
    deleting.metadata.deletion_timestamp = Some(chrono::Utc::now());
    store.insert(deleting);

    let stats = reconciler.reconcile_pass(&cluster).await.unwrap();
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.updated, 1);
    assert_eq!(compute.terminate_calls(), 1);
    assert_eq!(
        compute
            .instances()
            .iter()
            .filter(|i| i.state == InstanceState::ShuttingDown)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_pass_collects_requeue() {
    let (reconciler, store, compute) = setup();
    store.insert(test_machine("w-0", "node"));
    compute.fail_launches(Some(LaunchFailure::DependencyNotReady));

    let stats = reconciler.reconcile_pass(&test_cluster()).await.unwrap();

    assert_eq!(stats.created, 0);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.requeue_after, Some(Duration::from_secs(60)));
}

#[tokio::test]
async fn test_pass_isolates_failures() {
    let (reconciler, store, compute) = setup();
    store.insert(test_machine("bad", "foo"));
    store.insert(test_machine("w-0", "node"));

    let stats = reconciler.reconcile_pass(&test_cluster()).await.unwrap();

    assert_eq!(stats.failed, 1);
    assert_eq!(stats.created, 1);
    assert_eq!(compute.launch_calls(), 1);
}
