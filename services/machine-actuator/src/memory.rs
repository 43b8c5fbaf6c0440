//! In-memory collaborators for testing and development.
//!
//! These stand in for the resource store, the compute and load balancer
//! APIs, the cluster deployer and the workload cluster's secret API. Each
//! records call counts and supports failure injection so tests can assert
//! on what the actuator asked for, not only on what it returned.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use capx_id::{InstanceId, SecurityGroupId};
use capx_reconcile::Tags;
use tracing::{debug, info};

use crate::attachment::{LoadBalancerError, LoadBalancerService};
use crate::compute::{core_security_groups, ComputeError, ComputeService};
use crate::endpoints::{endpoint_from_status, ClusterEndpoints, EndpointError};
use crate::scope::{MachineScope, MachineStore, StoreError};
use crate::tokens::{BootstrapToken, SecretClient, SecretClientFactory, TokenError, TokenSecret};
use crate::types::{Cluster, Instance, InstanceState, Machine, MachineKey};

/// Tag carrying the machine an instance was launched for.
pub const MACHINE_TAG: &str = "capx.io/machine";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Resource store
// =============================================================================

/// Machine store with optimistic concurrency on `resource_version`.
#[derive(Default)]
pub struct MemoryMachineStore {
    machines: Mutex<BTreeMap<MachineKey, Machine>>,
    writes: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemoryMachineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a machine without version checks.
    pub fn insert(&self, machine: Machine) {
        lock(&self.machines).insert(machine.key(), machine);
    }

    pub fn get(&self, key: &MachineKey) -> Option<Machine> {
        lock(&self.machines).get(key).cloned()
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn write(
        &self,
        machine: &Machine,
        apply: impl FnOnce(&mut Machine),
    ) -> Result<Machine, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }

        let key = machine.key();
        let mut machines = lock(&self.machines);
        let stored = machines
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        if stored.metadata.resource_version != machine.metadata.resource_version {
            return Err(StoreError::Conflict {
                key,
                expected: machine.metadata.resource_version,
                actual: stored.metadata.resource_version,
            });
        }

        apply(stored);
        stored.metadata.resource_version += 1;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored.clone())
    }
}

#[async_trait]
impl MachineStore for MemoryMachineStore {
    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>, StoreError> {
        Ok(lock(&self.machines)
            .values()
            .filter(|m| m.namespace() == namespace)
            .cloned()
            .collect())
    }

    async fn get_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Machine>, StoreError> {
        let key = MachineKey {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        Ok(self.get(&key))
    }

    async fn update_machine(&self, machine: &Machine) -> Result<Machine, StoreError> {
        self.write(machine, |stored| {
            let version = stored.metadata.resource_version;
            stored.metadata = machine.metadata.clone();
            stored.metadata.resource_version = version;
            stored.spec = machine.spec.clone();
        })
    }

    async fn update_machine_status(&self, machine: &Machine) -> Result<Machine, StoreError> {
        self.write(machine, |stored| {
            stored.status = machine.status.clone();
        })
    }
}

// =============================================================================
// Compute
// =============================================================================

/// Injected launch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchFailure {
    /// Network prerequisites are missing.
    DependencyNotReady,

    /// The provider rejects the launch.
    Rejected,
}

/// Compute backend keeping instances in memory.
#[derive(Default)]
pub struct MemoryCompute {
    instances: Mutex<BTreeMap<InstanceId, Instance>>,
    launch_failure: Mutex<Option<LaunchFailure>>,
    fail_describe: AtomicBool,
    launches: AtomicU64,
    describes: AtomicU64,
    terminations: AtomicU64,
    group_updates: AtomicU64,
    tag_updates: AtomicU64,
}

impl MemoryCompute {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance launched for `machine` in the given state.
    pub fn seed_instance(&self, machine: &Machine, state: InstanceState) -> Instance {
        let instance = Instance {
            id: InstanceId::generate(),
            state,
            instance_type: None,
            image_id: None,
            private_ip: None,
            security_group_ids: BTreeSet::new(),
            tags: identity_tags(machine),
        };
        lock(&self.instances).insert(instance.id.clone(), instance.clone());
        instance
    }

    pub fn instance(&self, id: &InstanceId) -> Option<Instance> {
        lock(&self.instances).get(id).cloned()
    }

    pub fn instances(&self) -> Vec<Instance> {
        lock(&self.instances).values().cloned().collect()
    }

    /// Change an instance out of band.
    pub fn modify(&self, id: &InstanceId, f: impl FnOnce(&mut Instance)) {
        if let Some(instance) = lock(&self.instances).get_mut(id) {
            f(instance);
        }
    }

    /// Remove an instance out of band.
    pub fn forget(&self, id: &InstanceId) {
        lock(&self.instances).remove(id);
    }

    pub fn fail_launches(&self, failure: Option<LaunchFailure>) {
        *lock(&self.launch_failure) = failure;
    }

    pub fn fail_describe(&self, fail: bool) {
        self.fail_describe.store(fail, Ordering::SeqCst);
    }

    pub fn launch_calls(&self) -> u64 {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn describe_calls(&self) -> u64 {
        self.describes.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> u64 {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn security_group_calls(&self) -> u64 {
        self.group_updates.load(Ordering::SeqCst)
    }

    pub fn tag_calls(&self) -> u64 {
        self.tag_updates.load(Ordering::SeqCst)
    }

    /// Non-terminating instance launched for the scope's machine.
    fn find_for_machine(&self, scope: &MachineScope) -> Option<Instance> {
        let instances = lock(&self.instances);
        let alive = |i: &&Instance| !i.state.is_terminating();

        if let Some(id) = &scope.provider_status.instance_id {
            if let Some(instance) = instances.get(id).filter(alive) {
                return Some(instance.clone());
            }
        }

        let key = scope.key().to_string();
        instances
            .values()
            .filter(alive)
            .find(|i| i.tags.get(MACHINE_TAG) == Some(&key))
            .cloned()
    }

    fn with_instance<T>(
        &self,
        operation: &'static str,
        id: &InstanceId,
        f: impl FnOnce(&mut Instance) -> T,
    ) -> Result<T, ComputeError> {
        let mut instances = lock(&self.instances);
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| ComputeError::api(operation, format!("instance {id} not found")))?;
        Ok(f(instance))
    }
}

fn identity_tags(machine: &Machine) -> Tags {
    let mut tags = Tags::new();
    tags.insert("Name".to_string(), machine.name().to_string());
    tags.insert(MACHINE_TAG.to_string(), machine.key().to_string());
    tags
}

#[async_trait]
impl ComputeService for MemoryCompute {
    async fn create_or_get_instance(
        &self,
        scope: &MachineScope,
        bootstrap_token: Option<&BootstrapToken>,
        _kubeconfig: &str,
    ) -> Result<Instance, ComputeError> {
        if let Some(existing) = self.find_for_machine(scope) {
            debug!(instance_id = %existing.id, "Found existing instance for machine");
            return Ok(existing);
        }

        match *lock(&self.launch_failure) {
            Some(LaunchFailure::DependencyNotReady) => {
                return Err(ComputeError::DependencyNotReady(
                    "subnet for machine is not available".to_string(),
                ))
            }
            Some(LaunchFailure::Rejected) => {
                return Err(ComputeError::api("run instances", "launch rejected"))
            }
            None => {}
        }

        let machine = scope.machine();
        let mut groups: BTreeSet<SecurityGroupId> = match machine.role() {
            Ok(role) => core_security_groups(scope.cluster(), role),
            Err(_) => BTreeSet::new(),
        };
        groups.extend(scope.provider_config.additional_security_groups.iter().cloned());

        let mut tags = identity_tags(machine);
        tags.insert(
            format!("kubernetes.io/cluster/{}", scope.cluster().name()),
            "owned".to_string(),
        );
        tags.extend(scope.provider_config.additional_tags.clone());

        let instance = Instance {
            id: InstanceId::generate(),
            state: InstanceState::Pending,
            instance_type: scope.provider_config.instance_type.clone(),
            image_id: scope.provider_config.ami.clone(),
            private_ip: None,
            security_group_ids: groups,
            tags,
        };

        self.launches.fetch_add(1, Ordering::SeqCst);
        info!(
            instance_id = %instance.id,
            machine = machine.name(),
            joining = bootstrap_token.is_some(),
            "[MEMORY] Launched instance"
        );
        lock(&self.instances).insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn instance_if_exists(&self, id: &InstanceId) -> Result<Option<Instance>, ComputeError> {
        self.describes.fetch_add(1, Ordering::SeqCst);
        if self.fail_describe.load(Ordering::SeqCst) {
            return Err(ComputeError::api("describe instances", "injected failure"));
        }
        Ok(self.instance(id))
    }

    async fn terminate_instance(&self, id: &InstanceId) -> Result<(), ComputeError> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        self.with_instance("terminate instances", id, |i| {
            i.state = InstanceState::ShuttingDown;
        })
    }

    async fn update_instance_security_groups(
        &self,
        id: &InstanceId,
        groups: &BTreeSet<SecurityGroupId>,
    ) -> Result<(), ComputeError> {
        self.group_updates.fetch_add(1, Ordering::SeqCst);
        self.with_instance("modify instance attribute", id, |i| {
            i.security_group_ids = groups.clone();
        })
    }

    async fn create_or_update_tags(
        &self,
        id: &InstanceId,
        tags: &Tags,
    ) -> Result<(), ComputeError> {
        self.tag_updates.fetch_add(1, Ordering::SeqCst);
        self.with_instance("create tags", id, |i| {
            i.tags.extend(tags.clone());
        })
    }

    async fn delete_tags(&self, id: &InstanceId, tags: &Tags) -> Result<(), ComputeError> {
        self.tag_updates.fetch_add(1, Ordering::SeqCst);
        self.with_instance("delete tags", id, |i| {
            for key in tags.keys() {
                i.tags.remove(key);
            }
        })
    }
}

// =============================================================================
// Load balancer
// =============================================================================

#[derive(Default)]
pub struct MemoryLoadBalancer {
    registered: Mutex<BTreeSet<InstanceId>>,
    fail: AtomicBool,
    calls: AtomicU64,
}

impl MemoryLoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered(&self) -> BTreeSet<InstanceId> {
        lock(&self.registered).clone()
    }

    pub fn register_calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_registrations(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl LoadBalancerService for MemoryLoadBalancer {
    async fn register_instance_with_api_server_lb(
        &self,
        _cluster: &Cluster,
        id: &InstanceId,
    ) -> Result<(), LoadBalancerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(LoadBalancerError {
                operation: "register instances",
                message: "injected failure".to_string(),
            });
        }
        lock(&self.registered).insert(id.clone());
        Ok(())
    }
}

// =============================================================================
// Cluster endpoints
// =============================================================================

/// Endpoint from cluster status and a fixed kubeconfig.
pub struct StaticEndpoints {
    kubeconfig: Option<String>,
}

impl StaticEndpoints {
    pub fn new(kubeconfig: impl Into<String>) -> Self {
        Self {
            kubeconfig: Some(kubeconfig.into()),
        }
    }

    /// Endpoints whose kubeconfig lookup always fails.
    pub fn without_kubeconfig() -> Self {
        Self { kubeconfig: None }
    }
}

#[async_trait]
impl ClusterEndpoints for StaticEndpoints {
    async fn control_plane_endpoint(&self, cluster: &Cluster) -> Result<String, EndpointError> {
        endpoint_from_status(cluster)
    }

    async fn kubeconfig(&self, cluster: &Cluster) -> Result<String, EndpointError> {
        self.kubeconfig
            .clone()
            .ok_or_else(|| EndpointError::Kubeconfig {
                cluster: cluster.name().to_string(),
                message: "no kubeconfig configured".to_string(),
            })
    }
}

// =============================================================================
// Workload cluster secrets
// =============================================================================

#[derive(Default)]
pub struct MemorySecretClientFactory {
    secrets: Arc<Mutex<Vec<TokenSecret>>>,
    fail_connect: AtomicBool,
}

impl MemorySecretClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn secrets(&self) -> Vec<TokenSecret> {
        lock(&self.secrets).clone()
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SecretClientFactory for MemorySecretClientFactory {
    async fn connect(
        &self,
        endpoint: &str,
        _kubeconfig: &str,
    ) -> Result<Arc<dyn SecretClient>, TokenError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TokenError::Connect {
                endpoint: endpoint.to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(Arc::new(MemorySecretClient {
            secrets: Arc::clone(&self.secrets),
        }))
    }
}

struct MemorySecretClient {
    secrets: Arc<Mutex<Vec<TokenSecret>>>,
}

#[async_trait]
impl SecretClient for MemorySecretClient {
    async fn create_secret(&self, secret: &TokenSecret) -> Result<(), TokenError> {
        let mut secrets = lock(&self.secrets);
        if secrets
            .iter()
            .any(|s| s.namespace == secret.namespace && s.name == secret.name)
        {
            return Err(TokenError::CreateSecret {
                namespace: secret.namespace.clone(),
                name: secret.name.clone(),
                message: "already exists".to_string(),
            });
        }
        secrets.push(secret.clone());
        Ok(())
    }
}
