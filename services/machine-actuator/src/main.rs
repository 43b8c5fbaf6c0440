//! capx Machine Actuator
//!
//! Runs reconciliation passes for one cluster described by a JSON manifest
//! against in-memory provider backends. Useful for exercising the actuator
//! end to end without cloud credentials.
//!
//! ## Flow
//!
//! - **Manifest**: cluster, machines and kubeconfig are loaded from disk
//! - **Reconciler**: each pass runs exists → create/update, or delete
//! - **Backends**: memory stand-ins for the store, compute, load balancer
//!   and workload cluster secrets

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use capx_machine_actuator::config::Config;
use capx_machine_actuator::manifest::Manifest;
use capx_machine_actuator::memory::{
    MemoryCompute, MemoryLoadBalancer, MemoryMachineStore, MemorySecretClientFactory,
    StaticEndpoints,
};
use capx_machine_actuator::reconciler::Reconciler;
use capx_machine_actuator::scope::decode_status;
use capx_machine_actuator::tokens::KubeadmTokenIssuer;
use capx_machine_actuator::{Actuator, ActuatorParams, MachineStore, ScopeFactory};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        manifest = %config.manifest_path.display(),
        passes = config.passes,
        "Starting capx machine actuator"
    );

    let manifest = Manifest::load(&config.manifest_path)?;
    let cluster = manifest.cluster;

    let store = Arc::new(MemoryMachineStore::new());
    for machine in manifest.machines {
        store.insert(machine);
    }

    let compute = Arc::new(MemoryCompute::new());
    let actuator = Actuator::new(ActuatorParams {
        scopes: ScopeFactory::new(store.clone()),
        compute: compute.clone(),
        load_balancer: Arc::new(MemoryLoadBalancer::new()),
        endpoints: Arc::new(StaticEndpoints::new(manifest.kubeconfig)),
        tokens: Arc::new(KubeadmTokenIssuer::new(Arc::new(
            MemorySecretClientFactory::new(),
        ))),
    });
    let reconciler = Reconciler::new(actuator, store.clone());

    for pass in 1..=config.passes {
        let stats = reconciler.reconcile_pass(&cluster).await?;
        info!(pass, ?stats, "Pass finished");
        if let Some(after) = stats.requeue_after {
            warn!(after_secs = after.as_secs(), "Some machines asked to be retried later");
        }
    }

    for instance in compute.instances() {
        info!(instance_id = %instance.id, state = %instance.state, "Instance");
    }
    for machine in store.list_machines(cluster.namespace()).await? {
        let status = decode_status(&machine)?;
        info!(
            machine = %machine.key(),
            instance_id = ?status.instance_id.map(|id| id.to_string()),
            state = ?status.instance_state.map(|s| s.as_str()),
            "Machine"
        );
    }

    info!("Machine actuator run complete");
    Ok(())
}
