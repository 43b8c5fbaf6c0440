//! Registration of control-plane instances with the API load balancer.

use async_trait::async_trait;
use capx_id::InstanceId;
use thiserror::Error;
use tracing::debug;

use crate::types::{Cluster, Instance, Machine, NodeRole};

#[derive(Debug, Error)]
#[error("load balancer {operation} failed: {message}")]
pub struct LoadBalancerError {
    pub operation: &'static str,
    pub message: String,
}

/// Load balancer fronting the cluster's API servers.
#[async_trait]
pub trait LoadBalancerService: Send + Sync {
    /// Register an instance. Registering an already-registered instance
    /// succeeds.
    async fn register_instance_with_api_server_lb(
        &self,
        cluster: &Cluster,
        id: &InstanceId,
    ) -> Result<(), LoadBalancerError>;
}

/// Ensure a control-plane machine's instance is behind the API load
/// balancer. Other roles are left alone.
///
/// Returns true when a registration call was made.
pub async fn reconcile_lb_attachment(
    lb: &dyn LoadBalancerService,
    cluster: &Cluster,
    machine: &Machine,
    instance: &Instance,
) -> Result<bool, LoadBalancerError> {
    match machine.role() {
        Ok(NodeRole::ControlPlane) => {}
        Ok(NodeRole::Node) | Err(_) => return Ok(false),
    }

    debug!(
        instance_id = %instance.id,
        machine = machine.name(),
        "Registering with API load balancer"
    );
    lb.register_instance_with_api_server_lb(cluster, &instance.id)
        .await?;
    Ok(true)
}
