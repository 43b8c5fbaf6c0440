//! Control-plane endpoint and kubeconfig lookup for a cluster.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::Cluster;

#[derive(Debug, Error)]
pub enum EndpointError {
    /// The control plane has not published an endpoint yet.
    #[error("cluster {cluster} has no control plane endpoint yet")]
    NotReady { cluster: String },

    #[error("no kubeconfig available for cluster {cluster}: {message}")]
    Kubeconfig { cluster: String, message: String },
}

/// Lookups the actuator needs from the cluster deployer.
#[async_trait]
pub trait ClusterEndpoints: Send + Sync {
    /// Reachable URL of the cluster's API server.
    async fn control_plane_endpoint(&self, cluster: &Cluster) -> Result<String, EndpointError>;

    /// Admin kubeconfig for the cluster.
    async fn kubeconfig(&self, cluster: &Cluster) -> Result<String, EndpointError>;
}

/// Endpoint URL from the first API endpoint recorded in cluster status.
pub fn endpoint_from_status(cluster: &Cluster) -> Result<String, EndpointError> {
    cluster
        .status
        .api_endpoints
        .first()
        .map(|ep| format!("https://{}:{}", ep.host, ep.port))
        .ok_or_else(|| EndpointError::NotReady {
            cluster: cluster.name().to_string(),
        })
}
