//! Manifest describing a cluster and its machines for local runs.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::types::{Cluster, Machine};

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub cluster: Cluster,

    #[serde(default)]
    pub machines: Vec<Machine>,

    /// Admin kubeconfig handed to the deployer stand-in.
    #[serde(default)]
    pub kubeconfig: String,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("failed to parse manifest {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut manifest: Manifest = serde_json::from_str(raw)?;

        // Machines without a namespace live in the cluster's namespace.
        let namespace = manifest.cluster.namespace().to_string();
        for machine in &mut manifest.machines {
            if machine.metadata.namespace.is_empty() {
                machine.metadata.namespace = namespace.clone();
            }
        }
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults_machine_namespace() {
        let raw = r#"{
            "cluster": {"metadata": {"name": "dev", "namespace": "capx"}},
            "machines": [
                {"metadata": {"name": "cp-0", "labels": {"set": "controlplane"}}},
                {"metadata": {"name": "w-0", "namespace": "other", "labels": {"set": "node"}}}
            ]
        }"#;

        let manifest = Manifest::parse(raw).unwrap();
        assert_eq!(manifest.machines[0].namespace(), "capx");
        assert_eq!(manifest.machines[1].namespace(), "other");
        assert!(manifest.kubeconfig.is_empty());
    }

    #[test]
    fn test_parse_rejects_missing_cluster() {
        assert!(Manifest::parse(r#"{"machines": []}"#).is_err());
    }
}
