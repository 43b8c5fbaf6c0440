//! Compute provisioning interface and the decision logic built on it.
//!
//! The [`ComputeService`] trait abstracts the provider's instance API:
//! - create-or-get, lookup, terminate
//! - security group and tag mutation
//!
//! The free functions here hold the drift-correction and existence rules
//! shared by the actuator verbs and the node-role classifier.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use capx_id::{InstanceId, SecurityGroupId};
use capx_reconcile::{SetDiff, TagDiff, Tags};
use thiserror::Error;
use tracing::{debug, info};

use crate::scope::MachineScope;
use crate::tokens::BootstrapToken;
use crate::types::{
    Cluster, Instance, MachineProviderStatus, NodeRole, SecurityGroupRole,
    TAGS_LAST_APPLIED_ANNOTATION,
};

/// Compute backend errors.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// A dependency of the launch (network, subnet, security groups) is not
    /// ready yet. Callers should retry later rather than fail.
    #[error("dependency not ready: {0}")]
    DependencyNotReady(String),

    /// The provider rejected or failed the request.
    #[error("{operation} failed: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },

    /// The record of tags applied by an earlier update is unreadable.
    #[error("invalid applied tags record: {0}")]
    AppliedTags(serde_json::Error),
}

impl ComputeError {
    pub fn api(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Api {
            operation,
            message: message.into(),
        }
    }

    pub fn is_dependency_not_ready(&self) -> bool {
        matches!(self, Self::DependencyNotReady(_))
    }
}

/// Provider instance API.
#[async_trait]
pub trait ComputeService: Send + Sync {
    /// Return the instance backing the scope's machine, launching one if
    /// none exists. Must be idempotent across repeated calls for the same
    /// machine.
    async fn create_or_get_instance(
        &self,
        scope: &MachineScope,
        bootstrap_token: Option<&BootstrapToken>,
        kubeconfig: &str,
    ) -> Result<Instance, ComputeError>;

    /// Describe an instance. `Ok(None)` when the provider does not know it.
    async fn instance_if_exists(&self, id: &InstanceId) -> Result<Option<Instance>, ComputeError>;

    /// Request termination. Completion is asynchronous.
    async fn terminate_instance(&self, id: &InstanceId) -> Result<(), ComputeError>;

    /// Replace the instance's security groups with `groups`.
    async fn update_instance_security_groups(
        &self,
        id: &InstanceId,
        groups: &BTreeSet<SecurityGroupId>,
    ) -> Result<(), ComputeError>;

    /// Create or overwrite tags.
    async fn create_or_update_tags(&self, id: &InstanceId, tags: &Tags) -> Result<(), ComputeError>;

    /// Remove tags.
    async fn delete_tags(&self, id: &InstanceId, tags: &Tags) -> Result<(), ComputeError>;
}

/// Whether the instance recorded in `status` exists and is usable.
///
/// No recorded ID, an unknown ID and any state other than pending or
/// running all count as absent.
pub async fn machine_exists(
    compute: &dyn ComputeService,
    status: &MachineProviderStatus,
) -> Result<bool, ComputeError> {
    let Some(id) = status.instance_id.as_ref() else {
        return Ok(false);
    };

    let instance = compute.instance_if_exists(id).await?;
    Ok(instance.is_some_and(|i| i.state.is_present()))
}

/// Cluster-wide security groups every machine of `role` carries.
pub fn core_security_groups(cluster: &Cluster, role: NodeRole) -> BTreeSet<SecurityGroupId> {
    let roles: &[SecurityGroupRole] = match role {
        NodeRole::ControlPlane => &[SecurityGroupRole::ControlPlane, SecurityGroupRole::Node],
        NodeRole::Node => &[SecurityGroupRole::Node],
    };

    roles
        .iter()
        .filter_map(|r| cluster.status.network.security_groups.get(r))
        .cloned()
        .collect()
}

/// Converge the instance's security groups to the core groups of `role`
/// plus the configured additional groups.
///
/// Returns true if a change was applied.
pub async fn ensure_security_groups(
    compute: &dyn ComputeService,
    scope: &MachineScope,
    role: NodeRole,
    instance: &Instance,
) -> Result<bool, ComputeError> {
    let mut desired = core_security_groups(scope.cluster(), role);
    desired.extend(scope.provider_config.additional_security_groups.iter().cloned());

    let diff = SetDiff::compute(&desired, &instance.security_group_ids);
    if diff.is_empty() {
        debug!(instance_id = %instance.id, "Security groups converged");
        return Ok(false);
    }

    info!(
        instance_id = %instance.id,
        add = ?diff.to_add,
        remove = ?diff.to_remove,
        "Correcting security group drift"
    );
    compute
        .update_instance_security_groups(&instance.id, &desired)
        .await?;
    Ok(true)
}

/// Tags recorded as applied by an earlier update.
pub fn last_applied_tags(scope: &MachineScope) -> Result<Tags, ComputeError> {
    match scope
        .machine()
        .metadata
        .annotations
        .get(TAGS_LAST_APPLIED_ANNOTATION)
    {
        Some(raw) => serde_json::from_str(raw).map_err(ComputeError::AppliedTags),
        None => Ok(Tags::new()),
    }
}

/// Converge the instance's additional tags and record what was applied.
///
/// Returns true if a change was applied.
pub async fn ensure_tags(
    compute: &dyn ComputeService,
    scope: &mut MachineScope,
    instance: &Instance,
) -> Result<bool, ComputeError> {
    let desired = scope.provider_config.additional_tags.clone();
    let previous = last_applied_tags(scope)?;
    let diff = TagDiff::compute(&desired, &instance.tags, &previous);

    let changed = !diff.is_empty();
    if !diff.to_upsert.is_empty() {
        info!(instance_id = %instance.id, tags = ?diff.to_upsert, "Applying tags");
        compute
            .create_or_update_tags(&instance.id, &diff.to_upsert)
            .await?;
    }
    if !diff.to_delete.is_empty() {
        info!(instance_id = %instance.id, tags = ?diff.to_delete, "Removing tags");
        compute.delete_tags(&instance.id, &diff.to_delete).await?;
    }

    if previous != desired {
        record_applied_tags(scope, &desired)?;
    }
    Ok(changed)
}

fn record_applied_tags(
    scope: &mut MachineScope,
    tags: &BTreeMap<String, String>,
) -> Result<(), ComputeError> {
    let annotations = &mut scope.machine_mut().metadata.annotations;
    if tags.is_empty() {
        annotations.remove(TAGS_LAST_APPLIED_ANNOTATION);
        return Ok(());
    }

    let raw = serde_json::to_string(tags).map_err(ComputeError::AppliedTags)?;
    annotations.insert(TAGS_LAST_APPLIED_ANNOTATION.to_string(), raw);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InstanceState, Machine};

    #[test]
    fn test_core_groups_by_role() {
        let mut cluster = Cluster::default();
        let cp: SecurityGroupId = "sg-0000000c".parse().unwrap();
        let node: SecurityGroupId = "sg-0000000d".parse().unwrap();
        let bastion: SecurityGroupId = "sg-0000000e".parse().unwrap();
        let groups = &mut cluster.status.network.security_groups;
        groups.insert(SecurityGroupRole::ControlPlane, cp.clone());
        groups.insert(SecurityGroupRole::Node, node.clone());
        groups.insert(SecurityGroupRole::Bastion, bastion);

        let control_plane = core_security_groups(&cluster, NodeRole::ControlPlane);
        assert_eq!(control_plane, [cp, node.clone()].into_iter().collect());

        let worker = core_security_groups(&cluster, NodeRole::Node);
        assert_eq!(worker, [node].into_iter().collect());
    }

    #[test]
    fn test_core_groups_missing_network() {
        assert!(core_security_groups(&Cluster::default(), NodeRole::Node).is_empty());
    }

    #[tokio::test]
    async fn test_machine_exists_without_id_skips_backend() {
        let compute = crate::memory::MemoryCompute::new();

        let exists = machine_exists(&compute, &MachineProviderStatus::default())
            .await
            .unwrap();

        assert!(!exists);
        assert_eq!(compute.describe_calls(), 0);
    }

    #[tokio::test]
    async fn test_machine_exists_requires_present_state() {
        let compute = crate::memory::MemoryCompute::new();
        let mut m = Machine::default();
        m.metadata.name = "m-0".to_string();
        let instance = compute.seed_instance(&m, InstanceState::Stopped);

        let status = MachineProviderStatus {
            instance_id: Some(instance.id),
            instance_state: None,
        };
        assert!(!machine_exists(&compute, &status).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_applied_tags_record_is_an_error() {
        let store = std::sync::Arc::new(crate::memory::MemoryMachineStore::new());
        let factory = crate::scope::ScopeFactory::new(store);
        let compute = crate::memory::MemoryCompute::new();

        let mut m = Machine::default();
        m.metadata.name = "m-0".to_string();
        m.metadata
            .annotations
            .insert(TAGS_LAST_APPLIED_ANNOTATION.to_string(), "{not json".to_string());
        let instance = compute.seed_instance(&m, InstanceState::Running);
        let mut scope = factory.machine_scope(&m, &Cluster::default()).unwrap();

        assert!(matches!(
            last_applied_tags(&scope),
            Err(ComputeError::AppliedTags(_))
        ));
        let result = ensure_tags(&compute, &mut scope, &instance).await;
        assert!(matches!(result, Err(ComputeError::AppliedTags(_))));
        assert_eq!(compute.tag_calls(), 0);
        assert_eq!(
            scope.machine().metadata.annotations[TAGS_LAST_APPLIED_ANNOTATION],
            "{not json"
        );
    }

    #[test]
    fn test_dependency_not_ready_kind() {
        assert!(ComputeError::DependencyNotReady("subnet".into()).is_dependency_not_ready());
        assert!(!ComputeError::api("run instances", "boom").is_dependency_not_ready());
    }
}
