//! Resource model for machines, clusters and provider instances.
//!
//! Machines and clusters mirror the declarative objects held by the
//! resource store. Provider-specific configuration and status travel as
//! opaque JSON inside those objects and are decoded when a scope is opened.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use capx_id::{InstanceId, SecurityGroupId};
use capx_reconcile::Tags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label selecting the role a machine plays in the cluster.
pub const ROLE_LABEL: &str = "set";

/// Annotation marking a machine as provisioned by this actuator.
pub const PROVISIONED_ANNOTATION: &str = "capx.io/provisioned";

/// Annotation recording the additional tags applied on the last update.
pub const TAGS_LAST_APPLIED_ANNOTATION: &str = "capx.io/tags-last-applied";

/// Object metadata shared by machines and clusters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// Set once deletion of the object has been requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    /// Bumped by the resource store on every write.
    #[serde(default)]
    pub resource_version: u64,
}

/// Identity of a machine: namespace and name, nothing else.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MachineKey {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for MachineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Desired-state record for one cloud instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: MachineSpec,

    #[serde(default)]
    pub status: MachineStatus,
}

impl Machine {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn key(&self) -> MachineKey {
        MachineKey {
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
        }
    }

    /// Machines are equal for classification purposes when name and
    /// namespace match; no other field is compared.
    pub fn same_identity(&self, other: &Machine) -> bool {
        self.metadata.name == other.metadata.name
            && self.metadata.namespace == other.metadata.namespace
    }

    /// Raw value of the role label, if any.
    pub fn role_label(&self) -> Option<&str> {
        self.metadata.labels.get(ROLE_LABEL).map(String::as_str)
    }

    pub fn role(&self) -> Result<NodeRole, UnrecognizedRole> {
        NodeRole::from_label(self.role_label())
    }

    pub fn is_control_plane(&self) -> bool {
        matches!(self.role(), Ok(NodeRole::ControlPlane))
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Encoded [`MachineProviderConfig`].
    #[serde(default)]
    pub provider_spec: serde_json::Value,

    #[serde(default)]
    pub versions: MachineVersions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineVersions {
    #[serde(default)]
    pub kubelet: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Encoded [`MachineProviderStatus`].
    #[serde(default)]
    pub provider_status: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Provider configuration carried in the machine spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ami: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,

    /// Security groups attached in addition to the cluster's core groups.
    #[serde(default)]
    pub additional_security_groups: Vec<SecurityGroupId>,

    /// Tags applied in addition to the ones the provider manages.
    #[serde(default)]
    pub additional_tags: Tags,
}

impl MachineProviderConfig {
    /// Decode from a raw provider spec. A missing spec decodes to defaults.
    pub fn decode(raw: &serde_json::Value) -> Result<Self, serde_json::Error> {
        if raw.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(raw.clone())
    }
}

/// Provider status carried in the machine status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineProviderStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_state: Option<InstanceState>,
}

impl MachineProviderStatus {
    /// Decode from a raw provider status. A missing status decodes to defaults.
    pub fn decode(raw: &serde_json::Value) -> Result<Self, serde_json::Error> {
        if raw.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(raw.clone())
    }

    pub fn encode(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Role a machine plays in the cluster, read from the `set` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Node,
    ControlPlane,
}

impl NodeRole {
    pub fn from_label(label: Option<&str>) -> Result<Self, UnrecognizedRole> {
        match label {
            Some("node") => Ok(Self::Node),
            Some("controlplane") => Ok(Self::ControlPlane),
            other => Err(UnrecognizedRole {
                label: other.map(str::to_string),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::ControlPlane => "controlplane",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The role label is missing or holds an unknown value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown value {label:?} for label \"set\"")]
pub struct UnrecognizedRole {
    pub label: Option<String>,
}

/// Declarative cluster the machines belong to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub status: ClusterStatus,
}

impl Cluster {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub api_endpoints: Vec<ApiEndpoint>,

    #[serde(default)]
    pub network: NetworkStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    /// Cluster-wide security groups keyed by the role they serve.
    #[serde(default)]
    pub security_groups: BTreeMap<SecurityGroupRole, SecurityGroupId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityGroupRole {
    Bastion,
    ControlPlane,
    Node,
}

/// Lifecycle state of a provider instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    /// The instance is usable, or about to be.
    pub fn is_present(&self) -> bool {
        match self {
            Self::Pending | Self::Running => true,
            Self::ShuttingDown | Self::Terminated | Self::Stopping | Self::Stopped => false,
        }
    }

    /// Termination has already been requested or completed.
    pub fn is_terminating(&self) -> bool {
        match self {
            Self::ShuttingDown | Self::Terminated => true,
            Self::Pending | Self::Running | Self::Stopping | Self::Stopped => false,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live provider instance as described by the compute backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: InstanceId,
    pub state: InstanceState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,

    #[serde(default)]
    pub security_group_ids: BTreeSet<SecurityGroupId>,

    #[serde(default)]
    pub tags: Tags,
}
