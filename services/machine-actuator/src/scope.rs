//! Per-reconciliation working context.
//!
//! A [`MachineScope`] binds one machine and its cluster, decodes the
//! provider configuration and status, and owns the only commit point for
//! status changes: [`MachineScope::close`]. Mutations made to the scope are
//! lost unless it is closed, so every verb closes its scope on every exit
//! path.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use crate::types::{Cluster, Machine, MachineKey, MachineProviderConfig, MachineProviderStatus};

/// Resource store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object does not exist in the store.
    #[error("machine {0} not found")]
    NotFound(MachineKey),

    /// The write raced with another writer.
    #[error("conflict writing machine {key}: expected version {expected}, found {actual}")]
    Conflict {
        key: MachineKey,
        expected: u64,
        actual: u64,
    },

    /// Transport or backend failure.
    #[error("resource store unavailable: {0}")]
    Unavailable(String),
}

/// Declarative resource store holding machine objects.
#[async_trait]
pub trait MachineStore: Send + Sync {
    /// List machines in a namespace. Ordering is not significant.
    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>, StoreError>;

    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, StoreError>;

    /// Write metadata and spec. Returns the stored object.
    async fn update_machine(&self, machine: &Machine) -> Result<Machine, StoreError>;

    /// Write the status subresource. Returns the stored object.
    async fn update_machine_status(&self, machine: &Machine) -> Result<Machine, StoreError>;
}

/// Errors building a scope.
#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("failed to decode provider config of machine {machine}: {error}")]
    ProviderConfig {
        machine: MachineKey,
        error: serde_json::Error,
    },

    #[error("failed to decode provider status of machine {machine}: {error}")]
    ProviderStatus {
        machine: MachineKey,
        error: serde_json::Error,
    },

    #[error("failed to encode provider status of machine {machine}: {error}")]
    EncodeStatus {
        machine: MachineKey,
        error: serde_json::Error,
    },

    #[error("failed to commit machine {machine}: {error}")]
    Commit {
        machine: MachineKey,
        error: StoreError,
    },
}

/// Builds scopes against a fixed resource store.
#[derive(Clone)]
pub struct ScopeFactory {
    store: Arc<dyn MachineStore>,
}

impl ScopeFactory {
    pub fn new(store: Arc<dyn MachineStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn MachineStore> {
        &self.store
    }

    /// Open a scope for one reconciliation of `machine`.
    pub fn machine_scope(
        &self,
        machine: &Machine,
        cluster: &Cluster,
    ) -> Result<MachineScope, ScopeError> {
        let provider_config = MachineProviderConfig::decode(&machine.spec.provider_spec)
            .map_err(|error| ScopeError::ProviderConfig {
                machine: machine.key(),
                error,
            })?;
        let provider_status = decode_status(machine)?;

        Ok(MachineScope {
            machine: machine.clone(),
            original: machine.clone(),
            cluster: cluster.clone(),
            provider_config,
            original_status: provider_status.clone(),
            provider_status,
            store: Arc::clone(&self.store),
        })
    }
}

/// Decode only the provider status of a machine, without opening a scope.
pub fn decode_status(machine: &Machine) -> Result<MachineProviderStatus, ScopeError> {
    MachineProviderStatus::decode(&machine.status.provider_status).map_err(|error| {
        ScopeError::ProviderStatus {
            machine: machine.key(),
            error,
        }
    })
}

/// Working context for one reconciliation of one machine.
pub struct MachineScope {
    machine: Machine,
    original: Machine,
    cluster: Cluster,

    /// Decoded provider configuration (read-only).
    pub provider_config: MachineProviderConfig,

    /// Writable status projection, committed on close.
    pub provider_status: MachineProviderStatus,
    original_status: MachineProviderStatus,

    store: Arc<dyn MachineStore>,
}

impl MachineScope {
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Mutable access to the machine object. Metadata and spec changes are
    /// written on close.
    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn key(&self) -> MachineKey {
        self.machine.key()
    }

    /// Commit metadata, spec and status changes to the resource store.
    ///
    /// Writes are skipped for parts that did not change. A write that races
    /// with another writer is replayed once onto the latest stored object.
    pub async fn close(self) -> Result<(), ScopeError> {
        let Self {
            mut machine,
            original,
            provider_status,
            original_status,
            store,
            ..
        } = self;
        let key = machine.key();

        if machine.metadata != original.metadata || machine.spec != original.spec {
            debug!(machine = %key, "Writing machine metadata");
            let stored = write_rebasing(store.as_ref(), Part::Object, &machine, |latest| {
                merge_changes(
                    &mut latest.metadata.annotations,
                    &original.metadata.annotations,
                    &machine.metadata.annotations,
                );
                merge_changes(
                    &mut latest.metadata.labels,
                    &original.metadata.labels,
                    &machine.metadata.labels,
                );
                if machine.spec != original.spec {
                    latest.spec = machine.spec.clone();
                }
            })
            .await
            .map_err(|error| ScopeError::Commit {
                machine: key.clone(),
                error,
            })?;
            machine.metadata.resource_version = stored.metadata.resource_version;
        }

        if provider_status != original_status {
            debug!(machine = %key, "Writing machine status");
            machine.status.provider_status =
                provider_status
                    .encode()
                    .map_err(|error| ScopeError::EncodeStatus {
                        machine: key.clone(),
                        error,
                    })?;
            machine.status.last_updated = Some(Utc::now());

            let status = machine.status.clone();
            write_rebasing(store.as_ref(), Part::Status, &machine, |latest| {
                latest.status = status.clone();
            })
            .await
            .map_err(|error| ScopeError::Commit {
                machine: key,
                error,
            })?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Part {
    Object,
    Status,
}

async fn write(
    store: &dyn MachineStore,
    part: Part,
    machine: &Machine,
) -> Result<Machine, StoreError> {
    match part {
        Part::Object => store.update_machine(machine).await,
        Part::Status => store.update_machine_status(machine).await,
    }
}

/// Write `machine`. On a version conflict, re-read the stored object, apply
/// `rebase` to it and write once more.
async fn write_rebasing(
    store: &dyn MachineStore,
    part: Part,
    machine: &Machine,
    rebase: impl Fn(&mut Machine),
) -> Result<Machine, StoreError> {
    match write(store, part, machine).await {
        Err(StoreError::Conflict { key, .. }) => {
            debug!(machine = %key, ?part, "Write conflicted, replaying onto latest object");
            let mut latest = store
                .get_machine(&key.namespace, &key.name)
                .await?
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            rebase(&mut latest);
            write(store, part, &latest).await
        }
        result => result,
    }
}

/// Apply the entries changed between `before` and `after` to `target`.
fn merge_changes(
    target: &mut BTreeMap<String, String>,
    before: &BTreeMap<String, String>,
    after: &BTreeMap<String, String>,
) {
    for (key, value) in after {
        if before.get(key) != Some(value) {
            target.insert(key.clone(), value.clone());
        }
    }
    for key in before.keys() {
        if !after.contains_key(key) {
            target.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryMachineStore;
    use crate::types::InstanceState;

    fn machine() -> Machine {
        let mut m = Machine::default();
        m.metadata.name = "m-0".to_string();
        m.metadata.namespace = "default".to_string();
        m
    }

    #[tokio::test]
    async fn test_close_without_changes_writes_nothing() {
        let store = Arc::new(MemoryMachineStore::new());
        store.insert(machine());
        let factory = ScopeFactory::new(store.clone());

        let scope = factory.machine_scope(&machine(), &Cluster::default()).unwrap();
        scope.close().await.unwrap();

        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_close_commits_status() {
        let store = Arc::new(MemoryMachineStore::new());
        store.insert(machine());
        let factory = ScopeFactory::new(store.clone());

        let mut scope = factory.machine_scope(&machine(), &Cluster::default()).unwrap();
        scope.provider_status.instance_state = Some(InstanceState::Pending);
        scope.close().await.unwrap();

        let stored = store.get(&machine().key()).unwrap();
        let status = decode_status(&stored).unwrap();
        assert_eq!(status.instance_state, Some(InstanceState::Pending));
        assert!(stored.status.last_updated.is_some());
    }

    #[tokio::test]
    async fn test_close_commits_annotations() {
        let store = Arc::new(MemoryMachineStore::new());
        store.insert(machine());
        let factory = ScopeFactory::new(store.clone());

        let mut scope = factory.machine_scope(&machine(), &Cluster::default()).unwrap();
        scope
            .machine_mut()
            .metadata
            .annotations
            .insert("a".to_string(), "b".to_string());
        scope.close().await.unwrap();

        let stored = store.get(&machine().key()).unwrap();
        assert_eq!(stored.metadata.annotations["a"], "b");
    }

    #[tokio::test]
    async fn test_close_replays_onto_newer_object() {
        let store = Arc::new(MemoryMachineStore::new());
        store.insert(machine());
        let factory = ScopeFactory::new(store.clone());
        let stale = machine();

        // Another writer lands first.
        let mut newer = machine();
        newer
            .metadata
            .annotations
            .insert("other".to_string(), "kept".to_string());
        store.update_machine(&newer).await.unwrap();

        let mut scope = factory.machine_scope(&stale, &Cluster::default()).unwrap();
        scope
            .machine_mut()
            .metadata
            .annotations
            .insert("a".to_string(), "b".to_string());
        scope.provider_status.instance_state = Some(InstanceState::Running);
        scope.close().await.unwrap();

        let stored = store.get(&stale.key()).unwrap();
        assert_eq!(stored.metadata.annotations["a"], "b");
        assert_eq!(stored.metadata.annotations["other"], "kept");
        let status = decode_status(&stored).unwrap();
        assert_eq!(status.instance_state, Some(InstanceState::Running));
    }

    #[tokio::test]
    async fn test_close_of_deleted_machine_fails() {
        let store = Arc::new(MemoryMachineStore::new());
        let factory = ScopeFactory::new(store);

        let mut scope = factory.machine_scope(&machine(), &Cluster::default()).unwrap();
        scope.provider_status.instance_state = Some(InstanceState::Running);

        let result = scope.close().await;
        assert!(matches!(
            result,
            Err(ScopeError::Commit {
                error: StoreError::NotFound(_),
                ..
            })
        ));
    }

    #[test]
    fn test_merge_changes_keeps_foreign_entries() {
        let map = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        let mut target = map(&[("foreign", "1"), ("gone", "x"), ("same", "s")]);

        merge_changes(
            &mut target,
            &map(&[("gone", "x"), ("same", "s")]),
            &map(&[("same", "s"), ("new", "n")]),
        );

        assert_eq!(target, map(&[("foreign", "1"), ("new", "n"), ("same", "s")]));
    }

    #[test]
    fn test_bad_provider_spec_fails_scope() {
        let store = Arc::new(MemoryMachineStore::new());
        let factory = ScopeFactory::new(store);

        let mut m = machine();
        m.spec.provider_spec = serde_json::json!({"additionalTags": "oops"});

        let result = factory.machine_scope(&m, &Cluster::default());
        assert!(matches!(result, Err(ScopeError::ProviderConfig { .. })));
    }
}
