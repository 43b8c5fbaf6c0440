//! Reconciliation pass driving the actuator over a cluster's machines.
//!
//! For every machine in the cluster namespace:
//! - deleting machines are handed to `delete`
//! - otherwise `exists` decides between `create` and `update`
//!
//! Failures are counted and logged; one machine never stops the pass.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::actuator::{Actuator, Reconciled};
use crate::scope::{MachineStore, StoreError};
use crate::types::{Cluster, Machine};

/// Outcome counts of one pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileStats {
    pub created: u32,
    pub updated: u32,
    pub deleted: u32,
    pub failed: u32,

    /// Longest requested retry delay, if any machine asked for one.
    pub requeue_after: Option<Duration>,
}

enum Action {
    Created(Reconciled),
    Updated,
    Deleted,
}

pub struct Reconciler {
    actuator: Actuator,
    store: Arc<dyn MachineStore>,
}

impl Reconciler {
    pub fn new(actuator: Actuator, store: Arc<dyn MachineStore>) -> Self {
        Self { actuator, store }
    }

    /// Reconcile every machine of `cluster` once.
    pub async fn reconcile_pass(&self, cluster: &Cluster) -> Result<ReconcileStats, StoreError> {
        let machines = self.store.list_machines(cluster.namespace()).await?;
        let mut stats = ReconcileStats::default();

        for machine in machines {
            match self.reconcile_machine(cluster, &machine).await {
                Ok(Action::Created(Reconciled::Done)) => stats.created += 1,
                Ok(Action::Created(Reconciled::RequeueAfter(after))) => {
                    stats.requeue_after = Some(stats.requeue_after.map_or(after, |d| d.max(after)));
                }
                Ok(Action::Updated) => stats.updated += 1,
                Ok(Action::Deleted) => stats.deleted += 1,
                Err(e) => {
                    warn!(error = %e, "Failed to reconcile machine");
                    stats.failed += 1;
                }
            }
        }

        info!(
            created = stats.created,
            updated = stats.updated,
            deleted = stats.deleted,
            failed = stats.failed,
            "Reconciliation pass complete"
        );
        Ok(stats)
    }

    async fn reconcile_machine(
        &self,
        cluster: &Cluster,
        machine: &Machine,
    ) -> anyhow::Result<Action> {
        if machine.is_deleting() {
            self.actuator.delete(cluster, machine).await?;
            return Ok(Action::Deleted);
        }

        let existence = self.actuator.exists(cluster, machine).await?;
        if let Some(err) = existence.registration_error() {
            warn!(error = %err, "Machine exists but load balancer registration failed");
        }

        // The existence check may have committed a status refresh.
        let machine = self
            .store
            .get_machine(machine.namespace(), machine.name())
            .await?
            .ok_or_else(|| StoreError::NotFound(machine.key()))?;
        if existence.exists() {
            self.actuator.update(cluster, &machine).await?;
            Ok(Action::Updated)
        } else {
            Ok(Action::Created(self.actuator.create(cluster, &machine).await?))
        }
    }
}
