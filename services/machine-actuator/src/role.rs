//! Node-role classification: join an existing control plane or bootstrap
//! a new one.

use thiserror::Error;
use tracing::{debug, error};

use crate::compute::{machine_exists, ComputeError, ComputeService};
use crate::scope::{decode_status, ScopeError};
use crate::types::{Machine, MachineKey, NodeRole, UnrecognizedRole};

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("machine {machine}: {error}")]
    UnrecognizedRole {
        machine: MachineKey,
        error: UnrecognizedRole,
    },

    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error("failed to verify existence of machine {machine}: {error}")]
    Existence {
        machine: MachineKey,
        error: ComputeError,
    },
}

/// Control-plane machines in `machines`, excluding `candidate` itself.
pub fn control_plane_peers<'a>(machines: &'a [Machine], candidate: &Machine) -> Vec<&'a Machine> {
    machines
        .iter()
        .filter(|m| m.is_control_plane() && !m.same_identity(candidate))
        .collect()
}

/// Decide whether `candidate` joins an existing cluster.
///
/// Workers always join. A control-plane machine joins when at least one
/// peer control-plane instance exists; the search stops at the first one
/// found. Any lookup failure fails the whole classification.
pub async fn should_join(
    compute: &dyn ComputeService,
    control_plane: &[&Machine],
    candidate: &Machine,
) -> Result<bool, ClassifyError> {
    let role = candidate.role().map_err(|error| {
        error!(machine = candidate.name(), label = ?error.label, "Unrecognized machine role");
        ClassifyError::UnrecognizedRole {
            machine: candidate.key(),
            error,
        }
    })?;

    match role {
        NodeRole::Node => Ok(true),
        NodeRole::ControlPlane => {
            let mut exists = false;
            for peer in control_plane {
                let status = decode_status(peer)?;
                exists = machine_exists(compute, &status).await.map_err(|error| {
                    ClassifyError::Existence {
                        machine: peer.key(),
                        error,
                    }
                })?;
                if exists {
                    break;
                }
            }

            debug!(
                machine = candidate.name(),
                join = exists,
                "Machine should join the control plane"
            );
            Ok(exists)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCompute;
    use crate::types::{InstanceState, MachineProviderStatus, ROLE_LABEL};

    fn machine(name: &str, role: Option<&str>) -> Machine {
        let mut m = Machine::default();
        m.metadata.name = name.to_string();
        m.metadata.namespace = "default".to_string();
        if let Some(role) = role {
            m.metadata
                .labels
                .insert(ROLE_LABEL.to_string(), role.to_string());
        }
        m
    }

    fn with_instance(compute: &MemoryCompute, mut m: Machine, state: InstanceState) -> Machine {
        let instance = compute.seed_instance(&m, state);
        m.status.provider_status = MachineProviderStatus {
            instance_id: Some(instance.id),
            instance_state: Some(state),
        }
        .encode()
        .unwrap();
        m
    }

    #[test]
    fn test_control_plane_peers_excludes_candidate_and_workers() {
        let machines = vec![
            machine("cp-0", Some("controlplane")),
            machine("cp-1", Some("controlplane")),
            machine("w-0", Some("node")),
        ];
        let candidate = machine("cp-1", Some("controlplane"));

        let peers = control_plane_peers(&machines, &candidate);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name(), "cp-0");
    }

    #[tokio::test]
    async fn test_worker_always_joins() {
        let compute = MemoryCompute::new();
        let join = should_join(&compute, &[], &machine("w-0", Some("node")))
            .await
            .unwrap();

        assert!(join);
        assert_eq!(compute.describe_calls(), 0);
    }

    #[tokio::test]
    async fn test_first_control_plane_initializes() {
        let compute = MemoryCompute::new();
        let peer = machine("cp-0", Some("controlplane"));

        let join = should_join(&compute, &[&peer], &machine("cp-1", Some("controlplane")))
            .await
            .unwrap();

        assert!(!join);
    }

    #[tokio::test]
    async fn test_terminated_peer_does_not_count() {
        let compute = MemoryCompute::new();
        let peer = with_instance(
            &compute,
            machine("cp-0", Some("controlplane")),
            InstanceState::Terminated,
        );

        let join = should_join(&compute, &[&peer], &machine("cp-1", Some("controlplane")))
            .await
            .unwrap();

        assert!(!join);
    }

    #[tokio::test]
    async fn test_search_stops_at_first_existing_peer() {
        let compute = MemoryCompute::new();
        let first = with_instance(
            &compute,
            machine("cp-0", Some("controlplane")),
            InstanceState::Running,
        );
        let second = with_instance(
            &compute,
            machine("cp-1", Some("controlplane")),
            InstanceState::Running,
        );

        let join = should_join(
            &compute,
            &[&first, &second],
            &machine("cp-2", Some("controlplane")),
        )
        .await
        .unwrap();

        assert!(join);
        assert_eq!(compute.describe_calls(), 1);
    }

    #[tokio::test]
    async fn test_lookup_failure_aborts() {
        let compute = MemoryCompute::new();
        let peer = with_instance(
            &compute,
            machine("cp-0", Some("controlplane")),
            InstanceState::Running,
        );
        compute.fail_describe(true);

        let result = should_join(&compute, &[&peer], &machine("cp-1", Some("controlplane"))).await;
        assert!(matches!(result, Err(ClassifyError::Existence { .. })));
    }

    #[tokio::test]
    async fn test_corrupt_peer_status_aborts() {
        let compute = MemoryCompute::new();
        let mut peer = machine("cp-0", Some("controlplane"));
        peer.status.provider_status = serde_json::json!({"instanceId": 42});

        let result = should_join(&compute, &[&peer], &machine("cp-1", Some("controlplane"))).await;
        assert!(matches!(result, Err(ClassifyError::Scope(_))));
    }

    #[tokio::test]
    async fn test_unrecognized_role() {
        let compute = MemoryCompute::new();

        for label in [Some("foo"), Some(""), None] {
            let result = should_join(&compute, &[], &machine("m-0", label)).await;
            assert!(matches!(result, Err(ClassifyError::UnrecognizedRole { .. })));
        }
    }
}
