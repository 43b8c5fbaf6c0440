//! Actuator error types.
//!
//! Every error leaving a verb carries the verb, the machine and the cluster
//! so that a log line is actionable on its own.

use std::fmt;

use capx_id::InstanceId;
use thiserror::Error;

use crate::attachment::LoadBalancerError;
use crate::compute::ComputeError;
use crate::endpoints::EndpointError;
use crate::role::ClassifyError;
use crate::scope::{ScopeError, StoreError};
use crate::tokens::TokenError;
use crate::types::{Cluster, Machine, MachineKey};

/// Result type for actuator verbs.
pub type ActuatorResult<T> = Result<T, ActuatorError>;

/// Lifecycle verb being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Create,
    Delete,
    Update,
    Exists,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Delete => "delete",
            Self::Update => "update",
            Self::Exists => "check existence of",
        })
    }
}

/// A failed verb, with its context.
#[derive(Debug, Error)]
#[error("failed to {verb} machine {machine} in cluster {cluster}: {kind}")]
pub struct ActuatorError {
    pub verb: Verb,
    pub machine: MachineKey,
    pub cluster: String,
    pub kind: ErrorKind,
}

/// What went wrong.
#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("failed to create scope: {0}")]
    Scope(ScopeError),

    #[error("failed to commit machine: {0}")]
    Commit(ScopeError),

    #[error("failed to retrieve control plane endpoint: {0}")]
    ControlPlaneEndpoint(EndpointError),

    #[error("failed to list cluster machines: {0}")]
    ListMachines(StoreError),

    #[error("failed to determine whether machine should join: {0}")]
    Classify(ClassifyError),

    #[error("failed to retrieve kubeconfig: {0}")]
    Kubeconfig(EndpointError),

    #[error("failed to obtain bootstrap token: {0}")]
    BootstrapToken(TokenError),

    #[error("failed to create or get instance: {0}")]
    Provision(ComputeError),

    #[error("failed to look up instance {instance_id}: {error}")]
    Lookup {
        instance_id: InstanceId,
        error: ComputeError,
    },

    #[error("failed to terminate instance {instance_id}: {error}")]
    Terminate {
        instance_id: InstanceId,
        error: ComputeError,
    },

    #[error("no live instance to update")]
    InstanceNotFound,

    #[error("failed to apply security groups to instance {instance_id}: {error}")]
    SecurityGroups {
        instance_id: InstanceId,
        error: ComputeError,
    },

    #[error("failed to ensure tags on instance {instance_id}: {error}")]
    Tags {
        instance_id: InstanceId,
        error: ComputeError,
    },

    #[error("could not register control plane instance {instance_id} with load balancer: {error}")]
    LoadBalancer {
        instance_id: InstanceId,
        error: LoadBalancerError,
    },
}

impl ErrorKind {
    /// Returns true if the failure happened before any provider mutation
    /// was attempted.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Scope(_) | Self::Classify(ClassifyError::UnrecognizedRole { .. })
        )
    }
}

/// Identity attached to errors raised during one verb.
#[derive(Debug, Clone)]
pub(crate) struct VerbContext {
    verb: Verb,
    machine: MachineKey,
    cluster: String,
}

impl VerbContext {
    pub(crate) fn new(verb: Verb, machine: &Machine, cluster: &Cluster) -> Self {
        Self {
            verb,
            machine: machine.key(),
            cluster: cluster.name().to_string(),
        }
    }

    pub(crate) fn error(&self, kind: ErrorKind) -> ActuatorError {
        ActuatorError {
            verb: self.verb,
            machine: self.machine.clone(),
            cluster: self.cluster.clone(),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_carries_context() {
        let mut machine = Machine::default();
        machine.metadata.name = "m-0".to_string();
        machine.metadata.namespace = "default".to_string();
        let mut cluster = Cluster::default();
        cluster.metadata.name = "prod".to_string();

        let err =
            VerbContext::new(Verb::Update, &machine, &cluster).error(ErrorKind::InstanceNotFound);
        assert_eq!(
            err.to_string(),
            "failed to update machine default/m-0 in cluster prod: no live instance to update"
        );
    }

    #[test]
    fn test_cause_is_reported_once() {
        let mut machine = Machine::default();
        machine.metadata.name = "m-0".to_string();
        let cluster = Cluster::default();
        let instance_id: InstanceId = "i-0000000a".parse().unwrap();

        let err = VerbContext::new(Verb::Update, &machine, &cluster).error(ErrorKind::Tags {
            instance_id,
            error: ComputeError::api("create tags", "throttled"),
        });

        let rendered = err.to_string();
        assert_eq!(rendered.matches("throttled").count(), 1);
        assert!(std::error::Error::source(&err).is_none());
    }
}
