//! Machine actuator.
//!
//! The actuator is invoked by the machine controller once per lifecycle
//! verb:
//! - `create`: classify the node role, obtain a join token when needed,
//!   create-or-get the instance, record it and register control-plane
//!   instances with the API load balancer
//! - `delete`: terminate the recorded instance unless it is already gone
//!   or going
//! - `update`: correct security group and tag drift on the live instance
//! - `exists`: report whether a usable instance backs the machine
//!
//! Each verb opens exactly one [`MachineScope`] and closes it on every exit
//! path, so status recorded before a failure is still committed.

use std::sync::Arc;
use std::time::Duration;

use capx_reconcile::{BOOTSTRAP_TOKEN_TTL, DEFAULT_REQUEUE_AFTER};
use tracing::{debug, info, instrument, warn};

use crate::attachment::{reconcile_lb_attachment, LoadBalancerService};
use crate::compute::{ensure_security_groups, ensure_tags, ComputeService};
use crate::endpoints::ClusterEndpoints;
use crate::error::{ActuatorError, ActuatorResult, ErrorKind, Verb, VerbContext};
use crate::role::{control_plane_peers, should_join, ClassifyError};
use crate::scope::{MachineScope, ScopeFactory};
use crate::tokens::TokenIssuer;
use crate::types::{Cluster, Instance, Machine, PROVISIONED_ANNOTATION};

/// Outcome of a create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// The machine is backed by an instance.
    Done,

    /// A dependency is not ready; invoke create again after the delay.
    RequeueAfter(Duration),
}

/// Outcome of an existence check.
#[derive(Debug)]
pub enum Existence {
    /// No usable instance backs the machine.
    Absent,

    /// A pending or running instance backs the machine.
    Present,

    /// The instance is present but could not be registered with the API
    /// load balancer.
    Unregistered(ActuatorError),
}

impl Existence {
    pub fn exists(&self) -> bool {
        match self {
            Self::Absent => false,
            Self::Present | Self::Unregistered(_) => true,
        }
    }

    pub fn registration_error(&self) -> Option<&ActuatorError> {
        match self {
            Self::Unregistered(err) => Some(err),
            Self::Absent | Self::Present => None,
        }
    }
}

/// Collaborators the actuator is built from.
pub struct ActuatorParams {
    pub scopes: ScopeFactory,
    pub compute: Arc<dyn ComputeService>,
    pub load_balancer: Arc<dyn LoadBalancerService>,
    pub endpoints: Arc<dyn ClusterEndpoints>,
    pub tokens: Arc<dyn TokenIssuer>,
}

/// Converges cloud instances to machine resources.
pub struct Actuator {
    scopes: ScopeFactory,
    compute: Arc<dyn ComputeService>,
    load_balancer: Arc<dyn LoadBalancerService>,
    endpoints: Arc<dyn ClusterEndpoints>,
    tokens: Arc<dyn TokenIssuer>,
}

impl Actuator {
    pub fn new(params: ActuatorParams) -> Self {
        Self {
            scopes: params.scopes,
            compute: params.compute,
            load_balancer: params.load_balancer,
            endpoints: params.endpoints,
            tokens: params.tokens,
        }
    }

    /// Create the instance backing `machine`.
    #[instrument(skip_all, fields(machine = %machine.key(), cluster = %cluster.name()))]
    pub async fn create(&self, cluster: &Cluster, machine: &Machine) -> ActuatorResult<Reconciled> {
        info!("Creating machine");
        let ctx = VerbContext::new(Verb::Create, machine, cluster);

        let mut scope = self.open(&ctx, machine, cluster)?;
        let result = self.create_in_scope(&ctx, &mut scope).await;
        commit(&ctx, scope, result).await
    }

    async fn create_in_scope(
        &self,
        ctx: &VerbContext,
        scope: &mut MachineScope,
    ) -> ActuatorResult<Reconciled> {
        let cluster = scope.cluster().clone();

        let endpoint = self
            .endpoints
            .control_plane_endpoint(&cluster)
            .await
            .map_err(|e| ctx.error(ErrorKind::ControlPlaneEndpoint(e)))?;

        let machines = self
            .scopes
            .store()
            .list_machines(cluster.namespace())
            .await
            .map_err(|e| ctx.error(ErrorKind::ListMachines(e)))?;
        let peers = control_plane_peers(&machines, scope.machine());
        let join = should_join(self.compute.as_ref(), &peers, scope.machine())
            .await
            .map_err(|e| ctx.error(ErrorKind::Classify(e)))?;

        // Launch consumes the kubeconfig too, so it is fetched even when no
        // token is issued.
        let kubeconfig = self
            .endpoints
            .kubeconfig(&cluster)
            .await
            .map_err(|e| ctx.error(ErrorKind::Kubeconfig(e)))?;

        let token = if join {
            let token = self
                .tokens
                .issue(&endpoint, &kubeconfig, BOOTSTRAP_TOKEN_TTL)
                .await
                .map_err(|e| ctx.error(ErrorKind::BootstrapToken(e)))?;
            Some(token)
        } else {
            None
        };

        let instance = match self
            .compute
            .create_or_get_instance(scope, token.as_ref(), &kubeconfig)
            .await
        {
            Ok(instance) => instance,
            Err(e) if e.is_dependency_not_ready() => {
                warn!(error = %e, "Network not ready to launch instances yet");
                return Ok(Reconciled::RequeueAfter(DEFAULT_REQUEUE_AFTER));
            }
            Err(e) => return Err(ctx.error(ErrorKind::Provision(e))),
        };

        info!(
            instance_id = %instance.id,
            state = %instance.state,
            join,
            "Machine is backed by instance"
        );
        scope.provider_status.instance_id = Some(instance.id.clone());
        scope.provider_status.instance_state = Some(instance.state);
        scope
            .machine_mut()
            .metadata
            .annotations
            .insert(PROVISIONED_ANNOTATION.to_string(), "true".to_string());

        self.attach(ctx, scope, &instance).await?;
        Ok(Reconciled::Done)
    }

    /// Terminate the instance backing `machine`.
    #[instrument(skip_all, fields(machine = %machine.key(), cluster = %cluster.name()))]
    pub async fn delete(&self, cluster: &Cluster, machine: &Machine) -> ActuatorResult<()> {
        info!("Deleting machine");
        let ctx = VerbContext::new(Verb::Delete, machine, cluster);

        let mut scope = self.open(&ctx, machine, cluster)?;
        let result = self.delete_in_scope(&ctx, &mut scope).await;
        commit(&ctx, scope, result).await
    }

    async fn delete_in_scope(
        &self,
        ctx: &VerbContext,
        scope: &mut MachineScope,
    ) -> ActuatorResult<()> {
        let Some(instance) = self.live_instance(ctx, scope).await? else {
            info!("Instance does not exist, nothing to delete");
            return Ok(());
        };

        // Based on the provider's instance lifecycle: once shutting down,
        // termination is already under way.
        if instance.state.is_terminating() {
            info!(
                instance_id = %instance.id,
                state = %instance.state,
                "Instance is shutting down or already terminated"
            );
            return Ok(());
        }

        self.compute
            .terminate_instance(&instance.id)
            .await
            .map_err(|error| {
                ctx.error(ErrorKind::Terminate {
                    instance_id: instance.id.clone(),
                    error,
                })
            })?;

        info!(instance_id = %instance.id, "Shutdown signal was sent");
        Ok(())
    }

    /// Correct drift between the machine configuration and its instance.
    #[instrument(skip_all, fields(machine = %machine.key(), cluster = %cluster.name()))]
    pub async fn update(&self, cluster: &Cluster, machine: &Machine) -> ActuatorResult<()> {
        info!("Updating machine");
        let ctx = VerbContext::new(Verb::Update, machine, cluster);

        let mut scope = self.open(&ctx, machine, cluster)?;
        let result = self.update_in_scope(&ctx, &mut scope).await;
        commit(&ctx, scope, result).await
    }

    async fn update_in_scope(
        &self,
        ctx: &VerbContext,
        scope: &mut MachineScope,
    ) -> ActuatorResult<()> {
        let instance = self
            .live_instance(ctx, scope)
            .await?
            .ok_or_else(|| ctx.error(ErrorKind::InstanceNotFound))?;

        // Immutable fields (image, instance type, subnet) are not compared
        // against the live instance; changing them has no effect.

        // Tags are corrected even when the security groups cannot be.
        let groups = match scope.machine().role() {
            Ok(role) => ensure_security_groups(self.compute.as_ref(), scope, role, &instance)
                .await
                .map(drop)
                .map_err(|error| ErrorKind::SecurityGroups {
                    instance_id: instance.id.clone(),
                    error,
                }),
            Err(error) => {
                warn!(label = ?error.label, "Unrecognized machine role, skipping security groups");
                Err(ErrorKind::Classify(ClassifyError::UnrecognizedRole {
                    machine: scope.key(),
                    error,
                }))
            }
        };

        let tags = ensure_tags(self.compute.as_ref(), scope, &instance)
            .await
            .map(drop)
            .map_err(|error| ErrorKind::Tags {
                instance_id: instance.id.clone(),
                error,
            });

        groups.and(tags).map_err(|kind| ctx.error(kind))
    }

    /// Check whether a usable instance backs `machine`.
    ///
    /// For control-plane machines a present instance is also registered
    /// with the API load balancer; a registration failure is reported via
    /// [`Existence::Unregistered`] without denying existence.
    #[instrument(skip_all, fields(machine = %machine.key(), cluster = %cluster.name()))]
    pub async fn exists(&self, cluster: &Cluster, machine: &Machine) -> ActuatorResult<Existence> {
        debug!("Checking if machine exists");
        let ctx = VerbContext::new(Verb::Exists, machine, cluster);

        let mut scope = self.open(&ctx, machine, cluster)?;
        let result = self.exists_in_scope(&ctx, &mut scope).await;
        commit(&ctx, scope, result).await
    }

    async fn exists_in_scope(
        &self,
        ctx: &VerbContext,
        scope: &mut MachineScope,
    ) -> ActuatorResult<Existence> {
        let Some(instance) = self.live_instance(ctx, scope).await? else {
            return Ok(Existence::Absent);
        };

        if !instance.state.is_present() {
            debug!(instance_id = %instance.id, state = %instance.state, "Instance is not usable");
            return Ok(Existence::Absent);
        }

        debug!(instance_id = %instance.id, state = %instance.state, "Found instance for machine");
        match self.attach(ctx, scope, &instance).await {
            Ok(()) => Ok(Existence::Present),
            Err(err) => {
                warn!(error = %err, "Instance exists but is not registered with the load balancer");
                Ok(Existence::Unregistered(err))
            }
        }
    }

    fn open(
        &self,
        ctx: &VerbContext,
        machine: &Machine,
        cluster: &Cluster,
    ) -> ActuatorResult<MachineScope> {
        self.scopes
            .machine_scope(machine, cluster)
            .map_err(|e| ctx.error(ErrorKind::Scope(e)))
    }

    /// Look up the instance recorded in the scope and refresh its cached
    /// state. `None` when nothing is recorded or the provider has no such
    /// instance.
    async fn live_instance(
        &self,
        ctx: &VerbContext,
        scope: &mut MachineScope,
    ) -> ActuatorResult<Option<Instance>> {
        let Some(id) = scope.provider_status.instance_id.clone() else {
            return Ok(None);
        };

        let instance = self
            .compute
            .instance_if_exists(&id)
            .await
            .map_err(|error| {
                ctx.error(ErrorKind::Lookup {
                    instance_id: id.clone(),
                    error,
                })
            })?;

        if let Some(instance) = &instance {
            scope.provider_status.instance_state = Some(instance.state);
        }
        Ok(instance)
    }

    async fn attach(
        &self,
        ctx: &VerbContext,
        scope: &MachineScope,
        instance: &Instance,
    ) -> ActuatorResult<()> {
        reconcile_lb_attachment(
            self.load_balancer.as_ref(),
            scope.cluster(),
            scope.machine(),
            instance,
        )
        .await
        .map(|_| ())
        .map_err(|error| {
            ctx.error(ErrorKind::LoadBalancer {
                instance_id: instance.id.clone(),
                error,
            })
        })
    }
}

/// Close the scope and fold the commit result into the verb result. A verb
/// error wins over a commit error.
async fn commit<T>(
    ctx: &VerbContext,
    scope: MachineScope,
    result: ActuatorResult<T>,
) -> ActuatorResult<T> {
    let closed = scope.close().await;
    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(ctx.error(ErrorKind::Commit(e))),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(e)) => {
            warn!(error = %e, "Failed to commit machine after verb error");
            Err(err)
        }
    }
}
