//! capx Machine Actuator Library
//!
//! The machine actuator converges cloud instances to declarative machine
//! resources. The machine controller invokes it once per lifecycle verb
//! (create, delete, update, exists) and it decides which provider calls
//! are needed, tolerating partial state left by earlier attempts.
//!
//! ## Architecture
//!
//! ```text
//! Actuator
//! ├── ScopeFactory        (per-verb MachineScope, commit on close)
//! ├── role                (join vs. new control plane)
//! ├── TokenIssuer         (bootstrap tokens for joining nodes)
//! ├── ComputeService      (instances, security groups, tags)
//! └── LoadBalancerService (API server registration)
//! ```
//!
//! ## Modules
//!
//! - `actuator`: Verb orchestration and outcome mapping
//! - `compute`: Compute interface, existence and drift rules
//! - `memory`: In-memory collaborators for tests and local runs
//! - `scope`: Resource store interface and the per-verb scope

pub mod actuator;
pub mod attachment;
pub mod compute;
pub mod endpoints;
pub mod error;
pub mod memory;
pub mod role;
pub mod scope;
pub mod tokens;
pub mod types;

// Modules backing the binary
pub mod config;
pub mod manifest;
pub mod reconciler;

// Re-export commonly used types
pub use actuator::{Actuator, ActuatorParams, Existence, Reconciled};
pub use error::{ActuatorError, ErrorKind, Verb};
pub use scope::{MachineScope, MachineStore, ScopeFactory};
pub use types::{Cluster, Instance, InstanceState, Machine, NodeRole};
