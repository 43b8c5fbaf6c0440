//! Reconciliation primitives.
//!
//! This library provides helpers for reconciling live cloud resources
//! against declarative machine configuration. Key concepts:
//!
//! - **Desired state**: What the machine configuration asks for.
//! - **Live state**: What the provider reports for the instance.
//! - **Drift**: The add/remove operations that take live to desired.
//!
//! # Invariants
//!
//! - Diffs are deterministic given the same inputs (ordered collections)
//! - A diff computed against already-converged state is empty

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Symmetric difference between a desired and a live set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDiff<T: Ord> {
    /// Present in desired, missing from live.
    pub to_add: BTreeSet<T>,

    /// Present in live, not desired.
    pub to_remove: BTreeSet<T>,
}

impl<T: Ord + Clone> SetDiff<T> {
    /// Compute the operations that take `live` to `desired`.
    pub fn compute(desired: &BTreeSet<T>, live: &BTreeSet<T>) -> Self {
        Self {
            to_add: desired.difference(live).cloned().collect(),
            to_remove: live.difference(desired).cloned().collect(),
        }
    }

    /// Returns true if no operation is needed.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Tag map keyed by tag name.
pub type Tags = BTreeMap<String, String>;

/// Tag drift between desired and live tags.
///
/// Deletion candidates are limited to keys recorded as previously applied;
/// tags that some other party owns on the instance are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDiff {
    /// Tags to create or overwrite.
    pub to_upsert: Tags,

    /// Tags to delete (with their live values).
    pub to_delete: Tags,
}

impl TagDiff {
    /// Compute tag drift.
    ///
    /// - `desired`: tags the configuration asks for.
    /// - `live`: tags currently on the resource.
    /// - `previously_applied`: tags applied by an earlier reconciliation.
    pub fn compute(desired: &Tags, live: &Tags, previously_applied: &Tags) -> Self {
        let to_upsert = desired
            .iter()
            .filter(|(key, value)| live.get(*key) != Some(*value))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let to_delete = previously_applied
            .keys()
            .filter(|key| !desired.contains_key(*key))
            .filter_map(|key| live.get(key).map(|v| (key.clone(), v.clone())))
            .collect();

        Self {
            to_upsert,
            to_delete,
        }
    }

    /// Returns true if no operation is needed.
    pub fn is_empty(&self) -> bool {
        self.to_upsert.is_empty() && self.to_delete.is_empty()
    }
}

/// Backoff returned when a dependency is not ready yet.
pub const DEFAULT_REQUEUE_AFTER: Duration = Duration::from_secs(60);

/// Lifetime of bootstrap tokens issued for joining nodes.
pub const BOOTSTRAP_TOKEN_TTL: Duration = Duration::from_secs(10 * 60); // 10 minutes
