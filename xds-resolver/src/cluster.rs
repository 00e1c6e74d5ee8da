//! Reference-counted tracking of the clusters named by route
//! configurations.
//!
//! The set is an independently-owned table keyed by cluster id; selectors
//! and in-flight RPCs hold opaque handles rather than pointers into it. A
//! cluster stays in the published service config as long as its count is
//! above zero, and an entry that dropped to zero lingers until the next
//! publication has carried it away.

use std::collections::HashMap;

/// An opaque token holding one reference on a cluster id, released exactly
/// once via [`ClusterRefSet::release`].
#[derive(Debug)]
pub(crate) struct ClusterRefHandle {
    id: String,
}

#[derive(Debug)]
struct ClusterState {
    ref_count: u64,
    child_policy: serde_json::Value,
}

/// The multiset of active cluster ids with their child LB policies.
#[derive(Debug, Default)]
pub(crate) struct ClusterRefSet {
    clusters: HashMap<String, ClusterState>,
}

impl ClusterRefSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds one reference on `id`, recording (or refreshing) the child LB
    /// policy the service config will carry for it.
    pub(crate) fn acquire(
        &mut self,
        id: &str,
        child_policy: serde_json::Value,
    ) -> ClusterRefHandle {
        let state = self
            .clusters
            .entry(id.to_string())
            .or_insert_with(|| ClusterState {
                ref_count: 0,
                child_policy: serde_json::Value::Null,
            });
        state.ref_count += 1;
        state.child_policy = child_policy;
        ClusterRefHandle { id: id.to_string() }
    }

    /// Drops the reference held by `handle`. Returns true when the
    /// cluster's count reached zero, meaning the next publication may drop
    /// it.
    pub(crate) fn release(&mut self, handle: ClusterRefHandle) -> bool {
        let Some(state) = self.clusters.get_mut(&handle.id) else {
            debug_assert!(false, "released a handle for untracked cluster {}", handle.id);
            return false;
        };
        state.ref_count = state.ref_count.saturating_sub(1);
        state.ref_count == 0
    }

    /// The active clusters (count > 0) with their child policies, sorted by
    /// id.
    pub(crate) fn snapshot(&self) -> Vec<(String, serde_json::Value)> {
        let mut active: Vec<_> = self
            .clusters
            .iter()
            .filter(|(_, state)| state.ref_count > 0)
            .map(|(id, state)| (id.clone(), state.child_policy.clone()))
            .collect();
        active.sort_by(|a, b| a.0.cmp(&b.0));
        active
    }

    /// Marks a publication: entries whose count is zero have now been
    /// carried away and are pruned.
    pub(crate) fn publish(&mut self) {
        self.clusters.retain(|_, state| state.ref_count > 0);
    }
}
