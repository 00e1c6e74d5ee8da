//! Serialization of the active cluster set into the service config
//! consumed by the cluster-manager load balancer.

use serde_json::{json, Map, Value};

/// Child id prefix for plain CDS clusters.
pub(crate) const CLUSTER_PREFIX: &str = "cluster:";

/// Child id prefix for cluster specifier plugins.
pub(crate) const CLUSTER_SPECIFIER_PLUGIN_PREFIX: &str = "cluster_specifier_plugin:";

pub(crate) fn cluster_id(name: &str) -> String {
    format!("{CLUSTER_PREFIX}{name}")
}

pub(crate) fn cluster_specifier_plugin_id(name: &str) -> String {
    format!("{CLUSTER_SPECIFIER_PLUGIN_PREFIX}{name}")
}

/// Child LB policy for a plain CDS cluster.
pub(crate) fn cds_child_policy(cluster: &str) -> Value {
    json!([{ "cds_experimental": { "cluster": cluster } }])
}

/// Builds the JSON service config for the given `(id, child policy)` pairs.
///
/// The children map is keyed in sorted id order and serialization is
/// deterministic, so equal cluster sets produce byte-identical documents.
/// An empty set yields the literal `{}`.
pub(crate) fn build(children: &[(String, Value)]) -> String {
    if children.is_empty() {
        return "{}".to_string();
    }
    let mut map = Map::new();
    for (id, child_policy) in children {
        map.insert(id.clone(), json!({ "childPolicy": child_policy }));
    }
    json!({
        "loadBalancingConfig": [
            { "xds_cluster_manager_experimental": { "children": map } }
        ]
    })
    .to_string()
}
