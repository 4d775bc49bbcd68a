use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A registered downstream cluster.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "fleet.io",
    version = "v1alpha1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus",
    shortname = "cl"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Stable identity presented by the agent during registration.
    /// Immutable after creation.
    pub client_id: String,

    /// Labels used for targeting, distinct from `metadata.labels` so
    /// that a relabel doesn't require recreating the object (mirrors
    /// upstream Fleet's split between k8s labels and cluster labels).
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Per-cluster namespace assigned at registration. Empty until the namespace-assignment controller has run.
    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub agent: Option<ClusterAgentStatus>,

    /// Aggregated deployment counts, written by the status aggregator,
    /// not the owning agent.
    #[serde(default)]
    pub summary: ClusterDeploymentSummary,
}

/// Liveness/capacity snapshot written by the agent's status ticker.
/// Only the agent writes this sub-struct; the patch is skipped
/// entirely when it would be a no-op.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAgentStatus {
    pub last_seen_epoch_seconds: i64,
    pub agent_namespace: String,
    pub node_count: u32,
    pub cpu_millis_capacity: u64,
    pub memory_bytes_capacity: u64,
    pub pod_count: u32,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDeploymentSummary {
    #[serde(default)]
    pub desired_ready: i32,
    #[serde(default)]
    pub ready: i32,
}
