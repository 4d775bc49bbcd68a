use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::selector::ClusterSelector;

/// A materialized deployable package produced by the ingester from a
/// [`crate::crd::source::Source`]. One `Bundle` fans out
/// into zero or more per-cluster [`crate::crd::deployment::Deployment`]s
/// via the targeting engine.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "fleet.io",
    version = "v1alpha1",
    kind = "Bundle",
    namespaced,
    status = "BundleStatus",
    shortname = "bd"
)]
#[serde(rename_all = "camelCase")]
pub struct BundleSpec {
    /// Content blob key(s) holding the rendered manifest tree. Usually
    /// one entry; a Helm-backed bundle may reference a values overlay
    /// blob in addition to the chart's own content.
    pub content_keys: Vec<String>,

    /// Root option defaults, deep-merged with each matching target's
    /// `custom` overlay by `fleet-core::merge`.
    #[serde(flatten)]
    pub options: crate::fleet_yaml::BundleOptions,

    /// Declaration-ordered list of selector/customization pairs. The
    /// *first* entry matching a given cluster wins.
    #[serde(default)]
    pub targets: Vec<BundleTarget>,

    /// Admission whitelist. Empty means "no
    /// restriction": every target is eligible.
    #[serde(default)]
    pub target_restrictions: Vec<ClusterSelector>,

    #[serde(default)]
    pub depends_on: Vec<crate::fleet_yaml::BundleDependency>,

    /// Suppresses agent action on this bundle's deployments without
    /// affecting targeting.
    #[serde(default)]
    pub paused: bool,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleTarget {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(flatten)]
    pub selector: ClusterSelector,

    #[serde(default)]
    pub custom: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Number of clusters the targeting engine matched, independent of
    /// readiness.
    #[serde(default)]
    pub desired_ready: i32,

    /// Number of owned deployments currently reporting `Ready=true`.
    #[serde(default)]
    pub ready: i32,

    /// Per-cluster state, ranked by severity for display.
    /// Keyed by cluster name.
    #[serde(default)]
    pub per_cluster_state: BTreeMap<String, PerClusterState>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum PerClusterState {
    /// Variant declaration order is severity order: `Ready`
    /// is least severe, `NotReady` most. Derived `Ord` gives the worst-of
    /// reduction for free.
    Ready,
    WaitApplied,
    ErrApplied,
    NotReady,
}

pub mod condition_types {
    pub const ACCEPTED: &str = "Accepted";
}
