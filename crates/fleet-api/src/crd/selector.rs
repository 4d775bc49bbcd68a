//! The target/restriction selector tuple shared by [`crate::crd::bundle::BundleSpec`]'s
//! `targets` and `targetRestrictions` lists.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single `(clusterName, clusterSelector, clusterGroup, clusterGroupSelector)`
/// tuple. A cluster is matched by a selector entry if *any* of its
/// populated fields match (clusterName is an exact match against the
/// `Cluster` object's name; the rest are label-selector matches against
/// either the cluster's own labels or the labels of any `ClusterGroup` it
/// belongs to).
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSelector {
    /// Exact match against a `Cluster` object's name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    /// Label selector evaluated against the `Cluster` object's own labels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_selector: Option<LabelSelector>,

    /// Exact match against a `ClusterGroup` object's name; a cluster
    /// matches if it is a member of that group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_group: Option<String>,

    /// Label selector evaluated against `ClusterGroup` labels; a cluster
    /// matches if it is a member of any matching group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_group_selector: Option<LabelSelector>,
}

impl ClusterSelector {
    /// A selector with every field empty matches nothing, which is the
    /// correct behavior for an explicitly-empty target entry (as opposed
    /// to an empty `targets` list, which is handled one level up).
    pub fn is_empty(&self) -> bool {
        self.cluster_name.is_none()
            && self.cluster_selector.is_none()
            && self.cluster_group.is_none()
            && self.cluster_group_selector.is_none()
    }
}
