use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A labeled set of clusters for higher-level targeting.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "fleet.io",
    version = "v1alpha1",
    kind = "ClusterGroup",
    namespaced,
    shortname = "cg"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGroupSpec {
    /// Selects member `Cluster` objects by their `spec.labels`.
    pub selector: LabelSelector,
}
