//! The `fleet.yaml` bundle manifest format. A bundle root
//! directory's `fleet.yaml` is parsed into a [`FleetYaml`] by the
//! ingester (`fleet-git`/`fleet-manager::ingest`), which then splits it
//! into a [`crate::crd::bundle::BundleSpec`]'s defaults plus its
//! `targets`/`targetRestrictions` lists.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::selector::ClusterSelector;

/// The full parsed document. Unknown keys are tolerated (not
/// `deny_unknown_fields`) so a newer `fleet.yaml` stays loadable by an
/// older ingester, matching how Kubernetes objects generally tolerate
/// unrecognized fields.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetYaml {
    #[serde(flatten)]
    pub options: BundleOptions,

    #[serde(default)]
    pub targets: Vec<TargetEntry>,

    #[serde(default)]
    pub target_restrictions: Vec<ClusterSelector>,

    #[serde(default)]
    pub depends_on: Vec<BundleDependency>,

    #[serde(default)]
    pub paused: bool,
}

/// The mergeable option subtree. A [`crate::crd::bundle::BundleSpec`]
/// holds one of these as its root defaults; each [`TargetEntry`] holds an
/// optional partial one that gets deep-merged over the root.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleOptions {
    #[serde(default)]
    pub default_namespace: Option<String>,

    #[serde(default)]
    pub target_namespace: Option<String>,

    #[serde(default)]
    pub namespace_labels: BTreeMap<String, String>,

    #[serde(default)]
    pub namespace_annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub helm: Option<HelmOptions>,

    #[serde(default)]
    pub kustomize: Option<KustomizeOptions>,

    /// Cron schedule gating when the Deploy handler is allowed to apply
    /// this deployment. Merge-able per target like every other option.
    #[serde(default)]
    pub schedule: Option<crate::crd::deployment::ScheduleSpec>,

    /// Drift-ignore configuration. Deliberately excluded from the
    /// deployment-ID hash — `fleet-core::deployment_id` strips this subtree
    /// before hashing.
    #[serde(default)]
    pub diff: DiffOptions,

    #[serde(default)]
    pub force_sync_generation: i64,

    #[serde(default)]
    pub keep_resources: bool,

    #[serde(default)]
    pub correct_drift: CorrectDriftOptions,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmOptions {
    #[serde(default)]
    pub chart: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub release_name: Option<String>,
    #[serde(default)]
    pub values: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub values_files: Vec<String>,
    #[serde(default)]
    pub values_from: Vec<ValuesFrom>,
    #[serde(default)]
    pub take_ownership: bool,
    #[serde(default)]
    pub atomic: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub wait_for_jobs: bool,
    #[serde(default)]
    pub disable_dns: bool,
    #[serde(default)]
    pub disable_pre_process: bool,
    /// `None` means "no deadline, wait on hooks only".
    #[serde(default)]
    pub timeout_seconds: Option<u32>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuesFrom {
    pub config_map_key_ref: Option<ConfigMapKeyRef>,
    pub secret_key_ref: Option<SecretKeyRef>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapKeyRef {
    pub name: String,
    pub key: String,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KustomizeOptions {
    #[serde(default)]
    pub dir: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffOptions {
    #[serde(default)]
    pub compare_patches: Vec<ComparePatch>,
}

/// One `diff.comparePatches` entry. Matches live objects by
/// exact `name`, `namespace`, or `nameRegex`, then either removes a
/// `jsonPointers` set from the diff comparison or, when `operations` is
/// set, applies arbitrary JSON-patch operations to the *desired* object
/// before comparison.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparePatch {
    pub api_version: String,
    pub kind: String,

    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub name_regex: Option<String>,

    #[serde(default)]
    pub operations: Vec<serde_json::Value>,

    #[serde(default)]
    pub json_pointers: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectDriftOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub force: bool,
}

/// One `targets[]` entry: a selector plus an optional partial
/// [`BundleOptions`] overlay merged over the bundle's root defaults.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetEntry {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(flatten)]
    pub selector: ClusterSelector,

    /// A partial overlay expressed as free-form JSON so the "-" clear
    /// sentinel can be represented at any scalar leaf
    /// without each field needing an `Option<Sentinel<T>>` wrapper.
    /// `fleet-core::merge` interprets this against the root
    /// [`BundleOptions`] serialized the same way.
    #[serde(default)]
    pub custom: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleDependency {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub selector: Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let yaml = "defaultNamespace: my-ns\ntargets:\n  - clusterSelector:\n      matchLabels:\n        env: prod\n";
        let parsed: FleetYaml = serde_yaml::from_str(yaml).expect("valid fleet.yaml");
        assert_eq!(parsed.options.default_namespace.as_deref(), Some("my-ns"));
        assert_eq!(parsed.targets.len(), 1);
    }

    #[test]
    fn tolerates_unknown_fields() {
        let yaml = "defaultNamespace: ns\nsomeFutureField: 42\n";
        let parsed: FleetYaml = serde_yaml::from_str(yaml).expect("unknown fields are ignored");
        assert_eq!(parsed.options.default_namespace.as_deref(), Some("ns"));
    }

    #[test]
    fn helm_options_roundtrip() {
        let yaml = "helm:\n  chart: my-chart\n  atomic: true\n  timeoutSeconds: 300\n";
        let parsed: FleetYaml = serde_yaml::from_str(yaml).expect("valid fleet.yaml");
        let helm = parsed.options.helm.expect("helm block present");
        assert_eq!(helm.chart.as_deref(), Some("my-chart"));
        assert!(helm.atomic);
        assert_eq!(helm.timeout_seconds, Some(300));
    }
}
