use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The per-cluster materialization of a [`crate::crd::bundle::Bundle`].
/// Created by the targeting engine in the owning cluster's assigned
/// namespace; `spec` is mutated only by the management plane, `status`
/// only by the owning agent.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "fleet.io",
    version = "v1alpha1",
    kind = "Deployment",
    namespaced,
    status = "DeploymentStatus",
    shortname = "dep"
)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    pub bundle_name: String,
    pub bundle_namespace: String,

    /// Content blob key(s), carried forward from the owning bundle at
    /// the time targeting last ran.
    pub content_keys: Vec<String>,

    /// This target's fully merged options (bundle defaults deep-merged
    /// with the matching target's `custom` overlay). `options.schedule` is
    /// the single source of truth for this deployment's cron schedule —
    /// there is no separate top-level `schedule` field, to avoid the same
    /// key appearing twice in the serialized spec.
    #[serde(flatten)]
    pub options: crate::fleet_yaml::BundleOptions,

    /// Deterministic hash of (content, merged options minus `diff`
    /// subtree). Changing this is what triggers a redeploy.
    pub deployment_id: String,

    #[serde(default)]
    pub paused: bool,

    #[serde(default)]
    pub depends_on: Vec<crate::fleet_yaml::BundleDependency>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
    /// Standard 5-field cron expression.
    pub cron: String,

    /// Duration string (e.g. `"1h"`) parsed with `humantime`. The window
    /// after a cron fire-time during which the deployment may still be
    /// applied; past it, the fire is skipped.
    pub window: String,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    #[serde(default)]
    pub applied_deployment_id: Option<String>,

    /// Helm release name/revision actually installed.
    #[serde(default)]
    pub release: Option<String>,

    /// Set when a `schedule` is pending; cleared once deployed or once
    /// the window has been missed on reconnect.
    #[serde(default)]
    pub scheduled_at_epoch_seconds: Option<i64>,

    #[serde(default)]
    pub ready: bool,

    /// True iff the last Monitor pass found drift (live state differs
    /// from the desired plan) — the complement of `ready` in practice,
    /// but tracked separately since a deployment can be not-ready for
    /// reasons other than drift (e.g. install failure).
    #[serde(default)]
    pub modified: bool,

    /// First [`crate::NON_READY_STATUS_LIMIT`] non-ready resources,
    /// `kind/namespace/name: message`.
    #[serde(default)]
    pub non_ready_status: Vec<String>,

    /// First [`crate::NON_READY_STATUS_LIMIT`] drifted resources.
    #[serde(default)]
    pub modified_status: Vec<String>,

    /// Names of `dependsOn` entries not yet satisfied.
    #[serde(default)]
    pub unmet_dependencies: Vec<String>,

    /// `spec.forceSyncGeneration` as of the last successful install.
    /// Monitor compares this against the live spec value to detect a
    /// user bumping it deliberately to force a redeploy even when
    /// nothing else changed.
    #[serde(default)]
    pub applied_force_sync_generation: i64,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Condition type names on `Deployment.status.conditions`.
pub mod condition_types {
    pub const INSTALLED: &str = "Installed";
    pub const READY: &str = "Ready";
    pub const BUNDLE_SCHEDULED: &str = "BundleScheduled";
    pub const DEPLOYED: &str = "Deployed";
}

/// The "first 10" truncation cap for non-ready/drifted resource
/// lists, named as a constant rather than left as a magic number.
pub const NON_READY_STATUS_LIMIT: usize = 10;
