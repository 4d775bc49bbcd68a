use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A declarative input: either a Git repository or a Helm chart
/// reference. One `Source` object always carries exactly one of the two
/// variants.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "fleet.io",
    version = "v1alpha1",
    kind = "Source",
    namespaced,
    status = "SourceStatus",
    shortname = "src"
)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    #[serde(flatten)]
    pub backend: SourceBackend,
}

/// The tagged union of the two supported backends. `#[serde(tag =
/// "type")]` keeps the on-wire shape an explicit discriminator rather
/// than relying on untagged field-presence sniffing, which would make an
/// accidentally-ambiguous `fleet.yaml`-adjacent document silently pick
/// the wrong variant.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SourceBackend {
    Git(GitSourceSpec),
    Helm(HelmSourceSpec),
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSourceSpec {
    /// HTTPS or SSH clone URL.
    pub repo: String,

    /// A branch name, tag, or exact commit. Mutually exclusive in
    /// practice with a real `polling_interval` driving re-resolution,
    /// but both fields are always present: a pinned commit simply never
    /// changes across polls.
    #[serde(default)]
    pub revision: Option<String>,

    #[serde(default)]
    pub branch: Option<String>,

    /// How often to `ls-remote` for a new commit on `branch`. Ignored if
    /// `revision` pins an exact commit.
    #[serde(default = "default_polling_interval")]
    pub polling_interval_seconds: u32,

    /// Sub-paths within the repository to walk for bundle roots. An
    /// empty list walks the whole tree.
    #[serde(default)]
    pub paths: Vec<String>,

    /// Name of a `Secret` (in this `Source`'s namespace) holding
    /// credentials, per one of the three shapes `fleet_git::CredentialSource` supports.
    #[serde(default)]
    pub credentials_secret: Option<String>,

    /// Clone submodules as well. Defaults to false.
    #[serde(default)]
    pub submodules: bool,
}

fn default_polling_interval() -> u32 {
    60
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmSourceSpec {
    pub repo: String,
    pub chart: String,

    /// Exact version, a semver range, or the literal string `"latest"`.
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub credentials_secret: Option<String>,

    /// `repo` points at an OCI registry rather than a classic chart
    /// repository index.
    #[serde(default)]
    pub oci: bool,
}

fn default_version() -> String {
    "latest".to_owned()
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    /// The most recently observed Git commit or resolved Helm chart
    /// version. Compared against a fresh `ls-remote`/version-resolve on
    /// each poll to short-circuit a no-op ingest.
    #[serde(default)]
    pub commit: Option<String>,

    /// Non-empty while a Git clone/Helm resolve is actively running;
    /// the status aggregator surfaces `GitUpdating` while this is set.
    #[serde(default)]
    pub ingesting: bool,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub desired_ready_clusters: i32,

    #[serde(default)]
    pub ready_clusters: i32,
}

/// Condition type names used on `Source.status.conditions`. Plain
/// constants rather than an enum: Kubernetes conditions are open sets by
/// convention (teacher's own `k8s-openapi` `Condition` keeps `type` as a
/// bare `String` for the same reason).
pub mod condition_types {
    pub const ACCEPTED: &str = "Accepted";
    pub const STALLED: &str = "Stalled";

    /// Written by the status aggregator: reason holds the
    /// display state (`GitUpdating` while a fresh commit is being
    /// ingested, otherwise the worst aggregated bundle state).
    pub const READY: &str = "Ready";
}

/// `condition_types::READY`'s reason while a source is actively cloning
/// or resolving a new revision.
pub const REASON_GIT_UPDATING: &str = "GitUpdating";
