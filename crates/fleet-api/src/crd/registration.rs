use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// An ephemeral join request created by a bootstrapping agent. Lives in the shared registration namespace, not the cluster's
/// own assigned namespace (which doesn't exist yet when this is
/// created). Deleted after at most ~12h by a background sweep
/// (`fleet-manager::registration::sweep`).
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "fleet.io",
    version = "v1alpha1",
    kind = "Registration",
    namespaced,
    status = "RegistrationStatus",
    shortname = "reg"
)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationSpec {
    /// Stable identity presented by the agent. Hashed to form the
    /// matching `Cluster` object's name.
    pub client_id: String,

    /// A random nonce minted fresh by the agent on every bootstrap
    /// attempt, used to namespace the resulting secret
    /// (`c-<clientID>-<clientRandom>`) so concurrent bootstrap attempts
    /// for the same client don't collide.
    pub client_random: String,

    /// Labels the agent requests be applied to its `Cluster` object on
    /// first creation. Ignored on subsequent registrations of an
    /// already-existing cluster (labels are then owner-managed).
    #[serde(default)]
    pub requested_labels: std::collections::BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationStatus {
    /// Flipped true once the registration controller has finished
    /// the bootstrap handshake and written the kubeconfig secret. The
    /// agent's bootstrap poll watches for this (indirectly, via the
    /// secret's appearance) rather than polling this flag directly, but
    /// it is kept for observability and for the supersession test.
    #[serde(default)]
    pub granted: bool,
}
