//! The namespace-assignment sub-controller (step 2: "Wait
//! until the Cluster has been assigned a per-cluster namespace (a
//! separate controller creates it)"). Split out from [`super::reconcile`]
//! because it runs off `Cluster` events, not `Registration` events: a
//! `Cluster` created directly (outside a fresh registration) still needs
//! a namespace assigned exactly once.

use fleet_api::Cluster;
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client, ResourceExt, api::PostParams};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create namespace {namespace}"))]
    CreateNamespace { source: kube::Error, namespace: String },

    #[snafu(display("failed to check for existing namespace {namespace}"))]
    GetNamespace { source: kube::Error, namespace: String },

    #[snafu(display("failed to patch Cluster {name} status"))]
    StatusPatch { source: kube::Error, name: String },
}

impl Error {
    pub fn kind(&self) -> fleet_core::ErrorKind {
        fleet_core::ErrorKind::Transient
    }
}

/// Derive the per-cluster namespace name from the `Cluster` object's own
/// name. One namespace per cluster, never reused across clusters even if
/// a `Cluster` is deleted and a new one with a colliding client-id hash
/// is (vanishingly unlikely, but the name ties back to the hash rather
/// than an incrementing counter so it stays deterministic).
pub fn agent_namespace_name(cluster_name: &str) -> String {
    format!("fleet-agent-{cluster_name}")
}

/// Assign `cluster` a namespace if it doesn't have one yet: create the
/// namespace (idempotently) and patch `status.namespace`. A no-op if
/// `status.namespace` is already set.
#[tracing::instrument(skip(client, cluster), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(client: &Client, cluster: &Cluster) -> Result<(), Error> {
    if cluster.status.as_ref().is_some_and(|s| !s.namespace.is_empty()) {
        return Ok(());
    }

    let name = cluster.name_any();
    let namespace_name = agent_namespace_name(&name);

    let namespaces: Api<Namespace> = Api::all(client.clone());
    if namespaces
        .get_opt(&namespace_name)
        .await
        .context(GetNamespaceSnafu { namespace: namespace_name.clone() })?
        .is_none()
    {
        let namespace = Namespace {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(namespace_name.clone()),
                labels: Some(
                    [(fleet_api::labels::CLUSTER_NAME.to_owned(), name.clone())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };
        match namespaces.create(&PostParams::default(), &namespace).await {
            Ok(_) => {}
            Err(kube::Error::Api(response)) if response.code == 409 => {}
            Err(source) => {
                return Err(Error::CreateNamespace {
                    source,
                    namespace: namespace_name,
                });
            }
        }
    }

    let clusters: Api<Cluster> = Api::namespaced(client.clone(), &cluster.namespace().unwrap_or_default());
    let patch = serde_json::json!({ "status": { "namespace": namespace_name } });
    clusters
        .patch_status(&name, &kube::api::PatchParams::default(), &kube::api::Patch::Merge(&patch))
        .await
        .context(StatusPatchSnafu { name })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_name_is_derived_from_cluster_name() {
        assert_eq!(agent_namespace_name("c-abc123"), "fleet-agent-c-abc123");
    }
}
