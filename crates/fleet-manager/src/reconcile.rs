//! Turns a [`Bundle`]'s targeting output into live [`Deployment`] objects.
//! `fleet_manager::targeting` computes the *plan*
//! purely; this module does the I/O: listing the current cluster
//! population, upserting one `Deployment` per matched cluster, and
//! deleting any deployment this pass no longer produces.

use std::collections::BTreeMap;

use fleet_api::{Bundle, Cluster, ClusterGroup, Deployment, labels};
use fleet_core::selector::ClusterContext;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, ListParams, Patch, PatchParams},
};
use snafu::{ResultExt, Snafu};

use crate::targeting::{self, DeploymentPlan};

const FIELD_MANAGER: &str = "fleet-manager";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list Clusters"))]
    ListClusters { source: kube::Error },

    #[snafu(display("failed to list ClusterGroups"))]
    ListClusterGroups { source: kube::Error },

    #[snafu(display("failed to compute deployment plan for bundle {bundle}"))]
    Targeting { source: targeting::Error, bundle: String },

    #[snafu(display("failed to upsert Deployment {name} in {namespace}"))]
    Upsert {
        source: kube::Error,
        name: String,
        namespace: String,
    },

    #[snafu(display("failed to list Deployments owned by Bundle {bundle}"))]
    ListOwned { source: kube::Error, bundle: String },

    #[snafu(display("failed to delete stale Deployment {name} in {namespace}"))]
    Delete {
        source: kube::Error,
        name: String,
        namespace: String,
    },
}

impl Error {
    pub fn kind(&self) -> fleet_core::ErrorKind {
        match self {
            Error::Targeting { .. } => fleet_core::ErrorKind::Configuration,
            _ => fleet_core::ErrorKind::Transient,
        }
    }
}

/// A snapshot of the registered cluster population, owned so it can
/// outlive the per-request borrow a [`ClusterContext`] needs.
#[derive(Clone, Debug)]
pub struct ClusterSnapshot {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub groups: Vec<(String, BTreeMap<String, String>)>,
}

/// List every registered `Cluster` plus every `ClusterGroup` and build
/// one [`ClusterSnapshot`] per cluster carrying its group memberships,
/// avoiding back-pointers by resolving membership here at read time.
pub async fn snapshot_clusters(client: &Client, registration_namespace: &str) -> Result<Vec<ClusterSnapshot>, Error> {
    let clusters_api: Api<Cluster> = Api::namespaced(client.clone(), registration_namespace);
    let groups_api: Api<ClusterGroup> = Api::namespaced(client.clone(), registration_namespace);

    let clusters = clusters_api.list(&ListParams::default()).await.context(ListClustersSnafu)?;
    let groups = groups_api.list(&ListParams::default()).await.context(ListClusterGroupsSnafu)?;

    let mut snapshots = Vec::with_capacity(clusters.items.len());
    for cluster in clusters.items {
        let Some(status) = &cluster.status else { continue };
        if status.namespace.is_empty() {
            // Not yet assigned a namespace; not targetable.
            continue;
        }

        let member_groups: Vec<(String, BTreeMap<String, String>)> = groups
            .items
            .iter()
            .filter(|group| fleet_core::selector::label_selector_matches(&group.spec.selector, &cluster.spec.labels))
            .map(|group| (group.name_any(), BTreeMap::new()))
            .collect();

        snapshots.push(ClusterSnapshot {
            name: cluster.name_any(),
            namespace: status.namespace.clone(),
            labels: cluster.spec.labels.clone(),
            groups: member_groups,
        });
    }
    Ok(snapshots)
}

/// Compute and apply one bundle's per-cluster deployments against a
/// previously-gathered cluster snapshot.
#[tracing::instrument(skip(client, bundle, clusters), fields(bundle = %bundle.name_any()))]
pub async fn reconcile_bundle(client: &Client, bundle: &Bundle, clusters: &[ClusterSnapshot]) -> Result<Vec<String>, Error> {
    let bundle_name = bundle.name_any();
    let bundle_namespace = bundle.namespace().unwrap_or_default();

    let contexts: Vec<(ClusterContext<'_>, &str)> = clusters
        .iter()
        .map(|c| {
            (
                ClusterContext {
                    name: &c.name,
                    labels: &c.labels,
                    groups: &c.groups,
                },
                c.namespace.as_str(),
            )
        })
        .collect();

    let plans = targeting::compute_deployments(&bundle_name, &bundle_namespace, &bundle.spec, contexts.iter().map(|(ctx, ns)| (ctx, *ns)))
        .context(TargetingSnafu { bundle: bundle_name.clone() })?;

    let mut applied_cluster_names = Vec::with_capacity(plans.len());
    for plan in &plans {
        upsert_deployment(client, &bundle_name, &bundle_namespace, plan).await?;
        applied_cluster_names.push(plan.cluster_name.clone());
    }

    prune_stale_deployments(client, &bundle_name, &applied_cluster_names).await?;

    Ok(applied_cluster_names)
}

async fn upsert_deployment(client: &Client, bundle_name: &str, bundle_namespace: &str, plan: &DeploymentPlan) -> Result<(), Error> {
    let name = deployment_name(bundle_name, &plan.cluster_name);
    let deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(plan.cluster_namespace.clone()),
            labels: Some(
                [
                    (labels::BUNDLE_NAME.to_owned(), bundle_name.to_owned()),
                    (labels::BUNDLE_NAMESPACE.to_owned(), bundle_namespace.to_owned()),
                    (labels::CLUSTER_NAME.to_owned(), plan.cluster_name.clone()),
                    (labels::MANAGED_BY.to_owned(), labels::MANAGED_BY_VALUE.to_owned()),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: plan.spec.clone(),
        status: None,
    };

    let api: Api<Deployment> = Api::namespaced(client.clone(), &plan.cluster_namespace);
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&deployment))
        .await
        .context(UpsertSnafu {
            name,
            namespace: plan.cluster_namespace.clone(),
        })?;
    Ok(())
}

/// Delete every `Deployment` labeled with `bundle_name` whose cluster is
/// not in `keep_clusters`. Deployments live across every cluster
/// namespace, so this is a cluster-scoped list rather than namespaced.
async fn prune_stale_deployments(client: &Client, bundle_name: &str, keep_clusters: &[String]) -> Result<(), Error> {
    let api: Api<Deployment> = Api::all(client.clone());
    let list_params = ListParams::default().labels(&format!("{}={bundle_name}", labels::BUNDLE_NAME));
    let existing = api.list(&list_params).await.context(ListOwnedSnafu { bundle: bundle_name.to_owned() })?;

    let keep: std::collections::BTreeSet<&str> = keep_clusters.iter().map(String::as_str).collect();
    for deployment in existing.items {
        let cluster = deployment.labels().get(labels::CLUSTER_NAME).map(String::as_str).unwrap_or_default();
        if keep.contains(cluster) {
            continue;
        }
        let name = deployment.name_any();
        let namespace = deployment.namespace().unwrap_or_default();
        let namespaced_api: Api<Deployment> = Api::namespaced(client.clone(), &namespace);
        namespaced_api
            .delete(&name, &DeleteParams::default())
            .await
            .context(DeleteSnafu { name, namespace })?;
    }
    Ok(())
}

/// Derive a stable per-cluster `Deployment` name. Slugified so a cluster
/// name containing characters invalid in a `Deployment`'s own name (there
/// are none today, cluster names are already DNS-1123, but this keeps
/// the derivation in one place rather than assuming that forever) stays
/// a valid object name.
fn deployment_name(bundle_name: &str, cluster_name: &str) -> String {
    format!("{bundle_name}-{cluster_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_name_is_stable() {
        assert_eq!(deployment_name("bundle-a", "cluster-1"), deployment_name("bundle-a", "cluster-1"));
        assert_ne!(deployment_name("bundle-a", "cluster-1"), deployment_name("bundle-a", "cluster-2"));
    }
}
