//! The status aggregator: rolls per-deployment state into
//! `Bundle` and `Source` status summaries. Triggered by `Deployment`
//! watch events, but never writes `Deployment` status itself — writes
//! are scoped to the `Bundle`/`Source` status sub-resources only.

use std::collections::BTreeMap;

use fleet_api::{
    Bundle, Deployment, DeploymentStatus, PerClusterState, Source,
    crd::{deployment::condition_types as deployment_condition_types, source},
    labels,
};
use fleet_core::condition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    Api, Client, ResourceExt,
    api::{ListParams, Patch, PatchParams},
};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list Deployments owned by Bundle {bundle}"))]
    ListDeployments { source: kube::Error, bundle: String },

    #[snafu(display("failed to patch Bundle {name} status"))]
    PatchBundle { source: kube::Error, name: String },

    #[snafu(display("failed to list Bundles owned by Source {source}"))]
    ListBundles { source: kube::Error, bundle_source: String },

    #[snafu(display("failed to patch Source {name} status"))]
    PatchSource { source: kube::Error, name: String },
}

impl Error {
    pub fn kind(&self) -> fleet_core::ErrorKind {
        fleet_core::ErrorKind::Transient
    }
}

/// Derive one cluster's severity bucket from its `Deployment` status,
/// ranked `Ready` < `WaitApplied` < `ErrApplied` < `NotReady`.
/// `Deployed=false` means an install was attempted and failed;
/// `Installed=false` or `BundleScheduled=false` means one has not been
/// attempted yet (paused, awaiting schedule, or unmet dependency).
pub fn per_cluster_state(status: &DeploymentStatus) -> PerClusterState {
    if status.ready {
        return PerClusterState::Ready;
    }
    if condition::is_false(&status.conditions, deployment_condition_types::DEPLOYED) {
        return PerClusterState::ErrApplied;
    }
    if condition::is_false(&status.conditions, deployment_condition_types::INSTALLED)
        || condition::is_false(&status.conditions, deployment_condition_types::BUNDLE_SCHEDULED)
    {
        return PerClusterState::WaitApplied;
    }
    PerClusterState::NotReady
}

/// Worst (most severe) state across a set of per-cluster states, or
/// `Ready` if there are none — an empty bundle/source has nothing wrong
/// with it.
fn worst_state(states: impl IntoIterator<Item = PerClusterState>) -> PerClusterState {
    states.into_iter().max().unwrap_or(PerClusterState::Ready)
}

/// Pure computation of a bundle's rolled-up status from its owned
/// deployments.
pub fn compute_bundle_status(deployments: &[Deployment]) -> (i32, i32, BTreeMap<String, PerClusterState>) {
    let desired_ready = deployments.len() as i32;
    let mut ready = 0;
    let mut per_cluster = BTreeMap::new();

    for deployment in deployments {
        let Some(cluster_name) = deployment.labels().get(labels::CLUSTER_NAME).cloned() else {
            continue;
        };
        let status = deployment.status.clone().unwrap_or_default();
        if status.ready {
            ready += 1;
        }
        per_cluster.insert(cluster_name, per_cluster_state(&status));
    }

    (desired_ready, ready, per_cluster)
}

/// List the deployments owned by `bundle`, recompute its status, and
/// patch only the three aggregated fields.
#[tracing::instrument(skip(client, bundle), fields(bundle = %bundle.name_any()))]
pub async fn reconcile_bundle_status(client: &Client, bundle: &Bundle) -> Result<(), Error> {
    let name = bundle.name_any();
    let api: Api<Deployment> = Api::all(client.clone());
    let list_params = ListParams::default().labels(&format!("{}={name}", labels::BUNDLE_NAME));
    let deployments = api.list(&list_params).await.context(ListDeploymentsSnafu { bundle: name.clone() })?;

    let (desired_ready, ready, per_cluster_state) = compute_bundle_status(&deployments.items);

    let bundles: Api<Bundle> = Api::namespaced(client.clone(), &bundle.namespace().unwrap_or_default());
    let patch = serde_json::json!({
        "status": {
            "desiredReady": desired_ready,
            "ready": ready,
            "perClusterState": per_cluster_state,
        }
    });
    bundles
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .context(PatchBundleSnafu { name })?;
    Ok(())
}

/// Aggregate a source's `desiredReadyClusters`/`readyClusters` over its
/// owned bundles, and compute the display-state reason written onto the
/// `Ready` condition.
pub fn compute_source_status(ingesting: bool, bundles: &[Bundle]) -> (i32, i32, String) {
    let desired_ready_clusters: i32 = bundles.iter().filter_map(|b| b.status.as_ref()).map(|s| s.desired_ready).sum();
    let ready_clusters: i32 = bundles.iter().filter_map(|b| b.status.as_ref()).map(|s| s.ready).sum();

    let reason = if ingesting {
        source::REASON_GIT_UPDATING.to_owned()
    } else {
        let worst = worst_state(
            bundles
                .iter()
                .flat_map(|b| b.status.as_ref())
                .flat_map(|s| s.per_cluster_state.values().copied()),
        );
        format!("{worst:?}")
    };

    (desired_ready_clusters, ready_clusters, reason)
}

#[tracing::instrument(skip(client, source), fields(source = %source.name_any()))]
pub async fn reconcile_source_status(client: &Client, source: &Source, now: Time) -> Result<(), Error> {
    let name = source.name_any();
    let namespace = source.namespace().unwrap_or_default();

    let bundles_api: Api<Bundle> = Api::namespaced(client.clone(), &namespace);
    let list_params = ListParams::default().labels(&format!("{}={name}", labels::SOURCE_NAME));
    let bundles = bundles_api.list(&list_params).await.context(ListBundlesSnafu { bundle_source: name.clone() })?;

    let ingesting = source.status.as_ref().is_some_and(|s| s.ingesting);
    let (desired_ready_clusters, ready_clusters, reason) = compute_source_status(ingesting, &bundles.items);

    let mut conditions = source.status.as_ref().map(|s| s.conditions.clone()).unwrap_or_default();
    let generation = source.meta().generation.unwrap_or(0);
    condition::set_condition(
        &mut conditions,
        fleet_api::crd::source::condition_types::READY,
        !ingesting && reason == "Ready",
        &reason,
        format!("aggregated over {} bundles", bundles.items.len()),
        generation,
        now,
    );

    let sources: Api<Source> = Api::namespaced(client.clone(), &namespace);
    let patch = serde_json::json!({
        "status": {
            "desiredReadyClusters": desired_ready_clusters,
            "readyClusters": ready_clusters,
            "conditions": conditions,
        }
    });
    sources
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .context(PatchSourceSnafu { name })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use fleet_api::DeploymentSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn deployment(cluster: &str, ready: bool) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                labels: Some([(labels::CLUSTER_NAME.to_owned(), cluster.to_owned())].into_iter().collect()),
                ..Default::default()
            },
            spec: DeploymentSpec {
                bundle_name: "b".to_owned(),
                bundle_namespace: "ns".to_owned(),
                content_keys: vec![],
                options: Default::default(),
                deployment_id: "id".to_owned(),
                paused: false,
                depends_on: vec![],
            },
            status: Some(DeploymentStatus {
                ready,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn bundle_status_counts_ready_deployments() {
        let deployments = vec![deployment("c1", true), deployment("c2", false), deployment("c3", true)];
        let (desired, ready, per_cluster) = compute_bundle_status(&deployments);
        assert_eq!(desired, 3);
        assert_eq!(ready, 2);
        assert_eq!(per_cluster.len(), 3);
        assert_eq!(per_cluster["c1"], PerClusterState::Ready);
        assert_eq!(per_cluster["c2"], PerClusterState::NotReady);
    }

    #[test]
    fn empty_bundle_has_zero_desired_ready() {
        let (desired, ready, per_cluster) = compute_bundle_status(&[]);
        assert_eq!(desired, 0);
        assert_eq!(ready, 0);
        assert!(per_cluster.is_empty());
    }

    #[test]
    fn worst_state_prefers_the_most_severe() {
        assert_eq!(
            worst_state([PerClusterState::Ready, PerClusterState::ErrApplied, PerClusterState::WaitApplied]),
            PerClusterState::ErrApplied
        );
        assert_eq!(worst_state([]), PerClusterState::Ready);
    }

    #[test]
    fn source_status_reports_git_updating_while_ingesting() {
        let (_, _, reason) = compute_source_status(true, &[]);
        assert_eq!(reason, "GitUpdating");
    }
}
