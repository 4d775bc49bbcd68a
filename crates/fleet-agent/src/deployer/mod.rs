//! Deployer dispatch: wires the pure Deploy/Monitor/Cleanup
//! decisions in [`deploy`], [`monitor`], and [`cleanup`] to I/O and to
//! the shared work queue.

pub mod cleanup;
pub mod deploy;
pub mod known_types;
pub mod monitor;
pub mod schedule;

use std::sync::Arc;

use chrono::Utc;
use fleet_api::{
    Deployment, finalizers,
    crd::deployment::DeploymentStatus,
    fleet_yaml::BundleDependency,
};
use fleet_core::{ErrorKind, workqueue::WorkQueue};
use fleet_helm::HelmBackend;
use kube::{
    Api, Client, ResourceExt,
    api::{ListParams, Patch, PatchParams},
};
use snafu::{ResultExt, Snafu};

const FIELD_MANAGER: &str = "fleet-agent";

/// One work item: a `Deployment`'s (namespace, name).
pub type DeploymentKey = (String, String);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get Deployment {name}"))]
    Get { source: kube::Error, name: String },

    #[snafu(display("failed to list sibling Deployments in {namespace}"))]
    ListSiblings { source: kube::Error, namespace: String },

    #[snafu(display("failed to patch Deployment {name} status"))]
    StatusPatch { source: kube::Error, name: String },

    #[snafu(display("failed to update finalizers on {name}"))]
    FinalizerPatch { source: kube::Error, name: String },

    #[snafu(display("failed to compute the Deploy decision for {name}"))]
    Decide { source: deploy::Error, name: String },

    #[snafu(display("helm operation failed for release {name}"))]
    Helm { source: fleet_helm::HelmError, name: String },

    #[snafu(display("failed to list Helm releases in {namespace}"))]
    ListReleases { source: fleet_helm::HelmError, namespace: String },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Decide { .. } => ErrorKind::Configuration,
            Error::Helm { source, .. } => source.kind(),
            Error::ListReleases { source, .. } => source.kind(),
            Error::Get { .. } | Error::ListSiblings { .. } | Error::StatusPatch { .. } | Error::FinalizerPatch { .. } => ErrorKind::Transient,
        }
    }
}

/// Runtime knobs for the deployer.
#[derive(Clone, Debug)]
pub struct DeployerConfig {
    pub agent_namespace: String,
    /// Bound on concurrently-running handler invocations.
    pub concurrency: usize,
    /// Upstream's "any release named `fleet-agent*` always redeploys on
    /// drift regardless of `correctDrift.force`" behavior. Kept on by
    /// default for behavioral parity with upstream Fleet; a future
    /// release may drop it once nothing relies on it.
    pub always_redeploy_fleet_agent_prefix: bool,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            agent_namespace: String::new(),
            concurrency: 50,
            always_redeploy_fleet_agent_prefix: true,
        }
    }
}

fn release_name(deployment: &Deployment) -> String {
    deployment
        .spec
        .options
        .helm
        .as_ref()
        .and_then(|helm| helm.release_name.clone())
        .unwrap_or_else(|| deployment.name_any())
}

/// Which of `depends_on` entries are not yet satisfied, checked against
/// every sibling `Deployment` in the same namespace. A dependency matches a sibling by `bundleName` or
/// by label selector, and is satisfied once that sibling reports
/// `Ready=true`.
async fn compute_unmet_dependencies(client: &Client, namespace: &str, depends_on: &[BundleDependency]) -> Result<Vec<String>, Error> {
    if depends_on.is_empty() {
        return Ok(Vec::new());
    }
    let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let siblings = api.list(&ListParams::default()).await.context(ListSiblingsSnafu { namespace: namespace.to_owned() })?;

    let mut unmet = Vec::new();
    for dependency in depends_on {
        let satisfied = siblings.items.iter().any(|sibling| {
            let matches_name = dependency.name.as_deref().is_some_and(|name| sibling.spec.bundle_name == name);
            let matches_selector = dependency
                .selector
                .as_ref()
                .is_some_and(|selector| fleet_core::selector::label_selector_matches(selector, sibling.labels()));
            (matches_name || matches_selector) && sibling.status.as_ref().is_some_and(|status| status.ready)
        });
        if !satisfied {
            unmet.push(dependency.name.clone().unwrap_or_else(|| "<selector>".to_owned()));
        }
    }
    Ok(unmet)
}

async fn patch_status(api: &Api<Deployment>, name: &str, status: &DeploymentStatus) -> Result<(), Error> {
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .context(StatusPatchSnafu { name: name.to_owned() })?;
    Ok(())
}

async fn ensure_cleanup_finalizer(api: &Api<Deployment>, deployment: &Deployment) -> Result<(), Error> {
    let name = deployment.name_any();
    if deployment.finalizers().iter().any(|f| f == finalizers::DEPLOYMENT_CLEANUP) {
        return Ok(());
    }
    let mut names = deployment.finalizers().to_vec();
    names.push(finalizers::DEPLOYMENT_CLEANUP.to_owned());
    let patch = serde_json::json!({ "metadata": { "finalizers": names } });
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
        .context(FinalizerPatchSnafu { name })?;
    Ok(())
}

async fn remove_cleanup_finalizer(api: &Api<Deployment>, deployment: &Deployment) -> Result<(), Error> {
    let name = deployment.name_any();
    let remaining: Vec<String> = deployment.finalizers().iter().filter(|f| *f != finalizers::DEPLOYMENT_CLEANUP).cloned().collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": remaining } });
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
        .context(FinalizerPatchSnafu { name })?;
    Ok(())
}

fn requeue_after(queue: &Arc<WorkQueue<DeploymentKey>>, namespace: &str, name: &str, delay: std::time::Duration) {
    let queue = queue.clone();
    let key = (namespace.to_owned(), name.to_owned());
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        queue.enqueue(key);
    });
}

/// Drive the Deploy handler for one `Deployment`: fetch current spec/status, compute [`deploy::decide`]'s
/// verdict, and either write status, requeue after a delay, or invoke
/// the Helm backend and record the outcome. Also the entry point for
/// object deletion: a `Deployment` with a deletion timestamp is handed
/// straight to [`run_cleanup`].
pub async fn run_deploy(client: &Client, backend: &dyn HelmBackend, queue: &Arc<WorkQueue<DeploymentKey>>, namespace: &str, name: &str) -> Result<(), Error> {
    let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let Some(current) = api.get_opt(name).await.context(GetSnafu { name: name.to_owned() })? else {
        return Ok(());
    };

    if current.metadata.deletion_timestamp.is_some() {
        return run_cleanup(client, backend, &current).await;
    }

    ensure_cleanup_finalizer(&api, &current).await?;

    let status = current.status.clone().unwrap_or_default();
    let unmet = compute_unmet_dependencies(client, namespace, &current.spec.depends_on).await?;
    let now = Utc::now();
    let decision = deploy::decide(&current.spec, &status, now, &unmet).context(DecideSnafu { name: name.to_owned() })?;

    match decision {
        deploy::Decision::Paused => Ok(()),
        deploy::Decision::Scheduled { status, delay } => {
            patch_status(&api, name, &status).await?;
            requeue_after(queue, namespace, name, delay);
            Ok(())
        }
        deploy::Decision::AwaitingWindow { delay } => {
            requeue_after(queue, namespace, name, delay);
            Ok(())
        }
        deploy::Decision::DependencyUnmet { status } => patch_status(&api, name, &status).await,
        deploy::Decision::Install { status } => {
            let release = release_name(&current);
            let request = deploy::build_install_request(&current.spec, release.clone(), namespace.to_owned());
            let already_installed = current.status.as_ref().is_some_and(|s| s.release.is_some());
            let result = if already_installed {
                backend.upgrade(&request).await
            } else {
                backend.deploy(&request).await
            };
            let final_status = deploy::finalize_install(status, &current.spec, &result, now);
            patch_status(&api, name, &final_status).await?;
            result.map(|_| ()).context(HelmSnafu { name: release })
        }
    }
}

/// Drive the Monitor handler for one `Deployment`: re-run the release's dry-run plan, summarize the objects it
/// touches, normalize the diff against `diff.comparePatches`, and write
/// the resulting status.
/// Returns the dry-run plan it computed (alongside writing status) so
/// the caller can feed the release's current object set to the drift
/// trigger without a second Helm round-trip; `None` when Monitor
/// declined to run at all (nothing installed yet, paused, or deleting).
pub async fn run_monitor(
    client: &Client,
    backend: &dyn HelmBackend,
    summarizers: &[Box<dyn monitor::Summarizer>],
    config: &DeployerConfig,
    namespace: &str,
    name: &str,
) -> Result<Option<fleet_helm::Plan>, Error> {
    let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let Some(current) = api.get_opt(name).await.context(GetSnafu { name: name.to_owned() })? else {
        return Ok(None);
    };
    if current.metadata.deletion_timestamp.is_some() {
        return Ok(None);
    }
    let Some(status) = current.status.clone() else {
        return Ok(None);
    };
    if status.applied_deployment_id.is_none() || current.spec.paused {
        // Nothing installed yet, or paused: Deploy owns this deployment for now.
        return Ok(None);
    }

    let release = release_name(&current);
    let plan = backend.dry_run_plan(&release, namespace).await.context(HelmSnafu { name: release.clone() })?;

    let summaries = fetch_object_summaries(client, summarizers, &plan).await;

    let force_sync_generation_advanced = current.spec.options.force_sync_generation > status.applied_force_sync_generation;
    let now = Utc::now();
    let new_status = monitor::compute_status(
        status,
        &current.spec.deployment_id,
        &release,
        plan.clone(),
        &current.spec.options.diff.compare_patches,
        &summaries,
        &current.spec.options.correct_drift,
        config.always_redeploy_fleet_agent_prefix,
        force_sync_generation_advanced,
        now,
    );
    patch_status(&api, name, &new_status).await?;
    Ok(Some(plan))
}

/// Fetch every update-bucket object's live JSON and run the summarizer
/// chain over it. Objects in the create bucket don't
/// exist live yet by definition — they are reported via
/// `modifiedStatus`, not per-object health; objects in the delete
/// bucket are strays scheduled for removal, not unhealthy. If the live
/// object can't be fetched (discovery miss, transient API error) or no
/// summarizer recognizes its kind, the drift message itself stands in
/// as the summary so a drifted object is never silently dropped from
/// `nonReadyStatus`.
async fn fetch_object_summaries(client: &Client, summarizers: &[Box<dyn monitor::Summarizer>], plan: &fleet_helm::Plan) -> Vec<monitor::ObjectSummary> {
    let mut summaries = Vec::with_capacity(plan.update.len());
    for modified in &plan.update {
        let fallback = monitor::ObjectSummary {
            reference: modified.reference.clone(),
            health: monitor::ObjectHealth::Transitioning,
            message: format!("drifted: {}", modified.changed_json_pointers.join(", ")),
        };
        let summary = fetch_live_object(client, &modified.reference)
            .await
            .and_then(|live| summarizers.iter().find_map(|summarizer| summarizer.summarize(&modified.reference, &live)))
            .unwrap_or(fallback);
        summaries.push(summary);
    }
    summaries
}

/// Fetch one object's live JSON via dynamic-typed discovery, so the
/// deployer needs no compile-time knowledge of every kind a release
/// might contain.
async fn fetch_live_object(client: &Client, reference: &fleet_helm::ObjectRef) -> Option<serde_json::Value> {
    let (group, version) = reference.api_version.split_once('/').unwrap_or(("", reference.api_version.as_str()));
    let gvk = kube::core::GroupVersionKind::gvk(group, version, &reference.kind);
    let discovery = kube::discovery::Discovery::new(client.clone()).run().await.ok()?;
    let (api_resource, _capabilities) = discovery.resolve_gvk(&gvk)?;

    let api: Api<kube::core::DynamicObject> = match &reference.namespace {
        Some(namespace) => Api::namespaced_with(client.clone(), namespace, &api_resource),
        None => Api::all_with(client.clone(), &api_resource),
    };
    let object = api.get_opt(&reference.name).await.ok()??;
    Some(object.data)
}

/// Drive the Cleanup handler for a `Deployment` that is being deleted:
/// uninstall the release unless `keepResources`, then drop the cleanup
/// finalizer so the delete can complete.
pub async fn run_cleanup(client: &Client, backend: &dyn HelmBackend, deployment: &Deployment) -> Result<(), Error> {
    let name = deployment.name_any();
    let namespace = deployment.namespace().unwrap_or_default();
    let api: Api<Deployment> = Api::namespaced(client.clone(), &namespace);

    if !deployment.finalizers().iter().any(|f| f == finalizers::DEPLOYMENT_CLEANUP) {
        return Ok(());
    }

    let release = release_name(deployment);
    let decision = cleanup::decide(release.clone(), namespace.clone(), deployment.spec.options.keep_resources);
    cleanup::run(backend, decision).await.context(HelmSnafu { name: release })?;

    remove_cleanup_finalizer(&api, deployment).await
}

/// The periodic stray-release sweep, run on a timer by `main.rs` rather than
/// from the work queue since it isn't triggered by any single
/// `Deployment`'s change.
pub async fn sweep_stray_releases(client: &Client, backend: &dyn HelmBackend, namespace: &str) -> Result<Vec<String>, Error> {
    let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let deployments = api.list(&ListParams::default()).await.context(ListSiblingsSnafu { namespace: namespace.to_owned() })?;
    let known: std::collections::BTreeSet<String> = deployments.items.iter().map(release_name).collect();

    let releases = backend
        .list_releases(namespace)
        .await
        .context(ListReleasesSnafu { namespace: namespace.to_owned() })?;
    let strays = cleanup::find_stray_releases(&releases, &known);
    for release in &strays {
        backend
            .uninstall(release, namespace, false)
            .await
            .context(HelmSnafu { name: release.clone() })?;
    }
    Ok(strays)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_name_defaults_to_the_deployment_name() {
        let deployment = Deployment {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some("dep-1".to_owned()),
                ..Default::default()
            },
            spec: fleet_api::crd::deployment::DeploymentSpec {
                bundle_name: "b".to_owned(),
                bundle_namespace: "ns".to_owned(),
                content_keys: vec![],
                options: Default::default(),
                deployment_id: "id".to_owned(),
                paused: false,
                depends_on: vec![],
            },
            status: None,
        };
        assert_eq!(release_name(&deployment), "dep-1");
    }
}
