//! Source ingestion orchestration: drives `fleet-git` and
//! `fleet-helm` to turn a [`Source`] into [`Bundle`] objects.
//!
//! Git path: `ls-remote` → clone → bundle-root walk → materialize each
//! root's tree into a content blob → upsert. Helm path: resolve a chart
//! version and produce one bundle bypassing the walk entirely. Both
//! paths end with a prune pass deleting any bundle this run didn't
//! touch.

use std::{collections::BTreeSet, path::Path};

use fleet_api::{Bundle, BundleSpec, GitSourceSpec, HelmSourceSpec, Source, fleet_yaml::FleetYaml, labels};
use fleet_content::store::ContentStore;
use fleet_git::{BundleRoot, CloneRequest, CredentialSource, clone_at_revision, discover_bundle_roots, resolve_commit};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, ListParams, Patch, PatchParams},
};
use snafu::{ResultExt, Snafu};

const FIELD_MANAGER: &str = "fleet-manager";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to resolve the current commit for {repo}"))]
    ResolveCommit { source: fleet_git::ls_remote::Error, repo: String },

    #[snafu(display("failed to clone {repo} at {commit}"))]
    Clone {
        source: fleet_git::clone::Error,
        repo: String,
        commit: String,
    },

    #[snafu(display("failed to walk the cloned tree"))]
    Walk { source: fleet_git::walk::Error },

    #[snafu(display("failed to create a temporary clone directory"))]
    TempDir { source: std::io::Error },

    #[snafu(display("failed to read {path}"))]
    ReadFleetYaml { source: std::io::Error, path: String },

    #[snafu(display("failed to parse fleet.yaml at {path}"))]
    ParseFleetYaml { source: serde_yaml::Error, path: String },

    #[snafu(display("failed to archive bundle root {path}"))]
    Archive { source: std::io::Error, path: String },

    #[snafu(display("failed to write content blob for bundle root {path}"))]
    WriteContent {
        source: fleet_content::store::Error,
        path: String,
    },

    #[snafu(display("failed to resolve Helm chart version for {chart}"))]
    ResolveChart { source: fleet_helm::chart::Error, chart: String },

    #[snafu(display("failed to upsert Bundle {name}"))]
    Upsert { source: kube::Error, name: String },

    #[snafu(display("failed to list Bundles for pruning"))]
    List { source: kube::Error },

    #[snafu(display("failed to delete stale Bundle {name}"))]
    Delete { source: kube::Error, name: String },
}

impl Error {
    pub fn kind(&self) -> fleet_core::error::ErrorKind {
        match self {
            Error::ResolveCommit { .. } | Error::Clone { .. } | Error::Upsert { .. } | Error::List { .. } | Error::Delete { .. } => {
                fleet_core::error::ErrorKind::Transient
            }
            Error::WriteContent { .. } | Error::TempDir { .. } | Error::Archive { .. } => fleet_core::error::ErrorKind::Transient,
            Error::Walk { .. } | Error::ReadFleetYaml { .. } | Error::ParseFleetYaml { .. } | Error::ResolveChart { .. } => {
                fleet_core::error::ErrorKind::Configuration
            }
        }
    }
}

/// Outcome of one ingestion pass, enough for the caller to decide
/// whether to write `Source.status.commit`.
#[derive(Clone, Debug)]
pub struct IngestReport {
    /// The Git commit or resolved Helm version this pass ingested.
    pub revision: String,
    pub bundle_names: Vec<String>,
}

/// Run the full Git ingestion pipeline for one source. Step 1 (the `ls-remote` no-op short-circuit) is the caller's
/// responsibility: compare `Source.status.commit` against
/// [`fleet_git::resolve_commit`]'s result before calling this.
#[tracing::instrument(skip(client, content_store, credentials, spec), fields(source = %source.name_any()))]
pub async fn ingest_git_source(
    client: &Client,
    content_store: &dyn ContentStore,
    source: &Source,
    spec: &GitSourceSpec,
    credentials: CredentialSource,
) -> Result<IngestReport, Error> {
    let reference = spec.revision.clone().or_else(|| spec.branch.clone()).unwrap_or_else(|| "HEAD".to_owned());
    let commit = resolve_commit(&spec.repo, &reference, &credentials)
        .await
        .context(ResolveCommitSnafu { repo: spec.repo.clone() })?;

    let working_directory = tempfile::tempdir().context(TempDirSnafu)?;
    clone_at_revision(CloneRequest {
        repo_url: spec.repo.clone(),
        commit: commit.clone(),
        destination: working_directory.path().to_path_buf(),
        credentials,
        submodules: spec.submodules,
    })
    .await
    .context(CloneSnafu {
        repo: spec.repo.clone(),
        commit: commit.clone(),
    })?;

    let roots = discover_bundle_roots(working_directory.path(), &spec.paths).context(WalkSnafu)?;

    let mut bundle_names = Vec::new();
    for root in &roots {
        let name = upsert_bundle_from_root(client, content_store, source, working_directory.path(), root).await?;
        bundle_names.push(name);
    }

    prune_stale_bundles(client, &source.namespace().unwrap_or_default(), &source.name_any(), &bundle_names).await?;

    Ok(IngestReport {
        revision: commit,
        bundle_names,
    })
}

async fn upsert_bundle_from_root(
    client: &Client,
    content_store: &dyn ContentStore,
    source: &Source,
    walk_root: &Path,
    bundle_root: &BundleRoot,
) -> Result<String, Error> {
    let absolute_root = walk_root.join(&bundle_root.path);
    let fleet_yaml = read_fleet_yaml(&absolute_root, bundle_root.has_fleet_yaml)?;

    let archive = archive_directory(&absolute_root)?;
    let content_key = content_store.write(&archive).await.context(WriteContentSnafu {
        path: bundle_root.path.display().to_string(),
    })?;

    let name = bundle_name(&source.name_any(), &bundle_root.path);
    let namespace = source.namespace().unwrap_or_default();

    let bundle = Bundle {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(
                [
                    (labels::SOURCE_NAME.to_owned(), source.name_any()),
                    (labels::MANAGED_BY.to_owned(), labels::MANAGED_BY_VALUE.to_owned()),
                ]
                .into_iter()
                .collect(),
            ),
            owner_references: source.controller_owner_ref(&()).map(|owner| vec![owner]),
            finalizers: Some(vec![fleet_api::finalizers::BUNDLE_CLEANUP.to_owned()]),
            ..Default::default()
        },
        spec: BundleSpec {
            content_keys: vec![content_key],
            options: fleet_yaml.options,
            targets: fleet_yaml
                .targets
                .into_iter()
                .map(|entry| fleet_api::BundleTarget {
                    name: entry.name,
                    selector: entry.selector,
                    custom: entry.custom,
                })
                .collect(),
            target_restrictions: fleet_yaml.target_restrictions,
            depends_on: fleet_yaml.depends_on,
            paused: fleet_yaml.paused,
        },
        status: None,
    };

    let bundles: Api<Bundle> = Api::namespaced(client.clone(), &namespace);
    bundles
        .patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&bundle))
        .await
        .context(UpsertSnafu { name: name.clone() })?;

    Ok(name)
}

fn read_fleet_yaml(root: &Path, has_fleet_yaml: bool) -> Result<FleetYaml, Error> {
    if !has_fleet_yaml {
        return Ok(FleetYaml::default());
    }
    let path = root.join("fleet.yaml");
    let contents = std::fs::read_to_string(&path).context(ReadFleetYamlSnafu {
        path: path.display().to_string(),
    })?;
    serde_yaml::from_str(&contents).context(ParseFleetYamlSnafu {
        path: path.display().to_string(),
    })
}

fn archive_directory(root: &Path) -> Result<Vec<u8>, Error> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", root).context(ArchiveSnafu {
        path: root.display().to_string(),
    })?;
    builder.into_inner().context(ArchiveSnafu {
        path: root.display().to_string(),
    })
}

/// Derive a valid object name from a bundle root's path relative to the
/// source root, so a source with 50 `fleet.yaml` subdirectories produces 50 distinct, stable names across ingestion passes.
fn bundle_name(source_name: &str, relative_path: &Path) -> String {
    if relative_path.as_os_str().is_empty() {
        return source_name.to_owned();
    }
    let slug = relative_path
        .to_string_lossy()
        .to_lowercase()
        .replace(['/', '_', '.'], "-");
    format!("{source_name}-{slug}")
}

/// Resolve a Helm chart version and produce one bundle bypassing the
/// Git walk entirely.
#[tracing::instrument(skip(client, source, spec), fields(source = %source.name_any()))]
pub async fn ingest_helm_source(client: &Client, source: &Source, spec: &HelmSourceSpec) -> Result<IngestReport, Error> {
    let resolved_version = if spec.oci {
        let tags_url = format!("{}/tags/list", spec.repo.trim_end_matches('/'));
        fleet_helm::chart::resolve_from_oci_tags(&spec.chart, &spec.version, &tags_url)
            .await
            .context(ResolveChartSnafu { chart: spec.chart.clone() })?
    } else {
        fleet_helm::chart::resolve_from_index(&spec.repo, &spec.chart, &spec.version)
            .await
            .context(ResolveChartSnafu { chart: spec.chart.clone() })?
    };

    let name = source.name_any();
    let namespace = source.namespace().unwrap_or_default();

    let mut options = fleet_api::fleet_yaml::BundleOptions::default();
    options.helm = Some(fleet_api::fleet_yaml::HelmOptions {
        chart: Some(spec.chart.clone()),
        repo: Some(spec.repo.clone()),
        version: Some(resolved_version.clone()),
        ..Default::default()
    });

    let bundle = Bundle {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(
                [
                    (labels::SOURCE_NAME.to_owned(), name.clone()),
                    (labels::MANAGED_BY.to_owned(), labels::MANAGED_BY_VALUE.to_owned()),
                ]
                .into_iter()
                .collect(),
            ),
            owner_references: source.controller_owner_ref(&()).map(|owner| vec![owner]),
            finalizers: Some(vec![fleet_api::finalizers::BUNDLE_CLEANUP.to_owned()]),
            ..Default::default()
        },
        spec: BundleSpec {
            content_keys: vec![],
            options,
            targets: vec![],
            target_restrictions: vec![],
            depends_on: vec![],
            paused: false,
        },
        status: None,
    };

    let bundles: Api<Bundle> = Api::namespaced(client.clone(), &namespace);
    bundles
        .patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&bundle))
        .await
        .context(UpsertSnafu { name: name.clone() })?;

    Ok(IngestReport {
        revision: resolved_version,
        bundle_names: vec![name],
    })
}

/// Delete every bundle labeled with `source_name` that was not produced
/// in this pass.
async fn prune_stale_bundles(client: &Client, namespace: &str, source_name: &str, keep: &[String]) -> Result<(), Error> {
    let bundles: Api<Bundle> = Api::namespaced(client.clone(), namespace);
    let list_params = ListParams::default().labels(&format!("{}={source_name}", labels::SOURCE_NAME));
    let existing = bundles.list(&list_params).await.context(ListSnafu)?;

    let keep: BTreeSet<&str> = keep.iter().map(String::as_str).collect();
    for bundle in existing.items {
        let name = bundle.name_any();
        if !keep.contains(name.as_str()) {
            bundles.delete(&name, &DeleteParams::default()).await.context(DeleteSnafu { name })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use super::*;

    #[test]
    fn bundle_name_slugifies_nested_paths() {
        assert_eq!(bundle_name("my-source", Path::new("")), "my-source");
        assert_eq!(bundle_name("my-source", Path::new("apps/frontend")), "my-source-apps-frontend");
    }

    #[test]
    fn archive_directory_captures_file_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("fleet.yaml"), "defaultNamespace: ns\n").expect("write");
        let archive = archive_directory(dir.path()).expect("archive");
        let mut reader = tar::Archive::new(archive.as_slice());
        let entries: Vec<PathBuf> = reader
            .entries()
            .expect("entries")
            .filter_map(|e| e.ok().and_then(|e| e.path().ok().map(|p| p.into_owned())))
            .collect();
        assert!(entries.iter().any(|p| p.ends_with("fleet.yaml")));
    }

    #[test]
    fn fifty_bundle_roots_yield_fifty_distinct_names() {
        let names: BTreeSet<String> = (0..50).map(|i| bundle_name("src", Path::new(&format!("app-{i}")))).collect();
        assert_eq!(names.len(), 50);
    }
}
