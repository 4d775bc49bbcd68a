//! Entry point for the management-plane control loop. Wires each reconciler module in the library crate to a
//! `kube::runtime::watcher` stream and a [`fleet_core::workqueue`],
//! following the same "coroutines for tickers, generic work queue"
//! shape the agent binary uses.

use std::{path::PathBuf, sync::Arc, time::Instant};

use clap::Parser;
use fleet_api::{
    Bundle, Cluster, ClusterGroup, Content, Deployment, GitSourceSpec, Registration, Source, crd::CustomResourceExt, crd::source::SourceBackend, labels,
};
use fleet_content::store::K8sConfigMapStore;
use fleet_core::{condition, workqueue::WorkQueue};
use fleet_git::credentials::CredentialSource;
use futures::StreamExt;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, api::core::v1::Secret};
use kube::{
    Api, Client, ResourceExt,
    api::ListParams,
    runtime::{WatchStreamExt, watcher},
};
use snafu::{ResultExt, Snafu};

use fleet_manager::{aggregate, cli, gc, ingest, reconcile, registration, targeting};

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to connect to the management-plane API server"))]
    Connect { source: kube::Error },

    #[snafu(display("failed to print CRD schema"))]
    Schema { source: fleet_api::crd::Error },
}

type Key = (String, String);

fn key_of<K>(object: &K) -> Key
where
    K: ResourceExt,
{
    (object.namespace().unwrap_or_default(), object.name_any())
}

fn init_tracing(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}

fn print_crds() -> Result<(), Error> {
    for schema in [
        Source::yaml_schema(),
        Bundle::yaml_schema(),
        Content::yaml_schema(),
        Cluster::yaml_schema(),
        ClusterGroup::yaml_schema(),
        Deployment::yaml_schema(),
        Registration::yaml_schema(),
    ] {
        println!("---");
        println!("{}", schema.context(SchemaSnafu)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let command = cli::Command::parse();

    match command {
        cli::Command::Crd => print_crds(),
        cli::Command::Run(args) => run(args).await,
    }
}

async fn run(args: cli::RunArguments) -> Result<(), Error> {
    init_tracing(&args.log_filter);
    let client = Client::try_default().await.context(ConnectSnafu)?;

    let registration_config = Arc::new(registration::RegistrationConfig {
        registration_namespace: args.registration_namespace.clone(),
        api_server_url: args.api_server_url.clone(),
        api_server_ca_base64: args.api_server_ca_base64.clone(),
    });

    let content_store = Arc::new(K8sConfigMapStore::new(Api::<Content>::namespaced(
        client.clone(),
        &args.registration_namespace,
    )));

    let source_queue: Arc<WorkQueue<Key>> = Arc::new(WorkQueue::new());
    let bundle_queue: Arc<WorkQueue<Key>> = Arc::new(WorkQueue::new());
    let registration_queue: Arc<WorkQueue<Key>> = Arc::new(WorkQueue::new());
    let cluster_queue: Arc<WorkQueue<Key>> = Arc::new(WorkQueue::new());
    let deployment_aggregate_queue: Arc<WorkQueue<Key>> = Arc::new(WorkQueue::new());

    spawn_watch::<Source>(client.clone(), None, source_queue.clone());
    spawn_watch::<Bundle>(client.clone(), None, bundle_queue.clone());
    spawn_watch::<Registration>(client.clone(), Some(args.registration_namespace.clone()), registration_queue.clone());
    spawn_watch::<Cluster>(client.clone(), Some(args.registration_namespace.clone()), cluster_queue.clone());
    spawn_watch::<ClusterGroup>(client.clone(), Some(args.registration_namespace.clone()), cluster_queue.clone());
    spawn_watch::<Deployment>(client.clone(), None, deployment_aggregate_queue.clone());

    tokio::spawn(drive_sources(client.clone(), content_store.clone(), source_queue.clone(), bundle_queue.clone()));
    tokio::spawn(drive_bundles(client.clone(), args.registration_namespace.clone(), bundle_queue.clone()));
    tokio::spawn(drive_registrations(client.clone(), registration_config.clone(), registration_queue.clone()));
    tokio::spawn(drive_clusters(client.clone(), cluster_queue.clone(), bundle_queue.clone()));
    tokio::spawn(drive_deployment_aggregates(client.clone(), deployment_aggregate_queue.clone()));

    tokio::spawn(run_gc_loop(client.clone(), content_store, args.gc_interval.into()));
    tokio::spawn(run_registration_sweep_loop(
        client.clone(),
        args.registration_namespace.clone(),
        args.registration_sweep_interval.into(),
    ));

    tracing::info!(
        registration_namespace = %args.registration_namespace,
        worker_concurrency = args.worker_concurrency,
        "fleet-manager control loop started"
    );

    std::future::pending::<()>().await;
    Ok(())
}

/// Watch one kind and enqueue its (namespace, name) identity on every
/// `Added`/`Modified`/`Deleted` event: work items are the
/// (namespace, name) identity of the touched object.
fn spawn_watch<K>(client: Client, namespace: Option<String>, queue: Arc<WorkQueue<Key>>)
where
    K: kube::Resource<DynamicType = ()> + Clone + std::fmt::Debug + Send + Sync + serde::de::DeserializeOwned + 'static,
{
    tokio::spawn(async move {
        let api: Api<K> = match &namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        let mut events = watcher(api, watcher::Config::default()).touched_objects().boxed();
        while let Some(result) = events.next().await {
            match result {
                Ok(object) => queue.enqueue(key_of(&object)),
                Err(error) => tracing::warn!(%error, kind = std::any::type_name::<K>(), "watch stream error"),
            }
        }
    });
}

async fn drive_sources(client: Client, content_store: Arc<K8sConfigMapStore>, source_queue: Arc<WorkQueue<Key>>, bundle_queue: Arc<WorkQueue<Key>>) {
    fleet_core::workqueue::drive(source_queue, 10, move |(namespace, name)| {
        let client = client.clone();
        let content_store = content_store.clone();
        let bundle_queue = bundle_queue.clone();
        async move {
            match reconcile_one_source(&client, &content_store, &namespace, &name).await {
                Ok(touched_bundles) => {
                    for bundle_name in touched_bundles {
                        bundle_queue.enqueue((namespace.clone(), bundle_name));
                    }
                    Ok(())
                }
                Err(kind) => Err(kind),
            }
        }
    })
    .await;
}

/// One Source ingest pass: resolve the current revision, short-circuit
/// if unchanged, ingest, and write `Accepted`/`Stalled` from the
/// outcome.
async fn reconcile_one_source(client: &Client, content_store: &K8sConfigMapStore, namespace: &str, name: &str) -> Result<Vec<String>, fleet_core::ErrorKind> {
    let api: Api<Source> = Api::namespaced(client.clone(), namespace);
    let Some(source) = api.get_opt(name).await.map_err(|error| {
        tracing::warn!(%error, "failed to get Source");
        fleet_core::ErrorKind::Transient
    })?
    else {
        return Ok(Vec::new());
    };

    let now = Time(chrono::Utc::now());
    let report = match &source.spec.backend {
        SourceBackend::Git(spec) => ingest_git(client, content_store, &source, spec, now.clone()).await,
        SourceBackend::Helm(spec) => ingest::ingest_helm_source(client, &source, spec).await.map_err(|error| (error.kind(), error.to_string())),
    };

    match report {
        Ok(report) => {
            write_source_conditions(client, &source, true, "Ready", String::new(), now).await;
            let status_patch = serde_json::json!({ "status": { "commit": report.revision, "ingesting": false } });
            let _ = api
                .patch_status(name, &kube::api::PatchParams::default(), &kube::api::Patch::Merge(&status_patch))
                .await;
            Ok(report.bundle_names)
        }
        Err((kind, message)) => {
            write_source_conditions(client, &source, false, "IngestFailed", message, now).await;
            Err(kind)
        }
    }
}

async fn ingest_git(
    client: &Client,
    content_store: &K8sConfigMapStore,
    source: &Source,
    spec: &GitSourceSpec,
    _now: Time,
) -> Result<ingest::IngestReport, (fleet_core::ErrorKind, String)> {
    let reference = spec.revision.clone().or_else(|| spec.branch.clone()).unwrap_or_else(|| "HEAD".to_owned());
    let credentials = load_git_credentials(client, &source.namespace().unwrap_or_default(), spec.credentials_secret.as_deref())
        .await
        .map_err(|error| (fleet_core::ErrorKind::Transient, error))?;

    let current_commit = fleet_git::resolve_commit(&spec.repo, &reference, &credentials)
        .await
        .map_err(|error| (fleet_core::ErrorKind::Transient, error.to_string()))?;

    if source.status.as_ref().and_then(|s| s.commit.as_deref()) == Some(current_commit.as_str()) {
        // Unchanged since the last pass: no-op.
        return Ok(ingest::IngestReport {
            revision: current_commit,
            bundle_names: Vec::new(),
        });
    }

    ingest::ingest_git_source(client, content_store, source, spec, credentials)
        .await
        .map_err(|error| (error.kind(), error.to_string()))
}

async fn write_source_conditions(client: &Client, source: &Source, accepted: bool, reason: &str, message: String, now: Time) {
    let name = source.name_any();
    let namespace = source.namespace().unwrap_or_default();
    let mut conditions = source.status.as_ref().map(|s| s.conditions.clone()).unwrap_or_default();
    condition::set_condition(
        &mut conditions,
        fleet_api::crd::source::condition_types::ACCEPTED,
        accepted,
        reason,
        message,
        source.meta().generation.unwrap_or_default(),
        now,
    );
    let api: Api<Source> = Api::namespaced(client.clone(), &namespace);
    let patch = serde_json::json!({ "status": { "conditions": conditions } });
    if let Err(error) = api.patch_status(&name, &kube::api::PatchParams::default(), &kube::api::Patch::Merge(&patch)).await {
        tracing::warn!(%error, %name, "failed to patch Source conditions");
    }
}

/// Load credentials for a Git source from its referenced `Secret`:
/// HTTP basic (`username`/`password`), SSH (`ssh-privatekey`,
/// optional `ssh-passphrase`/`known_hosts`), or GitHub App
/// (`github-app-id`/`github-app-installation-id`/`github-app-private-key`).
/// No secret configured falls back to anonymous HTTPS access.
async fn load_git_credentials(client: &Client, namespace: &str, secret_name: Option<&str>) -> Result<CredentialSource, String> {
    let Some(secret_name) = secret_name else {
        return Ok(CredentialSource::Anonymous);
    };

    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = api.get(secret_name).await.map_err(|error| error.to_string())?;
    let data = secret.data.unwrap_or_default();
    let get = |key: &str| data.get(key).map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned());

    if let (Some(app_id), Some(installation_id), Some(private_key_pem)) =
        (get("github-app-id"), get("github-app-installation-id"), get("github-app-private-key"))
    {
        return Ok(CredentialSource::GitHubApp {
            app_id: app_id.parse().map_err(|_| "invalid github-app-id".to_owned())?,
            installation_id: installation_id.parse().map_err(|_| "invalid github-app-installation-id".to_owned())?,
            private_key_pem,
        });
    }

    if let Some(private_key) = get("ssh-privatekey") {
        let key_path = PathBuf::from(std::env::temp_dir()).join(format!("fleet-ssh-{namespace}-{secret_name}"));
        std::fs::write(&key_path, private_key).map_err(|error| error.to_string())?;
        let known_hosts_path = match get("known_hosts") {
            Some(known_hosts) => {
                let path = std::env::temp_dir().join(format!("fleet-known-hosts-{namespace}-{secret_name}"));
                std::fs::write(&path, known_hosts).map_err(|error| error.to_string())?;
                path
            }
            // Absent known_hosts triggers ssh-keyscan into a
            // fixed env-referenced path; the keyscan itself is an
            // operational concern handled by the agent pod's init
            // container, not this control loop.
            None => PathBuf::from(std::env::var("FLEET_SSH_KNOWN_HOSTS").unwrap_or_else(|_| "/etc/fleet/known_hosts".to_owned())),
        };
        return Ok(CredentialSource::Ssh {
            username: get("username").unwrap_or_else(|| "git".to_owned()),
            private_key: key_path,
            passphrase: get("ssh-passphrase"),
            known_hosts: known_hosts_path,
        });
    }

    if let (Some(username), Some(password)) = (get("username"), get("password")) {
        return Ok(CredentialSource::Basic { username, password });
    }

    Ok(CredentialSource::Anonymous)
}

async fn drive_bundles(client: Client, registration_namespace: String, bundle_queue: Arc<WorkQueue<Key>>) {
    fleet_core::workqueue::drive(bundle_queue, 10, move |(namespace, name)| {
        let client = client.clone();
        let registration_namespace = registration_namespace.clone();
        async move { reconcile_one_bundle(&client, &registration_namespace, &namespace, &name).await }
    })
    .await;
}

async fn reconcile_one_bundle(client: &Client, registration_namespace: &str, namespace: &str, name: &str) -> Result<(), fleet_core::ErrorKind> {
    let api: Api<Bundle> = Api::namespaced(client.clone(), namespace);
    let Some(bundle) = api.get_opt(name).await.map_err(|_| fleet_core::ErrorKind::Transient)? else {
        return Ok(());
    };

    let clusters = reconcile::snapshot_clusters(client, registration_namespace).await.map_err(|error| error.kind())?;
    reconcile::reconcile_bundle(client, &bundle, &clusters).await.map_err(|error| error.kind())?;
    aggregate::reconcile_bundle_status(client, &bundle).await.map_err(|error| error.kind())?;

    if let Some(source_name) = bundle.labels().get(labels::SOURCE_NAME) {
        let sources: Api<Source> = Api::namespaced(client.clone(), namespace);
        if let Ok(Some(source)) = sources.get_opt(source_name).await {
            let _ = aggregate::reconcile_source_status(client, &source, Time(chrono::Utc::now())).await;
        }
    }
    Ok(())
}

async fn drive_registrations(client: Client, config: Arc<registration::RegistrationConfig>, queue: Arc<WorkQueue<Key>>) {
    fleet_core::workqueue::drive(queue, 5, move |(namespace, name)| {
        let client = client.clone();
        let config = config.clone();
        async move {
            let api: Api<Registration> = Api::namespaced(client.clone(), &namespace);
            let Some(reg) = api.get_opt(&name).await.map_err(|_| fleet_core::ErrorKind::Transient)? else {
                return Ok(());
            };
            registration::reconcile(&client, &config, &reg).await.map_err(|error| error.kind())
        }
    })
    .await;
}

/// `Cluster`/`ClusterGroup` changes re-trigger targeting for every
/// `Bundle` and, for `Cluster`s
/// specifically, the namespace-assignment sub-controller.
async fn drive_clusters(client: Client, cluster_queue: Arc<WorkQueue<Key>>, bundle_queue: Arc<WorkQueue<Key>>) {
    fleet_core::workqueue::drive(cluster_queue, 5, move |(namespace, name)| {
        let client = client.clone();
        let bundle_queue = bundle_queue.clone();
        async move {
            let clusters: Api<Cluster> = Api::namespaced(client.clone(), &namespace);
            if let Ok(Some(cluster)) = clusters.get_opt(&name).await {
                registration::namespace::reconcile(&client, &cluster).await.map_err(|error| error.kind())?;
            }

            let bundles: Api<Bundle> = Api::all(client.clone());
            if let Ok(list) = bundles.list(&ListParams::default()).await {
                for bundle in list.items {
                    bundle_queue.enqueue(key_of(&bundle));
                }
            }
            Ok(())
        }
    })
    .await;
}

/// A `Deployment` status write re-aggregates its owning `Bundle` (and
/// transitively its `Source`).
async fn drive_deployment_aggregates(client: Client, queue: Arc<WorkQueue<Key>>) {
    fleet_core::workqueue::drive(queue, 10, move |(namespace, name)| {
        let client = client.clone();
        async move {
            let api: Api<Deployment> = Api::namespaced(client.clone(), &namespace);
            let Some(deployment) = api.get_opt(&name).await.map_err(|_| fleet_core::ErrorKind::Transient)? else {
                return Ok(());
            };

            let bundles: Api<Bundle> = Api::namespaced(client.clone(), &deployment.spec.bundle_namespace);
            let Some(bundle) = bundles.get_opt(&deployment.spec.bundle_name).await.map_err(|_| fleet_core::ErrorKind::Transient)? else {
                return Ok(());
            };
            aggregate::reconcile_bundle_status(&client, &bundle).await.map_err(|error| error.kind())?;

            if let Some(source_name) = bundle.labels().get(labels::SOURCE_NAME) {
                let sources: Api<Source> = Api::namespaced(client.clone(), &deployment.spec.bundle_namespace);
                if let Ok(Some(source)) = sources.get_opt(source_name).await {
                    aggregate::reconcile_source_status(&client, &source, Time(chrono::Utc::now()))
                        .await
                        .map_err(|error| error.kind())?;
                }
            }
            Ok(())
        }
    })
    .await;
}

/// The content GC loop.
async fn run_gc_loop(client: Client, content_store: Arc<K8sConfigMapStore>, interval: std::time::Duration) {
    let mut gc = gc::ContentGc::new();
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match gc::run_pass(&client, content_store.as_ref(), &mut gc, Instant::now()).await {
            Ok(deleted) if !deleted.is_empty() => tracing::info!(count = deleted.len(), "content GC pass deleted orphaned blobs"),
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "content GC pass failed"),
        }
    }
}

/// The `Registration` TTL sweep.
async fn run_registration_sweep_loop(client: Client, namespace: String, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let now = chrono::Utc::now().timestamp();
        match registration::sweep(&client, &namespace, now).await {
            Ok(deleted) if deleted > 0 => tracing::info!(count = deleted, "swept expired Registrations"),
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "registration sweep failed"),
        }
    }
}
