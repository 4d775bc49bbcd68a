//! Entry point for the per-cluster agent process. Bootstraps against
//! the management plane if needed, then wires the cluster status
//! ticker, the Deploy/Monitor/Cleanup dispatch, and the drift trigger
//! to a single `Deployment` work queue, following the same
//! "coroutines for tickers, generic work queue" shape `fleet-manager`
//! uses.

use std::{sync::Arc, time::Duration};

use clap::Parser;
use fleet_agent::{
    bootstrap, cli,
    deployer::{self, DeployerConfig, known_types, monitor::Summarizer},
    drift::DriftTrigger,
    leader::{self, LeaderGuard},
    ticker,
};
use fleet_api::Deployment;
use fleet_core::workqueue::WorkQueue;
use fleet_helm::{CliHelmBackend, HelmBackend};
use futures::StreamExt;
use kube::{
    Api, Client, ResourceExt,
    runtime::{WatchStreamExt, watcher},
};
use snafu::{ResultExt, Snafu};

type Key = (String, String);

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to connect to the local cluster's API server"))]
    LocalConnect { source: kube::Error },

    #[snafu(display("failed to join the management plane"))]
    Bootstrap { source: bootstrap::Error },
}

fn init_tracing(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}

fn key_of(deployment: &Deployment) -> Key {
    (deployment.namespace().unwrap_or_default(), deployment.name_any())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli::Command::Run(args) = cli::Command::parse();
    init_tracing(&args.log_filter);

    let local_client = Client::try_default().await.context(LocalConnectSnafu)?;
    let management_client = bootstrap::resume_or_join(&local_client, &args.local_namespace, &args.agent_namespace, &args.client_id)
        .await
        .context(BootstrapSnafu)?;

    tracing::info!(cluster = %args.cluster_name, agent_namespace = %args.agent_namespace, "joined the management plane");

    let leader = Arc::new(leader::AlwaysLeader);
    let shutdown = {
        let leader = leader.clone();
        async move {
            leader.lost().await;
            tracing::error!("lost leadership lease, exiting so the leader-elector can restart this process cleanly");
        }
    };

    let deployment_queue: Arc<WorkQueue<Key>> = Arc::new(WorkQueue::new());
    let backend: Arc<dyn HelmBackend> = Arc::new(CliHelmBackend::new("helm"));
    let summarizers: Arc<Vec<Box<dyn Summarizer>>> = Arc::new(known_types::default_summarizers());
    let deployer_config = DeployerConfig {
        agent_namespace: args.agent_namespace.clone(),
        concurrency: args.worker_concurrency,
        always_redeploy_fleet_agent_prefix: args.always_redeploy_fleet_agent_prefix,
    };
    let drift = Arc::new(DriftTrigger::new(local_client.clone(), deployment_queue.clone()));

    spawn_deployment_watch(management_client.clone(), args.agent_namespace.clone(), deployment_queue.clone());

    tokio::spawn(drive_deployments(
        management_client.clone(),
        backend,
        summarizers,
        deployer_config,
        drift,
        deployment_queue,
    ));

    tokio::spawn(run_ticker_loop(
        management_client.clone(),
        args.registration_namespace.clone(),
        args.cluster_name.clone(),
        args.agent_namespace.clone(),
        args.checkin_interval.into(),
    ));

    tokio::spawn(run_stray_release_sweep_loop(
        management_client.clone(),
        args.agent_namespace.clone(),
        args.stray_release_sweep_interval.into(),
    ));

    tracing::info!(
        cluster = %args.cluster_name,
        worker_concurrency = args.worker_concurrency,
        "fleet-agent control loop started"
    );

    shutdown.await;
    std::process::exit(1);
}

/// Watch `Deployment`s in this agent's namespace and enqueue their
/// (namespace, name) identity on every `Added`/`Modified`/`Deleted`
/// event.
fn spawn_deployment_watch(client: Client, agent_namespace: String, queue: Arc<WorkQueue<Key>>) {
    tokio::spawn(async move {
        let api: Api<Deployment> = Api::namespaced(client, &agent_namespace);
        let mut events = watcher(api, watcher::Config::default()).touched_objects().boxed();
        while let Some(result) = events.next().await {
            match result {
                Ok(deployment) => queue.enqueue(key_of(&deployment)),
                Err(error) => tracing::warn!(%error, "Deployment watch stream error"),
            }
        }
    });
}

/// Drive the Deploy/Monitor dispatch for one `Deployment` work queue.
/// Cleanup is entered from within [`deployer::run_deploy`] itself once a
/// deletion timestamp is observed, so a single handler chain covers all
/// three status handlers while still serializing per-deployment, per
/// §5's ordering rule.
async fn drive_deployments(
    client: Client,
    backend: Arc<dyn HelmBackend>,
    summarizers: Arc<Vec<Box<dyn Summarizer>>>,
    config: DeployerConfig,
    drift: Arc<DriftTrigger>,
    queue: Arc<WorkQueue<Key>>,
) {
    fleet_core::workqueue::drive(queue.clone(), config.concurrency, move |(namespace, name): Key| {
        let client = client.clone();
        let backend = backend.clone();
        let summarizers = summarizers.clone();
        let config = config.clone();
        let drift = drift.clone();
        let queue = queue.clone();
        async move {
            deployer::run_deploy(&client, backend.as_ref(), &queue, &namespace, &name).await.map_err(|error| error.kind())?;
            let plan = deployer::run_monitor(&client, backend.as_ref(), &summarizers, &config, &namespace, &name)
                .await
                .map_err(|error| error.kind())?;
            if let Some(plan) = plan {
                let desired_objects = plan
                    .create
                    .iter()
                    .chain(plan.update.iter().map(|modified| &modified.reference))
                    .map(|reference| (fleet_agent::drift::Gvk::new(&reference.api_version, &reference.kind), reference.name.clone()))
                    .collect::<Vec<_>>();
                drift.reconcile_claims((namespace.clone(), name.clone()), &namespace, &desired_objects);
            }
            Ok(())
        }
    })
    .await;
}

/// The cluster status ticker: sample local node capacity and patch the
/// management-plane `Cluster` object's `status.agent` every (jittered)
/// checkin interval.
async fn run_ticker_loop(management_client: Client, registration_namespace: String, cluster_name: String, agent_namespace: String, interval: Duration) {
    loop {
        let jittered = ticker::jittered_interval(interval, 0.1);
        tokio::time::sleep(jittered).await;

        let snapshot = match sample_capacity().await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                tracing::warn!(%error, "failed to sample local node capacity");
                continue;
            }
        };

        let now = chrono::Utc::now().timestamp();
        if let Err(error) = ticker::tick(&management_client, &registration_namespace, &cluster_name, &agent_namespace, &snapshot, now).await {
            tracing::warn!(%error, "cluster status tick failed");
        }
    }
}

/// Sample local `Node` capacity and pod count. Runs against the
/// *local* cluster's default in-cluster/ambient client — the ticker's
/// own target, `status.agent` on the management-plane `Cluster` object,
/// is a separate client entirely.
async fn sample_capacity() -> Result<ticker::CapacitySnapshot, kube::Error> {
    let client = Client::try_default().await?;
    let nodes: Api<k8s_openapi::api::core::v1::Node> = Api::all(client.clone());
    let pods: Api<k8s_openapi::api::core::v1::Pod> = Api::all(client);

    let node_list = nodes.list(&kube::api::ListParams::default()).await?;
    let pod_list = pods.list(&kube::api::ListParams::default()).await?;

    let mut cpu_millis_capacity = 0u64;
    let mut memory_bytes_capacity = 0u64;
    for node in &node_list.items {
        if let Some(capacity) = node.status.as_ref().and_then(|status| status.capacity.as_ref()) {
            cpu_millis_capacity += capacity.get("cpu").map(parse_cpu_millis).unwrap_or_default();
            memory_bytes_capacity += capacity.get("memory").map(parse_memory_bytes).unwrap_or_default();
        }
    }

    Ok(ticker::CapacitySnapshot {
        node_count: node_list.items.len() as u32,
        cpu_millis_capacity,
        memory_bytes_capacity,
        pod_count: pod_list.items.len() as u32,
    })
}

fn parse_cpu_millis(quantity: &k8s_openapi::apimachinery::pkg::api::resource::Quantity) -> u64 {
    let raw = quantity.0.trim();
    if let Some(cores) = raw.strip_suffix('m') {
        cores.parse().unwrap_or(0)
    } else {
        raw.parse::<f64>().map(|cores| (cores * 1000.0) as u64).unwrap_or(0)
    }
}

fn parse_memory_bytes(quantity: &k8s_openapi::apimachinery::pkg::api::resource::Quantity) -> u64 {
    let raw = quantity.0.trim();
    let (number, multiplier): (&str, u64) = if let Some(n) = raw.strip_suffix("Ki") {
        (n, 1024)
    } else if let Some(n) = raw.strip_suffix("Mi") {
        (n, 1024 * 1024)
    } else if let Some(n) = raw.strip_suffix("Gi") {
        (n, 1024 * 1024 * 1024)
    } else {
        (raw, 1)
    };
    number.parse::<u64>().map(|value| value * multiplier).unwrap_or(0)
}

/// The periodic stray-Helm-release sweep: removes releases carrying
/// Fleet's labels that have no corresponding `Deployment`.
async fn run_stray_release_sweep_loop(management_client: Client, agent_namespace: String, interval: Duration) {
    let backend = CliHelmBackend::new("helm");
    loop {
        let jittered = ticker::jittered_interval(interval, 0.2);
        tokio::time::sleep(jittered).await;
        match deployer::sweep_stray_releases(&management_client, &backend, &agent_namespace).await {
            Ok(strays) if !strays.is_empty() => tracing::info!(count = strays.len(), releases = ?strays, "swept stray Helm releases"),
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "stray-release sweep failed"),
        }
    }
}
