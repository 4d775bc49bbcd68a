//! The agent side of the join handshake described in spec §4.B
//! ("Agent pickup" / "Failure mode"): read the bootstrap secret the
//! operator seeded on the local cluster, register with the management
//! plane, wait for the minted kubeconfig, and persist it locally so the
//! next process start skips straight to [`resume`].
//!
//! Two `kube::Client`s are in play and must not be confused: the
//! *local* client talks to this agent's own cluster (where the
//! bootstrap/`fleet-agent` secrets and the deployed workloads live);
//! the *management* client talks to the central cluster (where
//! `Registration`, `Cluster`, and `Deployment` objects live). Bootstrap
//! exists precisely to mint the latter from the former.

use std::time::Duration;

use fleet_api::{Deployment, Registration, crd::registration::RegistrationSpec};
use k8s_openapi::{ByteString, api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::ObjectMeta};
use kube::{
    Api, Client, Config,
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    config::Kubeconfig,
};
use rand::Rng;
use snafu::{OptionExt, ResultExt, Snafu};

const BOOTSTRAP_SECRET_NAME: &str = "fleet-agent-bootstrap";
const AGENT_SECRET_NAME: &str = "fleet-agent";
const KUBECONFIG_KEY: &str = "kubeconfig";
const FIELD_MANAGER: &str = "fleet-agent";

/// "up to 30 minutes" — spec §4.B.
pub const PICKUP_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const PICKUP_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read the local {BOOTSTRAP_SECRET_NAME} secret"))]
    GetBootstrapSecret { source: kube::Error },

    #[snafu(display(
        "bootstrap secret {BOOTSTRAP_SECRET_NAME} not found; the operator must re-seed it after certificate rotation"
    ))]
    BootstrapSecretMissing,

    #[snafu(display("bootstrap secret is missing key {key}"))]
    MissingKey { key: &'static str },

    #[snafu(display("failed to render a kubeconfig for the management plane"))]
    RenderKubeconfig { source: fleet_core::kubeconfig::Error },

    #[snafu(display("failed to write a temporary kubeconfig file"))]
    WriteTempKubeconfig { source: std::io::Error },

    #[snafu(display("failed to load the rendered kubeconfig"))]
    LoadKubeconfig { source: kube::config::KubeconfigError },

    #[snafu(display("failed to build a client from the rendered kubeconfig"))]
    BuildClient { source: kube::Error },

    #[snafu(display("failed to create the Registration object"))]
    CreateRegistration { source: kube::Error },

    #[snafu(display("failed to poll for the registration secret"))]
    PollSecret { source: kube::Error },

    #[snafu(display("timed out waiting for the registration secret to appear"))]
    PickupTimedOut,

    #[snafu(display("failed to write the long-lived {AGENT_SECRET_NAME} secret"))]
    WriteAgentSecret { source: kube::Error },

    #[snafu(display("failed to delete the bootstrap secret"))]
    DeleteBootstrapSecret { source: kube::Error },
}

impl Error {
    pub fn kind(&self) -> fleet_core::ErrorKind {
        match self {
            Error::BootstrapSecretMissing | Error::MissingKey { .. } | Error::LoadKubeconfig { .. } | Error::RenderKubeconfig { .. } => {
                fleet_core::ErrorKind::Fatal
            }
            Error::PickupTimedOut => fleet_core::ErrorKind::Transient,
            _ => fleet_core::ErrorKind::Transient,
        }
    }
}

/// The bootstrap secret's parsed contents: "management-plane API URL,
/// management-plane CA, a short-lived token scoped only to read secrets
/// in a dedicated registration namespace, and the parent cluster
/// namespace."
struct BootstrapSecret {
    api_server_url: String,
    api_server_ca_base64: String,
    token: String,
    registration_namespace: String,
}

impl BootstrapSecret {
    fn parse(secret: &Secret) -> Result<Self, Error> {
        let data = secret.data.as_ref();
        let get = |key: &'static str| -> Result<String, Error> {
            data.and_then(|d| d.get(key))
                .map(|value| String::from_utf8_lossy(&value.0).into_owned())
                .context(MissingKeySnafu { key })
        };
        Ok(Self {
            api_server_url: get("apiServerURL")?,
            api_server_ca_base64: get("apiServerCA")?,
            token: get("token")?,
            registration_namespace: get("systemRegistrationNamespace")?,
        })
    }
}

/// The registration-granted secret's parsed contents, per spec §6's
/// seven-key wire contract (`token`, `deploymentNamespace`,
/// `clusterNamespace`, `clusterName`, `apiServerURL`, `apiServerCA`,
/// `systemRegistrationNamespace`). Key names are duplicated from
/// `fleet-manager::registration::secret_keys` rather than imported
/// across the binary boundary — see `registration_secret_name` below
/// for the same reasoning. `deployment_namespace` and
/// `system_registration_namespace` are part of the wire contract but
/// unused by this side of the handshake, so they aren't kept past
/// parsing; parsing them anyway still makes a short secret rejected,
/// instead of silently building a kubeconfig from a partial write.
struct GrantedSecret {
    token: String,
    cluster_namespace: String,
    cluster_name: String,
    api_server_url: String,
    api_server_ca_base64: String,
}

impl GrantedSecret {
    fn parse(secret: &Secret) -> Result<Self, Error> {
        let data = secret.data.as_ref();
        let get = |key: &'static str| -> Result<String, Error> {
            data.and_then(|d| d.get(key))
                .map(|value| String::from_utf8_lossy(&value.0).into_owned())
                .context(MissingKeySnafu { key })
        };
        let token = get("token")?;
        let cluster_namespace = get("clusterNamespace")?;
        let cluster_name = get("clusterName")?;
        let api_server_url = get("apiServerURL")?;
        let api_server_ca_base64 = get("apiServerCA")?;
        // Present on the wire per §6 but not needed past this point.
        get("deploymentNamespace")?;
        get("systemRegistrationNamespace")?;
        Ok(Self { token, cluster_namespace, cluster_name, api_server_url, api_server_ca_base64 })
    }

    /// Derive a kubeconfig fragment client-side from the granted
    /// fields — §6 names the seven keys as the wire contract, not a
    /// pre-rendered kubeconfig, so rendering happens here rather than
    /// on the management plane.
    fn render_kubeconfig(&self) -> Result<String, Error> {
        fleet_core::kubeconfig::render(&fleet_core::kubeconfig::KubeconfigParams {
            cluster_name: &self.cluster_name,
            api_server_url: &self.api_server_url,
            api_server_ca_base64: &self.api_server_ca_base64,
            namespace: &self.cluster_namespace,
            token: &self.token,
        })
        .context(RenderKubeconfigSnafu)
    }
}

/// Obtain a management-plane client, either by resuming a previously
/// completed bootstrap (the `fleet-agent` secret already holds a
/// working kubeconfig) or by running the full handshake. Mirrors the
/// "failure mode" from spec §4.B: an existing kubeconfig that fails its
/// liveness probe (list `Deployment`s) is discarded and bootstrap reruns
/// from the still-present bootstrap secret.
#[tracing::instrument(skip(local_client), fields(%client_id))]
pub async fn resume_or_join(local_client: &Client, local_namespace: &str, agent_namespace: &str, client_id: &str) -> Result<Client, Error> {
    if let Some(client) = try_existing_agent_secret(local_client, local_namespace, agent_namespace).await? {
        return Ok(client);
    }

    tracing::info!("no live management-plane client found locally, running the join handshake");
    let bootstrap = load_bootstrap_secret(local_client, local_namespace).await?;
    let management_client = build_client_from_kubeconfig_yaml(&render_bootstrap_kubeconfig(&bootstrap)?).await?;

    let client_random = random_client_random();
    create_registration(&management_client, &bootstrap.registration_namespace, client_id, &client_random).await?;

    let granted_secret =
        poll_for_registration_secret(&management_client, &bootstrap.registration_namespace, client_id, &client_random, PICKUP_TIMEOUT).await?;
    let granted = GrantedSecret::parse(&granted_secret)?;
    let kubeconfig_yaml = granted.render_kubeconfig()?;

    complete_pickup(local_client, local_namespace, &kubeconfig_yaml).await?;
    build_client_from_kubeconfig_yaml(&kubeconfig_yaml).await
}

async fn try_existing_agent_secret(local_client: &Client, local_namespace: &str, agent_namespace: &str) -> Result<Option<Client>, Error> {
    let secrets: Api<Secret> = Api::namespaced(local_client.clone(), local_namespace);
    let Some(secret) = secrets.get_opt(AGENT_SECRET_NAME).await.context(GetBootstrapSecretSnafu)? else {
        return Ok(None);
    };
    let client = build_client_from_local_agent_secret(&secret).await?;
    if liveness_probe(&client, agent_namespace).await {
        Ok(Some(client))
    } else {
        tracing::warn!("long-lived fleet-agent kubeconfig failed its liveness probe (listing Deployments); re-running bootstrap");
        Ok(None)
    }
}

/// "attempt to list deployments" — spec §4.B's literal liveness check.
async fn liveness_probe(client: &Client, agent_namespace: &str) -> bool {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), agent_namespace);
    deployments.list(&ListParams::default().limit(1)).await.is_ok()
}

async fn load_bootstrap_secret(local_client: &Client, local_namespace: &str) -> Result<BootstrapSecret, Error> {
    let secrets: Api<Secret> = Api::namespaced(local_client.clone(), local_namespace);
    let secret = secrets
        .get_opt(BOOTSTRAP_SECRET_NAME)
        .await
        .context(GetBootstrapSecretSnafu)?
        .context(BootstrapSecretMissingSnafu)?;
    BootstrapSecret::parse(&secret)
}

fn render_bootstrap_kubeconfig(bootstrap: &BootstrapSecret) -> Result<String, Error> {
    fleet_core::kubeconfig::render(&fleet_core::kubeconfig::KubeconfigParams {
        cluster_name: "fleet-management",
        api_server_url: &bootstrap.api_server_url,
        api_server_ca_base64: &bootstrap.api_server_ca_base64,
        namespace: &bootstrap.registration_namespace,
        token: &bootstrap.token,
    })
    .context(RenderKubeconfigSnafu)
}

/// Reads this agent's own local `fleet-agent` secret, which this agent
/// wrote itself in [`complete_pickup`] — purely local storage, not part
/// of the §6 wire contract, so it keeps the single `kubeconfig` key.
async fn build_client_from_local_agent_secret(secret: &Secret) -> Result<Client, Error> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(KUBECONFIG_KEY))
        .context(MissingKeySnafu { key: KUBECONFIG_KEY })?;
    build_client_from_kubeconfig_yaml(&String::from_utf8_lossy(&bytes.0)).await
}

/// `kube::Config` only knows how to parse a kubeconfig *document*, not a
/// string, so the rendered/fetched YAML is round-tripped through a
/// scratch file. `Kubeconfig::read_from` is the documented entry point
/// for exactly this shape of "I have kubeconfig bytes from somewhere
/// other than `$KUBECONFIG`" load.
async fn build_client_from_kubeconfig_yaml(yaml: &str) -> Result<Client, Error> {
    let path = std::env::temp_dir().join(format!("fleet-agent-kubeconfig-{}.yaml", std::process::id()));
    tokio::fs::write(&path, yaml).await.context(WriteTempKubeconfigSnafu)?;
    let kubeconfig = Kubeconfig::read_from(&path).context(LoadKubeconfigSnafu);
    let _ = tokio::fs::remove_file(&path).await;
    let kubeconfig = kubeconfig?;

    let config = Config::from_kubeconfig(&kubeconfig).await.context(LoadKubeconfigSnafu)?;
    Client::try_from(config).context(BuildClientSnafu)
}

fn random_client_random() -> String {
    let mut rng = rand::rng();
    (0..16).map(|_| format!("{:x}", rng.random_range(0u8..16))).collect()
}

/// The `Registration` object's name isn't load-bearing (the controller
/// looks the object up by spec fields, not name), but giving it a
/// deterministic one keeps repeated bootstrap attempts from piling up
/// distinct objects for the same join attempt.
fn registration_object_name(client_id: &str, client_random: &str) -> String {
    format!("{}-{client_random}", fleet_content::hash::content_hash(client_id.as_bytes())[..16].to_owned())
}

/// The same `c-<hash(clientID)>-<clientRandom>` derivation
/// `fleet-manager::registration::secret_name` uses. Duplicated rather
/// than shared across the binary boundary: the agent doesn't otherwise
/// depend on `fleet-manager`, and the name format is itself part of the
/// spec's wire contract (§6), not an implementation detail either side
/// is free to change independently.
fn registration_secret_name(client_id: &str, client_random: &str) -> String {
    format!("c-{}-{client_random}", fleet_content::hash::content_hash(client_id.as_bytes())[..16].to_owned())
}

async fn create_registration(management_client: &Client, registration_namespace: &str, client_id: &str, client_random: &str) -> Result<(), Error> {
    let api: Api<Registration> = Api::namespaced(management_client.clone(), registration_namespace);
    let registration = Registration {
        metadata: ObjectMeta {
            name: Some(registration_object_name(client_id, client_random)),
            namespace: Some(registration_namespace.to_owned()),
            ..Default::default()
        },
        spec: RegistrationSpec {
            client_id: client_id.to_owned(),
            client_random: client_random.to_owned(),
            requested_labels: Default::default(),
        },
        status: None,
    };
    api.create(&PostParams::default(), &registration).await.context(CreateRegistrationSnafu)?;
    Ok(())
}

/// "The agent polls its registration namespace for
/// `c-<clientID>-<clientRandom>` (up to 30 minutes)".
async fn poll_for_registration_secret(
    management_client: &Client,
    registration_namespace: &str,
    client_id: &str,
    client_random: &str,
    timeout: Duration,
) -> Result<Secret, Error> {
    let name = registration_secret_name(client_id, client_random);
    let secrets: Api<Secret> = Api::namespaced(management_client.clone(), registration_namespace);
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Some(secret) = secrets.get_opt(&name).await.context(PollSecretSnafu)? {
            return Ok(secret);
        }
        if tokio::time::Instant::now() >= deadline {
            return PickupTimedOutSnafu.fail();
        }
        tokio::time::sleep(PICKUP_POLL_INTERVAL).await;
    }
}

/// "writes a long-lived `fleet-agent` secret on its local cluster
/// containing the received kubeconfig, and deletes the bootstrap
/// secret." `kubeconfig_yaml` is derived client-side from the granted
/// secret's seven named fields (see [`GrantedSecret::render_kubeconfig`])
/// — this local secret's single `kubeconfig` key is this agent's own
/// storage format, not the §6 wire contract.
async fn complete_pickup(local_client: &Client, local_namespace: &str, kubeconfig_yaml: &str) -> Result<(), Error> {
    let secrets: Api<Secret> = Api::namespaced(local_client.clone(), local_namespace);
    let agent_secret = Secret {
        metadata: ObjectMeta {
            name: Some(AGENT_SECRET_NAME.to_owned()),
            namespace: Some(local_namespace.to_owned()),
            ..Default::default()
        },
        data: Some([(KUBECONFIG_KEY.to_owned(), ByteString(kubeconfig_yaml.as_bytes().to_vec()))].into_iter().collect()),
        ..Default::default()
    };
    secrets
        .patch(AGENT_SECRET_NAME, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&agent_secret))
        .await
        .context(WriteAgentSecretSnafu)?;

    match secrets.delete(BOOTSTRAP_SECRET_NAME, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(source) => Err(source).context(DeleteBootstrapSecretSnafu),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_secret_name_is_stable_for_the_same_inputs() {
        let a = registration_secret_name("client-a", "rand1");
        let b = registration_secret_name("client-a", "rand1");
        assert_eq!(a, b);
        assert!(a.starts_with("c-"));
        assert!(a.ends_with("-rand1"));
    }

    #[test]
    fn registration_secret_name_changes_with_client_random() {
        let a = registration_secret_name("client-a", "rand1");
        let b = registration_secret_name("client-a", "rand2");
        assert_ne!(a, b);
    }

    #[test]
    fn bootstrap_secret_parse_reports_the_missing_key() {
        let secret = Secret::default();
        let error = BootstrapSecret::parse(&secret).expect_err("empty secret has no keys");
        assert!(matches!(error, Error::MissingKey { key: "apiServerURL" }));
    }

    #[test]
    fn random_client_random_is_sixteen_hex_characters() {
        let value = random_client_random();
        assert_eq!(value.len(), 16);
        assert!(value.chars().all(|c| c.is_ascii_hexdigit()));
    }

    fn granted_secret_with(keys: &[(&str, &str)]) -> Secret {
        Secret {
            data: Some(keys.iter().map(|(k, v)| ((*k).to_owned(), ByteString(v.as_bytes().to_vec()))).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn granted_secret_parses_all_seven_named_keys() {
        let secret = granted_secret_with(&[
            ("token", "sa-token"),
            ("deploymentNamespace", "fleet-agent-c-abc123"),
            ("clusterNamespace", "fleet-agent-c-abc123"),
            ("clusterName", "c-abc123"),
            ("apiServerURL", "https://management.example.com:6443"),
            ("apiServerCA", "LS0tLS1CRUdJTi0tLS0t"),
            ("systemRegistrationNamespace", "fleet-system-registration"),
        ]);
        let granted = GrantedSecret::parse(&secret).expect("all seven keys present");
        assert_eq!(granted.token, "sa-token");
        assert_eq!(granted.cluster_name, "c-abc123");
        assert_eq!(granted.cluster_namespace, "fleet-agent-c-abc123");
        assert_eq!(granted.api_server_url, "https://management.example.com:6443");
        assert_eq!(granted.api_server_ca_base64, "LS0tLS1CRUdJTi0tLS0t");
    }

    #[test]
    fn granted_secret_rejects_a_collapsed_kubeconfig_only_blob() {
        let secret = granted_secret_with(&[(KUBECONFIG_KEY, "apiVersion: v1")]);
        let error = GrantedSecret::parse(&secret).expect_err("missing the named keys");
        assert!(matches!(error, Error::MissingKey { key: "token" }));
    }

    #[test]
    fn granted_secret_renders_a_usable_kubeconfig() {
        let secret = granted_secret_with(&[
            ("token", "sa-token"),
            ("deploymentNamespace", "fleet-agent-c-abc123"),
            ("clusterNamespace", "fleet-agent-c-abc123"),
            ("clusterName", "c-abc123"),
            ("apiServerURL", "https://management.example.com:6443"),
            ("apiServerCA", "LS0tLS1CRUdJTi0tLS0t"),
            ("systemRegistrationNamespace", "fleet-system-registration"),
        ]);
        let granted = GrantedSecret::parse(&secret).expect("all seven keys present");
        let yaml = granted.render_kubeconfig().expect("render");
        assert!(yaml.contains("c-abc123"));
        assert!(yaml.contains("sa-token"));
        assert!(yaml.contains("https://management.example.com:6443"));
    }
}
