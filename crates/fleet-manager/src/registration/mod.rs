//! The registration service: grants a newly bootstrapping
//! agent scoped credentials and binds it to a per-cluster namespace.
//!
//! The state machine in [`reconcile`] runs steps 1-6 exactly as
//! specified; [`sweep`] implements the background TTL reconciler.

pub mod namespace;

use std::time::Duration;

use fleet_api::{Cluster, ClusterSpec, Registration};
use k8s_openapi::{
    ByteString,
    api::core::v1::Secret,
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
};
use kube::{
    Api, Client, Resource,
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
};
use snafu::{OptionExt, ResultExt, Snafu};

const FIELD_MANAGER: &str = "fleet-manager";

/// How long a `Registration` is allowed to live before the background
/// sweep deletes it.
pub const REGISTRATION_TTL: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("registration object has no name"))]
    MissingName,

    #[snafu(display("failed to look up Cluster {name}"))]
    ClusterLookup { source: kube::Error, name: String },

    #[snafu(display("failed to create Cluster {name}"))]
    ClusterCreate { source: kube::Error, name: String },

    /// Not a failure: the namespace-assignment controller has not yet
    /// run. The work queue retries this with back-off.
    #[snafu(display("Cluster {cluster} has not yet been assigned a namespace"))]
    AwaitingNamespace { cluster: String },

    #[snafu(display("failed to apply RBAC object {name} in {namespace}"))]
    RbacApply {
        source: kube::Error,
        name: String,
        namespace: String,
    },

    #[snafu(display("failed to mint a service account token for {service_account} in {namespace}"))]
    TokenMint {
        source: kube::Error,
        service_account: String,
        namespace: String,
    },

    #[snafu(display("service account token for {service_account} was not populated in time"))]
    TokenNotReady { service_account: String },

    #[snafu(display("failed to write registration secret {name}"))]
    SecretWrite { source: kube::Error, name: String },

    #[snafu(display("failed to patch Registration {name} status"))]
    StatusPatch { source: kube::Error, name: String },

    #[snafu(display("failed to list Registrations"))]
    List { source: kube::Error },

    #[snafu(display("failed to delete Registration {name}"))]
    Delete { source: kube::Error, name: String },
}

impl Error {
    pub fn kind(&self) -> fleet_core::error::ErrorKind {
        match self {
            Error::AwaitingNamespace { .. }
            | Error::ClusterLookup { .. }
            | Error::ClusterCreate { .. }
            | Error::RbacApply { .. }
            | Error::TokenMint { .. }
            | Error::TokenNotReady { .. }
            | Error::SecretWrite { .. }
            | Error::StatusPatch { .. }
            | Error::List { .. }
            | Error::Delete { .. } => fleet_core::error::ErrorKind::Transient,
            Error::MissingName => fleet_core::error::ErrorKind::Fatal,
        }
    }
}

/// Inputs that do not vary per-registration: where the management
/// objects and the agent's apiserver endpoint live.
#[derive(Clone, Debug)]
pub struct RegistrationConfig {
    /// Namespace holding `Registration`, `Cluster`, and the granted
    /// registration secrets — the "dedicated registration namespace"
    /// named in bootstrap.
    pub registration_namespace: String,
    pub api_server_url: String,
    pub api_server_ca_base64: String,
}

/// Derive the stable `Cluster` name from a client-id. Reuses the content-addressing hash so the
/// same derivation logic lives in one place.
pub fn cluster_name(client_id: &str) -> String {
    format!("c-{}", short_hash(client_id))
}

/// The registration secret's name.
pub fn secret_name(client_id: &str, client_random: &str) -> String {
    format!("c-{}-{client_random}", short_hash(client_id))
}

fn short_hash(client_id: &str) -> String {
    fleet_content::hash::content_hash(client_id.as_bytes())[..16].to_owned()
}

/// The registration secret's seven named keys, per spec §6's wire
/// contract: `token`, `deploymentNamespace`, `clusterNamespace`,
/// `clusterName`, `apiServerURL`, `apiServerCA`,
/// `systemRegistrationNamespace`. A rendered kubeconfig is deliberately
/// *not* one of these keys — the agent derives its own kubeconfig
/// client-side from these fields (see `fleet_agent::bootstrap`), so the
/// wire contract never collapses to a single opaque blob.
///
/// This implementation's data model has only one namespace assigned per
/// cluster (`Cluster.status.namespace`, see
/// `registration::namespace::agent_namespace_name`), used both to host
/// the agent's RBAC and its `Deployment` objects. `deploymentNamespace`
/// and `clusterNamespace` therefore carry the same value here; they stay
/// distinct keys to match the documented format, in case a future
/// revision splits them.
pub struct RegistrationSecretFields<'a> {
    pub token: &'a str,
    pub deployment_namespace: &'a str,
    pub cluster_namespace: &'a str,
    pub cluster_name: &'a str,
    pub api_server_url: &'a str,
    pub api_server_ca_base64: &'a str,
    pub system_registration_namespace: &'a str,
}

pub mod secret_keys {
    pub const TOKEN: &str = "token";
    pub const DEPLOYMENT_NAMESPACE: &str = "deploymentNamespace";
    pub const CLUSTER_NAMESPACE: &str = "clusterNamespace";
    pub const CLUSTER_NAME: &str = "clusterName";
    pub const API_SERVER_URL: &str = "apiServerURL";
    pub const API_SERVER_CA: &str = "apiServerCA";
    pub const SYSTEM_REGISTRATION_NAMESPACE: &str = "systemRegistrationNamespace";
}

impl RegistrationSecretFields<'_> {
    fn into_data(self) -> std::collections::BTreeMap<String, ByteString> {
        [
            (secret_keys::TOKEN, self.token),
            (secret_keys::DEPLOYMENT_NAMESPACE, self.deployment_namespace),
            (secret_keys::CLUSTER_NAMESPACE, self.cluster_namespace),
            (secret_keys::CLUSTER_NAME, self.cluster_name),
            (secret_keys::API_SERVER_URL, self.api_server_url),
            (secret_keys::API_SERVER_CA, self.api_server_ca_base64),
            (secret_keys::SYSTEM_REGISTRATION_NAMESPACE, self.system_registration_namespace),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_owned(), ByteString(value.as_bytes().to_vec())))
        .collect()
    }
}

/// Run steps 1-6 of the registration state machine for one `Registration`
/// object.
#[tracing::instrument(skip(client, config, registration), fields(registration = %registration.metadata.name.as_deref().unwrap_or("")))]
pub async fn reconcile(client: &Client, config: &RegistrationConfig, registration: &Registration) -> Result<(), Error> {
    let name = registration.metadata.name.clone().context(MissingNameSnafu)?;
    let spec = &registration.spec;
    let ns = config.registration_namespace.as_str();

    let clusters: Api<Cluster> = Api::namespaced(client.clone(), ns);
    let target_cluster_name = cluster_name(&spec.client_id);

    // Step 1: find or create the Cluster.
    let cluster = match clusters
        .get_opt(&target_cluster_name)
        .await
        .context(ClusterLookupSnafu { name: target_cluster_name.clone() })?
    {
        Some(existing) => existing,
        None => {
            let fresh = Cluster {
                metadata: ObjectMeta {
                    name: Some(target_cluster_name.clone()),
                    namespace: Some(ns.to_owned()),
                    ..Default::default()
                },
                spec: ClusterSpec {
                    client_id: spec.client_id.clone(),
                    labels: spec.requested_labels.clone(),
                },
                status: None,
            };
            clusters
                .create(&PostParams::default(), &fresh)
                .await
                .context(ClusterCreateSnafu { name: target_cluster_name.clone() })?
        }
    };

    // Step 2: wait for the namespace-assignment controller.
    let agent_namespace = cluster
        .status
        .as_ref()
        .map(|status| status.namespace.clone())
        .filter(|namespace| !namespace.is_empty())
        .context(AwaitingNamespaceSnafu {
            cluster: target_cluster_name.clone(),
        })?;

    // Step 3: service-account/role/rolebinding triple.
    let (service_account, role, role_binding) = fleet_core::rbac::build_agent_rbac(&agent_namespace);
    apply_service_account(client, &agent_namespace, &service_account).await?;
    apply_role(client, &agent_namespace, &role).await?;
    apply_role_binding(client, &agent_namespace, &role_binding).await?;

    let token = mint_service_account_token(
        client,
        &agent_namespace,
        fleet_core::rbac::AGENT_SERVICE_ACCOUNT_NAME,
    )
    .await?;

    // Step 4: write the registration secret — the §6 wire contract's
    // seven named keys, not a pre-rendered kubeconfig blob (the agent
    // derives its own kubeconfig client-side from these).
    let secret_name = secret_name(&spec.client_id, &spec.client_random);
    let fields = RegistrationSecretFields {
        token: &token,
        deployment_namespace: &agent_namespace,
        cluster_namespace: &agent_namespace,
        cluster_name: &target_cluster_name,
        api_server_url: &config.api_server_url,
        api_server_ca_base64: &config.api_server_ca_base64,
        system_registration_namespace: ns,
    };
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.clone()),
            namespace: Some(ns.to_owned()),
            ..Default::default()
        },
        data: Some(fields.into_data()),
        ..Default::default()
    };
    let secrets: Api<Secret> = Api::namespaced(client.clone(), ns);
    secrets
        .patch(
            &secret_name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Apply(&secret),
        )
        .await
        .context(SecretWriteSnafu { name: secret_name })?;

    // Step 5: flip the granted flag.
    let registrations: Api<Registration> = Api::namespaced(client.clone(), ns);
    let status_patch = serde_json::json!({ "status": { "granted": true } });
    registrations
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&status_patch))
        .await
        .context(StatusPatchSnafu { name: name.clone() })?;

    // Step 6: delete superseded registrations.
    delete_superseded(&registrations, &spec.client_id, registration).await?;

    Ok(())
}

async fn apply_service_account(
    client: &Client,
    namespace: &str,
    service_account: &k8s_openapi::api::core::v1::ServiceAccount,
) -> Result<(), Error> {
    let api: Api<k8s_openapi::api::core::v1::ServiceAccount> = Api::namespaced(client.clone(), namespace);
    let name = service_account.metadata.name.clone().unwrap_or_default();
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(service_account))
        .await
        .context(RbacApplySnafu {
            name,
            namespace: namespace.to_owned(),
        })?;
    Ok(())
}

async fn apply_role(client: &Client, namespace: &str, role: &k8s_openapi::api::rbac::v1::Role) -> Result<(), Error> {
    let api: Api<k8s_openapi::api::rbac::v1::Role> = Api::namespaced(client.clone(), namespace);
    let name = role.metadata.name.clone().unwrap_or_default();
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(role))
        .await
        .context(RbacApplySnafu {
            name,
            namespace: namespace.to_owned(),
        })?;
    Ok(())
}

async fn apply_role_binding(
    client: &Client,
    namespace: &str,
    role_binding: &k8s_openapi::api::rbac::v1::RoleBinding,
) -> Result<(), Error> {
    let api: Api<k8s_openapi::api::rbac::v1::RoleBinding> = Api::namespaced(client.clone(), namespace);
    let name = role_binding.metadata.name.clone().unwrap_or_default();
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(role_binding))
        .await
        .context(RbacApplySnafu {
            name,
            namespace: namespace.to_owned(),
        })?;
    Ok(())
}

/// Mint a token for `service_account` via the long-lived, annotation-
/// triggered service-account-token secret mechanism Kubernetes still
/// supports as an explicit opt-in (the classic auto-minted path was
/// removed by default in 1.24+, but a caller creating the secret itself
/// remains supported and is exactly what this bootstrap flow needs — a
/// `TokenRequest` would expire long before the agent's next check-in).
async fn mint_service_account_token(client: &Client, namespace: &str, service_account: &str) -> Result<String, Error> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let token_secret_name = format!("{service_account}-token");

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(token_secret_name.clone()),
            namespace: Some(namespace.to_owned()),
            annotations: Some([("kubernetes.io/service-account.name".to_owned(), service_account.to_owned())].into_iter().collect()),
            ..Default::default()
        },
        type_: Some("kubernetes.io/service-account-token".to_owned()),
        ..Default::default()
    };

    secrets
        .patch(
            &token_secret_name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Apply(&secret),
        )
        .await
        .context(TokenMintSnafu {
            service_account: service_account.to_owned(),
            namespace: namespace.to_owned(),
        })?;

    let populated = secrets
        .get(&token_secret_name)
        .await
        .context(TokenMintSnafu {
            service_account: service_account.to_owned(),
            namespace: namespace.to_owned(),
        })?;

    populated
        .data
        .as_ref()
        .and_then(|data| data.get("token"))
        .map(|token| String::from_utf8_lossy(&token.0).into_owned())
        .context(TokenNotReadySnafu {
            service_account: service_account.to_owned(),
        })
}

/// Delete every other `Registration` sharing `client_id` that was
/// created no later than `current`.
async fn delete_superseded(registrations: &Api<Registration>, client_id: &str, current: &Registration) -> Result<(), Error> {
    let current_created = current.meta().creation_timestamp.clone();
    let current_name = current.meta().name.clone();

    let all = registrations.list(&ListParams::default()).await.context(ListSnafu)?;
    for other in all.items {
        if other.spec.client_id != client_id {
            continue;
        }
        if other.meta().name == current_name {
            continue;
        }
        if !is_older_or_equal(&other.meta().creation_timestamp, &current_created) {
            continue;
        }
        if let Some(other_name) = other.meta().name.clone() {
            registrations
                .delete(&other_name, &DeleteParams::default())
                .await
                .context(DeleteSnafu { name: other_name })?;
        }
    }
    Ok(())
}

fn is_older_or_equal(candidate: &Option<Time>, current: &Option<Time>) -> bool {
    match (candidate, current) {
        (Some(candidate), Some(current)) => candidate.0 <= current.0,
        _ => true,
    }
}

/// Background sweep deleting `Registration`s past [`REGISTRATION_TTL`].
/// `now_epoch_seconds` is threaded in so the comparison stays a plain
/// integer subtraction rather than a `chrono` duration conversion.
pub async fn sweep(client: &Client, namespace: &str, now_epoch_seconds: i64) -> Result<usize, Error> {
    let registrations: Api<Registration> = Api::namespaced(client.clone(), namespace);
    let all = registrations.list(&ListParams::default()).await.context(ListSnafu)?;

    let mut deleted = 0;
    for registration in all.items {
        let Some(created) = registration.meta().creation_timestamp.clone() else {
            continue;
        };
        let age_seconds = now_epoch_seconds - created.0.timestamp();
        if age_seconds > REGISTRATION_TTL.as_secs() as i64
            && let Some(name) = registration.meta().name.clone()
        {
            registrations
                .delete(&name, &DeleteParams::default())
                .await
                .context(DeleteSnafu { name })?;
            deleted += 1;
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_name_is_stable_for_the_same_client_id() {
        assert_eq!(cluster_name("client-a"), cluster_name("client-a"));
        assert_ne!(cluster_name("client-a"), cluster_name("client-b"));
    }

    #[test]
    fn secret_name_embeds_client_random() {
        let a = secret_name("client-a", "rand1");
        let b = secret_name("client-a", "rand2");
        assert_ne!(a, b);
        assert!(a.ends_with("-rand1"));
    }

    #[test]
    fn is_older_or_equal_treats_missing_timestamps_as_eligible() {
        assert!(is_older_or_equal(&None, &None));
    }

    #[test]
    fn registration_secret_fields_write_all_seven_named_keys() {
        let fields = RegistrationSecretFields {
            token: "sa-token",
            deployment_namespace: "fleet-agent-c-abc123",
            cluster_namespace: "fleet-agent-c-abc123",
            cluster_name: "c-abc123",
            api_server_url: "https://management.example.com:6443",
            api_server_ca_base64: "LS0tLS1CRUdJTi0tLS0t",
            system_registration_namespace: "fleet-system-registration",
        };
        let data = fields.into_data();

        let get = |key: &str| String::from_utf8_lossy(&data.get(key).expect("key present").0).into_owned();
        assert_eq!(get(secret_keys::TOKEN), "sa-token");
        assert_eq!(get(secret_keys::DEPLOYMENT_NAMESPACE), "fleet-agent-c-abc123");
        assert_eq!(get(secret_keys::CLUSTER_NAMESPACE), "fleet-agent-c-abc123");
        assert_eq!(get(secret_keys::CLUSTER_NAME), "c-abc123");
        assert_eq!(get(secret_keys::API_SERVER_URL), "https://management.example.com:6443");
        assert_eq!(get(secret_keys::API_SERVER_CA), "LS0tLS1CRUdJTi0tLS0t");
        assert_eq!(get(secret_keys::SYSTEM_REGISTRATION_NAMESPACE), "fleet-system-registration");
        assert_eq!(data.len(), 7, "exactly the seven keys spec §6 names, no more, no less");
    }
}
