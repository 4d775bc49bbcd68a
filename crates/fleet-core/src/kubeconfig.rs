//! Hand-serialized kubeconfig fragments. `kube::Config` only knows how to
//! *consume* a kubeconfig, not produce one, so the well-known YAML shape
//! is built directly with `serde_yaml` rather than round-tripping
//! through a type meant for the opposite direction.
//!
//! Shared by `fleet-manager::registration` (minting the agent's scoped
//! kubeconfig) and `fleet-agent::bootstrap` (the agent's own client needs
//! the same shape to talk to the management plane during the join
//! handshake, before it holds that minted kubeconfig).

use serde::Serialize;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize kubeconfig fragment"))]
    Serialize { source: serde_yaml::Error },
}

/// Everything needed to render a single-cluster, single-user kubeconfig
/// scoped to one token.
pub struct KubeconfigParams<'a> {
    pub cluster_name: &'a str,
    pub api_server_url: &'a str,
    pub api_server_ca_base64: &'a str,
    pub namespace: &'a str,
    pub token: &'a str,
}

#[derive(Serialize)]
struct Config {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    clusters: Vec<NamedCluster>,
    contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    current_context: String,
    users: Vec<NamedUser>,
}

#[derive(Serialize)]
struct NamedCluster {
    name: String,
    cluster: Cluster,
}

#[derive(Serialize)]
struct Cluster {
    server: String,
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: String,
}

#[derive(Serialize)]
struct NamedContext {
    name: String,
    context: Context,
}

#[derive(Serialize)]
struct Context {
    cluster: String,
    namespace: String,
    user: String,
}

#[derive(Serialize)]
struct NamedUser {
    name: String,
    user: User,
}

#[derive(Serialize)]
struct User {
    token: String,
}

/// Render a minimal kubeconfig document scoped to one namespace.
pub fn render(params: &KubeconfigParams<'_>) -> Result<String, Error> {
    let context_name = format!("{}-context", params.cluster_name);
    let user_name = format!("{}-user", params.cluster_name);

    let config = Config {
        api_version: "v1",
        kind: "Config",
        clusters: vec![NamedCluster {
            name: params.cluster_name.to_owned(),
            cluster: Cluster {
                server: params.api_server_url.to_owned(),
                certificate_authority_data: params.api_server_ca_base64.to_owned(),
            },
        }],
        contexts: vec![NamedContext {
            name: context_name.clone(),
            context: Context {
                cluster: params.cluster_name.to_owned(),
                namespace: params.namespace.to_owned(),
                user: user_name.clone(),
            },
        }],
        current_context: context_name,
        users: vec![NamedUser {
            name: user_name,
            user: User { token: params.token.to_owned() },
        }],
    };

    serde_yaml::to_string(&config).context(SerializeSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_a_single_cluster_single_user_document() {
        let params = KubeconfigParams {
            cluster_name: "c-abc123",
            api_server_url: "https://management.example.com:6443",
            api_server_ca_base64: "LS0tLS1CRUdJTi0tLS0t",
            namespace: "c-abc123",
            token: "sa-token",
        };
        let yaml = render(&params).expect("render");
        assert!(yaml.contains("apiVersion: v1"));
        assert!(yaml.contains("server: https://management.example.com:6443"));
        assert!(yaml.contains("token: sa-token"));
        assert!(yaml.contains("namespace: c-abc123"));
    }
}
