//! The three credential shapes : HTTP basic, SSH key
//! pair + known-hosts, and GitHub App (id + installation-id + private
//! key PEM, minted into a short-lived installation token). Resolution is
//! async (GitHub App requires a network round-trip); the result is a
//! plain, `Send`-able [`ResolvedCredential`] that the blocking
//! `git2` clone/ls-remote callbacks can turn into a `git2::Cred` without
//! themselves needing to be async.

use std::path::PathBuf;

use snafu::{ResultExt, Snafu};

use crate::github_app;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to mint a GitHub App installation token"))]
    GitHubApp { source: github_app::Error },
}

/// Read from the source's credential secret before the
/// clone/ls-remote attempt.
#[derive(Clone, Debug)]
pub enum CredentialSource {
    Basic {
        username: String,
        password: String,
    },
    Ssh {
        username: String,
        private_key: PathBuf,
        passphrase: Option<String>,
        /// Path to a `known_hosts`-formatted file. Built from the
        /// secret's `known_hosts` key if present; otherwise the caller
        /// is expected to have populated it via `ssh-keyscan` into the
        /// fixed env-referenced path.
        known_hosts: PathBuf,
    },
    GitHubApp {
        app_id: u64,
        installation_id: u64,
        private_key_pem: String,
    },
    /// No credential secret configured; anonymous HTTPS access.
    Anonymous,
}

/// A credential with any network-dependent minting already done,
/// ready to be handed to libgit2 on a blocking thread.
#[derive(Clone, Debug)]
pub enum ResolvedCredential {
    UserPass {
        username: String,
        password: String,
    },
    Ssh {
        username: String,
        private_key: PathBuf,
        passphrase: Option<String>,
    },
    Anonymous,
}

impl CredentialSource {
    /// Resolve to a [`ResolvedCredential`], minting a fresh GitHub App
    /// installation token if needed. Called once per clone/ls-remote
    /// attempt, before the blocking libgit2 work begins — installation
    /// tokens are short-lived by design, so each attempt gets a fresh
    /// one rather than a cached one.
    pub async fn resolve(&self) -> Result<ResolvedCredential, Error> {
        match self {
            CredentialSource::Basic { username, password } => Ok(ResolvedCredential::UserPass {
                username: username.clone(),
                password: password.clone(),
            }),
            CredentialSource::Ssh {
                username,
                private_key,
                passphrase,
                ..
            } => Ok(ResolvedCredential::Ssh {
                username: username.clone(),
                private_key: private_key.clone(),
                passphrase: passphrase.clone(),
            }),
            CredentialSource::GitHubApp {
                app_id,
                installation_id,
                private_key_pem,
            } => {
                let token = github_app::mint_installation_token(*app_id, *installation_id, private_key_pem)
                    .await
                    .context(GitHubAppSnafu)?;
                Ok(ResolvedCredential::UserPass {
                    username: "x-access-token".to_owned(),
                    password: token,
                })
            }
            CredentialSource::Anonymous => Ok(ResolvedCredential::Anonymous),
        }
    }

    /// Path to the `known_hosts` file, if this credential is SSH-based.
    pub fn known_hosts_path(&self) -> Option<&std::path::Path> {
        match self {
            CredentialSource::Ssh { known_hosts, .. } => Some(known_hosts),
            _ => None,
        }
    }
}

impl ResolvedCredential {
    pub fn to_git2_cred(&self) -> Result<git2::Cred, git2::Error> {
        match self {
            ResolvedCredential::UserPass { username, password } => {
                git2::Cred::userpass_plaintext(username, password)
            }
            ResolvedCredential::Ssh {
                username,
                private_key,
                passphrase,
            } => git2::Cred::ssh_key(username, None, private_key, passphrase.as_deref()),
            ResolvedCredential::Anonymous => git2::Cred::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn basic_credentials_resolve_without_network() {
        let source = CredentialSource::Basic {
            username: "git".to_owned(),
            password: "token".to_owned(),
        };
        let resolved = source.resolve().await.expect("resolve");
        assert!(matches!(resolved, ResolvedCredential::UserPass { .. }));
    }

    #[tokio::test]
    async fn anonymous_resolves() {
        let resolved = CredentialSource::Anonymous.resolve().await.expect("resolve");
        assert!(matches!(resolved, ResolvedCredential::Anonymous));
    }
}
