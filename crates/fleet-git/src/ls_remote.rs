//! `ls-remote` polling: resolve the current commit
//! for a branch/revision without cloning, so an unchanged source makes
//! no write at all.

use snafu::{ResultExt, Snafu};

use crate::credentials::{CredentialSource, ResolvedCredential};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to resolve credentials for {url}"))]
    Credentials {
        source: crate::credentials::Error,
        url: String,
    },

    #[snafu(display("failed to create in-memory remote for {url}"))]
    CreateRemote { source: git2::Error, url: String },

    #[snafu(display("failed to connect to {url}"))]
    Connect { source: git2::Error, url: String },

    #[snafu(display("failed to list references on {url}"))]
    ListReferences { source: git2::Error, url: String },

    #[snafu(display("ref {reference} not found on {url}"))]
    RefNotFound { reference: String, url: String },

    #[snafu(display("blocking ls-remote task panicked"))]
    Join { source: tokio::task::JoinError },
}

/// Resolve `branch_or_revision` to a commit SHA on `repo_url`. If the
/// reference looks like a full commit SHA already (40 hex chars) it is
/// returned unchanged — a pinned revision never needs resolving.
#[tracing::instrument(skip(credentials), fields(repo_url))]
pub async fn resolve_commit(
    repo_url: &str,
    branch_or_revision: &str,
    credentials: &CredentialSource,
) -> Result<String, Error> {
    if looks_like_commit_sha(branch_or_revision) {
        return Ok(branch_or_revision.to_owned());
    }

    let resolved = credentials
        .resolve()
        .await
        .context(CredentialsSnafu { url: repo_url.to_owned() })?;

    let url = repo_url.to_owned();
    let reference = branch_or_revision.to_owned();
    tokio::task::spawn_blocking(move || resolve_commit_blocking(&url, &reference, &resolved))
        .await
        .context(JoinSnafu)?
}

fn resolve_commit_blocking(
    url: &str,
    reference: &str,
    credential: &ResolvedCredential,
) -> Result<String, Error> {
    let mut remote = git2::Remote::create_detached(url).context(CreateRemoteSnafu { url })?;

    let mut callbacks = git2::RemoteCallbacks::new();
    let credential = credential.clone();
    callbacks.credentials(move |_url, username, _allowed| {
        credential
            .to_git2_cred()
            .or_else(|_| git2::Cred::username(username.unwrap_or("git")))
    });

    let connection = remote
        .connect_auth(git2::Direction::Fetch, Some(callbacks), None)
        .context(ConnectSnafu { url })?;

    let branch_ref = format!("refs/heads/{reference}");
    let tag_ref = format!("refs/tags/{reference}");
    let heads = connection.list().context(ListReferencesSnafu { url })?;

    for head in heads {
        if head.name() == branch_ref || (reference == "HEAD" && head.name() == "HEAD") {
            return Ok(head.oid().to_string());
        }
    }
    for head in heads {
        if head.name() == tag_ref {
            return Ok(head.oid().to_string());
        }
    }

    RefNotFoundSnafu {
        reference: reference.to_owned(),
        url: url.to_owned(),
    }
    .fail()
}

fn looks_like_commit_sha(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_full_shas() {
        assert!(looks_like_commit_sha(&"a".repeat(40)));
        assert!(!looks_like_commit_sha("main"));
        assert!(!looks_like_commit_sha(&"a".repeat(39)));
    }
}
