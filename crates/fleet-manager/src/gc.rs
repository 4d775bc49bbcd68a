//! Content garbage collection: every 5 minutes, reclaims
//! blobs no longer referenced by any deployment or bundle record, via a
//! two-pass mark/sweep that tolerates the ingester creating a
//! bundle+content pair non-atomically.
//!
//! The mark is in-memory, scoped to the GC task's lifetime.

use std::{
    collections::{HashMap, HashSet},
    time::Instant,
};

use fleet_api::{Bundle, Deployment};
use fleet_content::store::ContentStore;
use kube::{Api, Client, ResourceExt, api::ListParams};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list Deployments"))]
    ListDeployments { source: kube::Error },

    #[snafu(display("failed to list Bundles"))]
    ListBundles { source: kube::Error },

    #[snafu(display("failed to list content keys"))]
    ListContent { source: fleet_content::store::Error },

    #[snafu(display("failed to delete orphaned content {key}"))]
    Delete {
        source: fleet_content::store::Error,
        key: String,
    },
}

impl Error {
    pub fn kind(&self) -> fleet_core::ErrorKind {
        fleet_core::ErrorKind::Transient
    }
}

/// Tracks content keys suspected orphaned, and since when. A key marked
/// on one pass and still unreferenced on the next is deleted; a key that
/// becomes referenced again before its second pass clears its mark.
#[derive(Debug, Default)]
pub struct ContentGc {
    marked: HashMap<String, Instant>,
}

impl ContentGc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one pass given the full set of referenced keys (current +
    /// staged, invariant: "a content blob is garbage-collectable
    /// iff no deployment references it either as its current or staged
    /// manifest") and every key presently stored. Returns the keys
    /// deleted this pass. `now` is threaded in for deterministic tests.
    pub fn sweep(&mut self, referenced: &HashSet<String>, stored: &[String], now: Instant) -> Vec<String> {
        let mut deleted = Vec::new();

        for key in stored {
            if referenced.contains(key) {
                self.marked.remove(key);
                continue;
            }
            if self.marked.contains_key(key) {
                deleted.push(key.clone());
            } else {
                self.marked.insert(key.clone(), now);
            }
        }

        for key in &deleted {
            self.marked.remove(key);
        }

        // Forget marks for keys no longer stored at all (deleted out from
        // under us by something else, or never real to begin with).
        let stored_set: HashSet<&str> = stored.iter().map(String::as_str).collect();
        self.marked.retain(|key, _| stored_set.contains(key.as_str()));

        deleted
    }
}

/// Collect every content key referenced by any `Deployment` (current) or
/// `Bundle` (staged) record across all namespaces.
#[tracing::instrument(skip(client))]
pub async fn referenced_content_keys(client: &Client) -> Result<HashSet<String>, Error> {
    let deployments_api: Api<Deployment> = Api::all(client.clone());
    let deployments = deployments_api.list(&ListParams::default()).await.context(ListDeploymentsSnafu)?;

    let bundles_api: Api<Bundle> = Api::all(client.clone());
    let bundles = bundles_api.list(&ListParams::default()).await.context(ListBundlesSnafu)?;

    let mut keys = HashSet::new();
    for deployment in &deployments.items {
        keys.extend(deployment.spec.content_keys.iter().cloned());
    }
    for bundle in &bundles.items {
        keys.extend(bundle.spec.content_keys.iter().cloned());
    }
    Ok(keys)
}

/// Run one full GC pass: gather references, list stored content, sweep,
/// and delete whatever the sweep marked for deletion.
#[tracing::instrument(skip(client, content_store, gc))]
pub async fn run_pass(client: &Client, content_store: &dyn ContentStore, gc: &mut ContentGc, now: Instant) -> Result<Vec<String>, Error> {
    let referenced = referenced_content_keys(client).await?;
    let stored = content_store.list_keys().await.context(ListContentSnafu)?;

    let to_delete = gc.sweep(&referenced, &stored, now);
    for key in &to_delete {
        content_store.delete(key).await.context(DeleteSnafu { key: key.clone() })?;
    }
    Ok(to_delete)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn set(keys: &[&str]) -> HashSet<String> {
        keys.iter().map(|s| (*s).to_owned()).collect()
    }

    fn list(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn unreferenced_key_is_deleted_only_on_the_second_pass() {
        let mut gc = ContentGc::new();
        let t0 = Instant::now();

        let deleted = gc.sweep(&set(&[]), &list(&["orphan"]), t0);
        assert!(deleted.is_empty(), "first pass only marks");

        let deleted = gc.sweep(&set(&[]), &list(&["orphan"]), t0 + Duration::from_secs(1));
        assert_eq!(deleted, vec!["orphan".to_owned()]);
    }

    #[test]
    fn a_key_referenced_again_between_passes_clears_its_mark() {
        let mut gc = ContentGc::new();
        let t0 = Instant::now();

        gc.sweep(&set(&[]), &list(&["k"]), t0);
        // The ingester finishes creating the owning bundle before the
        // second pass runs: "k" becomes referenced again.
        let deleted = gc.sweep(&set(&["k"]), &list(&["k"]), t0 + Duration::from_secs(1));
        assert!(deleted.is_empty());

        // A later pass with "k" unreferenced again starts the two-pass
        // mark over from scratch rather than deleting immediately.
        let deleted = gc.sweep(&set(&[]), &list(&["k"]), t0 + Duration::from_secs(2));
        assert!(deleted.is_empty());
    }

    #[test]
    fn referenced_content_is_never_deleted_across_a_two_pass_interval() {
        let mut gc = ContentGc::new();
        let t0 = Instant::now();
        for i in 0..5 {
            let deleted = gc.sweep(&set(&["always-referenced"]), &list(&["always-referenced"]), t0 + Duration::from_secs(i));
            assert!(deleted.is_empty());
        }
    }
}
