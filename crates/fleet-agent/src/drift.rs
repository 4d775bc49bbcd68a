//! The drift trigger: a lightweight watch multiplexer over
//! the live GVKs each deployment's release actually touches, so a
//! manual edit anywhere in a release wakes the Monitor handler instead
//! of waiting for the next poll.
//!
//! Watches are reference-counted across deployments (many deployments
//! commonly share a GVK like `Deployment` or `ConfigMap`): the table
//! tracks not just "is this GVK watched" but "which live objects of
//! this GVK does which Fleet `Deployment` currently claim", so a single
//! shared per-GVK watch stream can route an event to exactly the
//! deployments that own the object it's about.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use dashmap::DashMap;
use fleet_core::workqueue::WorkQueue;
use futures::StreamExt;
use kube::{
    Client,
    api::{Api, DynamicObject},
    core::GroupVersionKind,
    discovery::Discovery,
    runtime::{WatchStreamExt, watcher},
};

/// A Fleet `Deployment`'s identity as a work queue key.
pub type DeploymentKey = (String, String);

/// A live object's identity, namespace-scoped.
pub type ObjectKey = (String, String);

/// Group-version-kind identity. A small value type of our own rather
/// than reusing `kube`'s discovery types directly, so the refcounting
/// policy in [`RefCounts`] stays unit-testable without a live API
/// server or `Discovery` run.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(api_version: &str, kind: &str) -> Self {
        let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
        Gvk {
            group: group.to_owned(),
            version: version.to_owned(),
            kind: kind.to_owned(),
        }
    }

    fn to_group_version_kind(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }
}

/// Pure reference-counting policy, separated from the concurrent `DashMap`
/// the live trigger uses so the acquire/release arithmetic itself is
/// trivially testable.
#[derive(Debug, Default)]
pub struct RefCounts {
    counts: HashMap<Gvk, usize>,
}

impl RefCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// One more claim against `gvk`. Returns `true` the first time (the
    /// caller should start a watch).
    pub fn acquire(&mut self, gvk: Gvk) -> bool {
        let count = self.counts.entry(gvk).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// One fewer claim against `gvk`. Returns `true` once the count
    /// reaches zero (the caller should tear down the watch). A release
    /// for an unknown GVK is a no-op, never `true`.
    pub fn release(&mut self, gvk: &Gvk) -> bool {
        let Some(count) = self.counts.get_mut(gvk) else {
            return false;
        };
        *count = count.saturating_sub(1);
        let drained = *count == 0;
        if drained {
            self.counts.remove(gvk);
        }
        drained
    }

    pub fn watched_gvks(&self) -> Vec<Gvk> {
        self.counts.keys().cloned().collect()
    }
}

/// Diff a deployment's previous object claim set against its freshly
/// computed one: objects no longer
/// present should be released, newly-present ones acquired. Pure so the
/// "only the delta moves" behavior is directly testable.
pub fn diff_claims(previous: &HashSet<(Gvk, ObjectKey)>, desired: &HashSet<(Gvk, ObjectKey)>) -> (Vec<(Gvk, ObjectKey)>, Vec<(Gvk, ObjectKey)>) {
    let to_acquire = desired.difference(previous).cloned().collect();
    let to_release = previous.difference(desired).cloned().collect();
    (to_acquire, to_release)
}

struct WatchEntry {
    refcount: usize,
    stop: tokio::sync::watch::Sender<bool>,
}

/// The live multiplexer: a `DashMap<Gvk, WatchHandle>`,
/// read-mostly on the hot path (checking whether a GVK is already
/// watched) so `DashMap`'s sharded locking avoids contending a single
/// `RwLock` across every deployment's reconcile.
pub struct DriftTrigger {
    watches: DashMap<Gvk, WatchEntry>,
    owners: Arc<DashMap<(Gvk, ObjectKey), HashSet<DeploymentKey>>>,
    claimed_by_deployment: DashMap<DeploymentKey, HashSet<(Gvk, ObjectKey)>>,
    client: Client,
    queue: Arc<WorkQueue<DeploymentKey>>,
}

impl DriftTrigger {
    pub fn new(client: Client, queue: Arc<WorkQueue<DeploymentKey>>) -> Self {
        Self {
            watches: DashMap::new(),
            owners: Arc::new(DashMap::new()),
            claimed_by_deployment: DashMap::new(),
            client,
            queue,
        }
    }

    /// Update which live objects `deployment` claims, starting or
    /// tearing down per-GVK watches as the claim set's membership in
    /// [`RefCounts`]-equivalent bookkeeping crosses zero.
    /// Called once per Monitor pass with the release's current object
    /// set (the `ObjectRef`s in its dry-run plan's every bucket).
    pub fn reconcile_claims(&self, deployment: DeploymentKey, namespace: &str, desired_objects: &[(Gvk, String)]) {
        let desired: HashSet<(Gvk, ObjectKey)> = desired_objects
            .iter()
            .map(|(gvk, name)| (gvk.clone(), (namespace.to_owned(), name.clone())))
            .collect();
        let previous = self.claimed_by_deployment.get(&deployment).map(|entry| entry.clone()).unwrap_or_default();

        let (to_acquire, to_release) = diff_claims(&previous, &desired);

        for (gvk, object_key) in to_acquire {
            self.owners.entry((gvk.clone(), object_key.clone())).or_default().insert(deployment.clone());
            self.ensure_watch(gvk, namespace.to_owned());
        }
        for (gvk, object_key) in to_release {
            let owner_key = (gvk.clone(), object_key.clone());
            let mut drained = false;
            if let Some(mut owners) = self.owners.get_mut(&owner_key) {
                owners.remove(&deployment);
                drained = owners.is_empty();
            }
            if drained {
                self.owners.remove(&owner_key);
                self.maybe_teardown(&gvk);
            }
        }

        if desired.is_empty() {
            self.claimed_by_deployment.remove(&deployment);
        } else {
            self.claimed_by_deployment.insert(deployment, desired);
        }
    }

    fn ensure_watch(&self, gvk: Gvk, namespace: String) {
        if let Some(mut entry) = self.watches.get_mut(&gvk) {
            entry.refcount += 1;
            return;
        }
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        self.watches.insert(gvk.clone(), WatchEntry { refcount: 1, stop: stop_tx });
        spawn_watch_task(self.client.clone(), gvk, namespace, self.queue.clone(), self.owners.clone(), stop_rx);
    }

    fn maybe_teardown(&self, gvk: &Gvk) {
        let should_remove = match self.watches.get_mut(gvk) {
            Some(mut entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.refcount == 0
            }
            None => false,
        };
        if should_remove && let Some((_, entry)) = self.watches.remove(gvk) {
            let _ = entry.stop.send(true);
        }
    }

    pub fn watched_gvk_count(&self) -> usize {
        self.watches.len()
    }
}

/// Spawn the actual `kube::runtime::watcher` stream for one GVK,
/// enqueuing every owning deployment found in `owners` whenever an
/// event names an object this trigger has a claim on. Stops once `stop` fires.
fn spawn_watch_task(
    client: Client,
    gvk: Gvk,
    namespace: String,
    queue: Arc<WorkQueue<DeploymentKey>>,
    owners: Arc<DashMap<(Gvk, ObjectKey), HashSet<DeploymentKey>>>,
    mut stop: tokio::sync::watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let discovery = match Discovery::new(client.clone()).run().await {
            Ok(discovery) => discovery,
            Err(error) => {
                tracing::warn!(%error, ?gvk, "failed to run discovery for drift watch");
                return;
            }
        };
        let Some((api_resource, _capabilities)) = discovery.resolve_gvk(&gvk.to_group_version_kind()) else {
            tracing::warn!(?gvk, "no API resource found for watched GVK, skipping");
            return;
        };
        let api: Api<DynamicObject> = Api::namespaced_with(client, &namespace, &api_resource);
        let mut events = watcher(api, watcher::Config::default()).touched_objects().boxed();

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return;
                    }
                }
                next = events.next() => {
                    let Some(result) = next else { return };
                    let Ok(object) = result else { continue };
                    let Some(name) = object.metadata.name.clone() else { continue };
                    let key = (gvk.clone(), (namespace.clone(), name));
                    if let Some(owning_deployments) = owners.get(&key) {
                        for deployment in owning_deployments.iter() {
                            queue.enqueue(deployment.clone());
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gvk(kind: &str) -> Gvk {
        Gvk::new("apps/v1", kind)
    }

    #[test]
    fn first_acquire_reports_a_fresh_watch_is_needed() {
        let mut counts = RefCounts::new();
        assert!(counts.acquire(gvk("Deployment")));
        assert!(!counts.acquire(gvk("Deployment")), "a second acquire shares the existing watch");
    }

    #[test]
    fn release_tears_down_only_once_the_count_is_drained() {
        let mut counts = RefCounts::new();
        counts.acquire(gvk("Deployment"));
        counts.acquire(gvk("Deployment"));
        assert!(!counts.release(&gvk("Deployment")), "one remaining claim keeps the watch alive");
        assert!(counts.release(&gvk("Deployment")), "the last claim tears it down");
    }

    #[test]
    fn release_of_an_unwatched_gvk_is_a_no_op() {
        let mut counts = RefCounts::new();
        assert!(!counts.release(&gvk("Secret")));
    }

    #[test]
    fn diff_claims_separates_additions_from_removals() {
        let previous: HashSet<(Gvk, ObjectKey)> = HashSet::from([(gvk("Deployment"), ("ns".to_owned(), "app".to_owned()))]);
        let desired: HashSet<(Gvk, ObjectKey)> = HashSet::from([(gvk("Deployment"), ("ns".to_owned(), "app2".to_owned()))]);
        let (to_acquire, to_release) = diff_claims(&previous, &desired);
        assert_eq!(to_acquire, vec![(gvk("Deployment"), ("ns".to_owned(), "app2".to_owned()))]);
        assert_eq!(to_release, vec![(gvk("Deployment"), ("ns".to_owned(), "app".to_owned()))]);
    }

    #[test]
    fn unchanged_claims_produce_no_diff() {
        let set: HashSet<(Gvk, ObjectKey)> = HashSet::from([(gvk("ConfigMap"), ("ns".to_owned(), "cm".to_owned()))]);
        let (to_acquire, to_release) = diff_claims(&set, &set);
        assert!(to_acquire.is_empty());
        assert!(to_release.is_empty());
    }

    #[test]
    fn gvk_splits_group_and_version_from_api_version() {
        let g = Gvk::new("apps/v1", "Deployment");
        assert_eq!(g.group, "apps");
        assert_eq!(g.version, "v1");
        let core = Gvk::new("v1", "ConfigMap");
        assert_eq!(core.group, "");
        assert_eq!(core.version, "v1");
    }
}
