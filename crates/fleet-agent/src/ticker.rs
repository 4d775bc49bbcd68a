//! The cluster status ticker: every checkin interval, sample
//! local node capacity and patch it onto the management-plane `Cluster`
//! object's `status.agent`, skipping the write entirely when nothing
//! changed.

use fleet_api::crd::cluster::{Cluster, ClusterAgentStatus};
use kube::{Api, Client, api::{Patch, PatchParams}};
use rand::Rng;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list Nodes"))]
    ListNodes { source: kube::Error },

    #[snafu(display("failed to list Pods"))]
    ListPods { source: kube::Error },

    #[snafu(display("failed to patch Cluster {name} status"))]
    Patch { source: kube::Error, name: String },
}

impl Error {
    pub fn kind(&self) -> fleet_core::ErrorKind {
        fleet_core::ErrorKind::Transient
    }
}

/// Default checkin interval.
pub const DEFAULT_CHECKIN_INTERVAL_SECONDS: u64 = 15 * 60;

/// A snapshot of local node capacity and pod count. Pure
/// data so the "skip if unchanged" comparison and the sampling I/O stay
/// separate.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CapacitySnapshot {
    pub node_count: u32,
    pub cpu_millis_capacity: u64,
    pub memory_bytes_capacity: u64,
    pub pod_count: u32,
}

/// Build the `status.agent` patch body for one tick:
/// `None` means the new status is identical to `last` and the caller
/// should skip the write entirely.
pub fn build_patch(
    snapshot: &CapacitySnapshot,
    agent_namespace: &str,
    now_epoch_seconds: i64,
    last: Option<&ClusterAgentStatus>,
) -> Option<ClusterAgentStatus> {
    let new_status = ClusterAgentStatus {
        last_seen_epoch_seconds: now_epoch_seconds,
        agent_namespace: agent_namespace.to_owned(),
        node_count: snapshot.node_count,
        cpu_millis_capacity: snapshot.cpu_millis_capacity,
        memory_bytes_capacity: snapshot.memory_bytes_capacity,
        pod_count: snapshot.pod_count,
    };

    // Comparing with lastSeen zeroed out is what "diff is empty" means
    // in practice: lastSeen always differs tick to tick,
    // so the real question is whether anything *else* changed.
    let unchanged = last.is_some_and(|previous| {
        let mut previous_without_timestamp = previous.clone();
        previous_without_timestamp.last_seen_epoch_seconds = now_epoch_seconds;
        previous_without_timestamp == new_status
    });

    if unchanged { None } else { Some(new_status) }
}

/// Patch `cluster_name`'s `status.agent` with a fresh snapshot, skipping
/// the write if [`build_patch`] finds no change.
#[tracing::instrument(skip(client, snapshot), fields(cluster = %cluster_name))]
pub async fn tick(
    client: &Client,
    registration_namespace: &str,
    cluster_name: &str,
    agent_namespace: &str,
    snapshot: &CapacitySnapshot,
    now_epoch_seconds: i64,
) -> Result<(), Error> {
    let clusters: Api<Cluster> = Api::namespaced(client.clone(), registration_namespace);
    let current = clusters.get(cluster_name).await.context(PatchSnafu { name: cluster_name.to_owned() })?;
    let last = current.status.as_ref().and_then(|status| status.agent.as_ref());

    let Some(new_status) = build_patch(snapshot, agent_namespace, now_epoch_seconds, last) else {
        tracing::debug!("status.agent unchanged, skipping patch");
        return Ok(());
    };

    let patch = serde_json::json!({ "status": { "agent": new_status } });
    clusters
        .patch_status(cluster_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .context(PatchSnafu { name: cluster_name.to_owned() })?;
    Ok(())
}

/// Jitter a fixed interval by up to `fraction` of its length, so many
/// agents polling the same management plane don't thunder-herd on the
/// same wall-clock second.
pub fn jittered_interval(base: std::time::Duration, fraction: f64) -> std::time::Duration {
    let jitter_span = base.as_secs_f64() * fraction.clamp(0.0, 1.0);
    let offset = rand::rng().random_range(-jitter_span..=jitter_span);
    let seconds = (base.as_secs_f64() + offset).max(1.0);
    std::time::Duration::from_secs_f64(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_tick_always_writes() {
        let snapshot = CapacitySnapshot::default();
        assert!(build_patch(&snapshot, "c-1", 100, None).is_some());
    }

    #[test]
    fn unchanged_capacity_skips_the_write() {
        let snapshot = CapacitySnapshot {
            node_count: 3,
            cpu_millis_capacity: 1000,
            memory_bytes_capacity: 2_000_000,
            pod_count: 12,
        };
        let last = build_patch(&snapshot, "c-1", 100, None).expect("first tick writes");
        assert!(build_patch(&snapshot, "c-1", 200, Some(&last)).is_none());
    }

    #[test]
    fn changed_pod_count_writes_again() {
        let snapshot = CapacitySnapshot {
            pod_count: 12,
            ..Default::default()
        };
        let last = build_patch(&snapshot, "c-1", 100, None).expect("first tick writes");
        let changed = CapacitySnapshot {
            pod_count: 13,
            ..snapshot
        };
        assert!(build_patch(&changed, "c-1", 200, Some(&last)).is_some());
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = std::time::Duration::from_secs(900);
        for _ in 0..100 {
            let jittered = jittered_interval(base, 0.1);
            assert!(jittered.as_secs_f64() >= base.as_secs_f64() * 0.9 - 1.0);
            assert!(jittered.as_secs_f64() <= base.as_secs_f64() * 1.1 + 1.0);
        }
    }
}
