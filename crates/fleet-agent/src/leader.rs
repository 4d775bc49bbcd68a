//! Leader election: "the agent process uses a distributed
//! lease on its local cluster to guarantee single-writer semantics for
//! status updates. Loss of leadership terminates the process so the
//! leader-elector restarts cleanly."
//!
//! The reconciliation logic never depends on *how* leadership is held —
//! only on whether it still is — so it is expressed behind a small
//! trait rather than threading `kube::runtime::lease` call sites through
//! every handler.

use async_trait::async_trait;

/// Is this process still the single writer for its cluster's status
/// updates? `lost` resolves once leadership is confirmed gone; callers
/// await it alongside their normal work and exit the process when it
/// fires.
#[async_trait]
pub trait LeaderGuard: Send + Sync {
    /// True while this process still holds the lease.
    fn is_leader(&self) -> bool;

    /// Resolves once the lease is confirmed lost. Never resolves while
    /// leadership holds.
    async fn lost(&self);
}

/// A guard that always holds leadership and never loses it — the
/// single-process-per-cluster topology single-node development and
/// tests run under, where a real `kube::runtime::Lease` would require a
/// live API server.
pub struct AlwaysLeader;

#[async_trait]
impl LeaderGuard for AlwaysLeader {
    fn is_leader(&self) -> bool {
        true
    }

    async fn lost(&self) {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn always_leader_never_resolves_lost_within_a_short_window() {
        let guard = AlwaysLeader;
        assert!(guard.is_leader());
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(20), guard.lost())
            .await
            .is_err();
        assert!(timed_out, "AlwaysLeader must never report lost leadership");
    }
}
