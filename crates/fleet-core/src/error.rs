//! The shared error-kind taxonomy: every crate-local `snafu`
//! error enum implements `fn kind(&self) -> ErrorKind` so the work queue
//! and condition-writer dispatch off one small, closed set rather than
//! ad hoc string matching against error messages.

/// The six error kinds, each with a distinct retry and
/// surfacing policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum ErrorKind {
    /// Network, optimistic-concurrency conflict, upstream not-ready:
    /// swallow and requeue with exponential back-off, never surfaced to
    /// the user.
    Transient,

    /// Invalid `fleet.yaml`, unresolvable chart version, invalid
    /// selector regex: surfaced on `Accepted=false` with a message; no
    /// retry until the spec changes.
    Configuration,

    /// Helm validation failure, immutable-field conflict, kubeVersion
    /// mismatch, wait timeout, atomic rollback: surfaced on
    /// `Installed=false` and `Ready=false`; not retried (would loop
    /// forever).
    InstallationNonTransient,

    /// Live state differs from desired: surfaced on `Ready=false` with
    /// the first N offending resources; retried on a drift-trigger
    /// signal, not on a timer.
    Drift,

    /// A `dependsOn` entry is not yet `Ready=true`: surfaced on
    /// `Ready=false`; retried when any sibling deployment's readiness
    /// transitions.
    DependencyUnmet,

    /// Process-level: leader lost, bootstrap secret missing after a
    /// probe. The process exits; the orchestrator restarts it.
    Fatal,
}

impl ErrorKind {
    /// Should the work queue requeue this error automatically? Only
    /// [`ErrorKind::Transient`] gets unconditional requeue-with-backoff;
    /// `Drift` and `DependencyUnmet` requeue only on their respective
    /// external signals (drift-trigger event, sibling readiness
    /// transition), which callers arrange separately rather than via
    /// this generic policy.
    pub fn requeues_with_backoff(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }

    /// Should this error be surfaced on the object's status conditions?
    pub fn is_user_facing(self) -> bool {
        !matches!(self, ErrorKind::Transient | ErrorKind::Fatal)
    }
}
