//! The structured `HelmError` taxonomy: an
//! explicit enum match over known failure shapes rather than a
//! string-regex match against Helm's free-text output, per the
//! teacher's preference for structured-over-stringly-typed error
//! handling (its `validation.rs` is grounded the same way). Each
//! variant maps to one of [`fleet_core::ErrorKind`]'s six kinds via
//! [`HelmError::kind`].

use fleet_core::ErrorKind;
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum HelmError {
    #[snafu(display("helm chart validation failed: {message}"))]
    ValidationFailure { message: String },

    #[snafu(display("chart requires kubeVersion {required}, cluster reports {actual}"))]
    KubeVersionMismatch { required: String, actual: String },

    #[snafu(display("cannot update immutable field {field} on {resource}"))]
    ImmutableFieldUpdate { resource: String, field: String },

    #[snafu(display("timed out waiting for {resource} to become ready after {timeout_seconds}s"))]
    TimedOutWaiting {
        resource: String,
        timeout_seconds: u64,
    },

    #[snafu(display("release {release} failed and was rolled back (atomic)"))]
    AtomicRollback { release: String },

    #[snafu(display("failed to parse rendered manifest YAML: {message}"))]
    YamlParse { message: String },

    #[snafu(display("network or API-server error running helm: {message}"))]
    Transient { message: String },

    #[snafu(display("helm process exited with status {status}: {stderr}"))]
    ProcessFailed { status: i32, stderr: String },

    #[snafu(display("failed to spawn helm process"))]
    Spawn { source: std::io::Error },
}

impl HelmError {
    /// Classify this error against the six kinds, driving the
    /// Deploy handler's "known class of non-transient errors... do not
    /// requeue" rule.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HelmError::ValidationFailure { .. }
            | HelmError::KubeVersionMismatch { .. }
            | HelmError::ImmutableFieldUpdate { .. }
            | HelmError::TimedOutWaiting { .. }
            | HelmError::AtomicRollback { .. }
            | HelmError::YamlParse { .. } => ErrorKind::InstallationNonTransient,
            HelmError::Transient { .. } | HelmError::ProcessFailed { .. } | HelmError::Spawn { .. } => {
                ErrorKind::Transient
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_failure_shapes_are_non_transient() {
        let err = HelmError::ImmutableFieldUpdate {
            resource: "Service/my-svc".to_owned(),
            field: "spec.clusterIP".to_owned(),
        };
        assert_eq!(err.kind(), ErrorKind::InstallationNonTransient);
    }

    #[test]
    fn process_errors_are_transient_by_default() {
        let err = HelmError::ProcessFailed {
            status: 1,
            stderr: "connection refused".to_owned(),
        };
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
}
