//! The Deploy handler: a state machine over
//! `status.appliedDeploymentID` that decides whether to wait, fail, or
//! install, then (on the I/O side) invokes the Helm backend and records
//! the result.
//!
//! Split in two, following a "handler-chain with status hooks"
//! reduction: [`decide`] is the pure planning function a reviewer can
//! read top-to-bottom; the actual Helm call and condition bookkeeping
//! live in [`finalize_install`] and the orchestration in
//! [`crate::deployer::run_deploy`].

use chrono::{DateTime, Utc};
use fleet_api::crd::deployment::{DeploymentSpec, DeploymentStatus, condition_types};
use fleet_core::condition;
use fleet_helm::{HelmError, InstallRequest, ReleaseInfo};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use snafu::Snafu;

use super::schedule::CronSchedule;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse schedule {cron:?}"))]
    InvalidSchedule { source: super::schedule::Error, cron: String },

    #[snafu(display("failed to compute the next fire time for schedule {cron:?}"))]
    NoNextFireTime { source: super::schedule::Error, cron: String },
}

/// What the orchestration layer should do next, decided purely from
/// `spec` and `status` with no I/O: each handler is a pure function of
/// (desired spec, last status).
#[derive(Debug)]
pub enum Decision {
    /// `spec.paused`: do nothing, report success without touching
    /// status.
    Paused,

    /// A schedule fire time was just computed and written; requeue after
    /// `delay`.
    Scheduled { status: DeploymentStatus, delay: std::time::Duration },

    /// `status.scheduledAt` is set and still in the future; requeue
    /// after the remaining `delay`.
    AwaitingWindow { delay: std::time::Duration },

    /// One or more `dependsOn` entries are unmet; status already
    /// records which. Not requeued on a timer — the caller re-drives
    /// this deployment when a sibling's readiness transitions.
    DependencyUnmet { status: DeploymentStatus },

    /// Ready to invoke the Helm backend. `release_name` and `namespace`
    /// are threaded back out because the caller builds the
    /// [`InstallRequest`] itself (`fleet-core` doesn't depend on
    /// `fleet-helm`, so this module can't build the request; see
    /// `crate::deployer::run_deploy`).
    Install { status: DeploymentStatus },
}

/// Step through the Deploy handler's state machine. `unmet_dependencies` is precomputed by the caller from a
/// sibling-deployment listing (I/O), keeping this function pure.
pub fn decide(
    spec: &DeploymentSpec,
    status: &DeploymentStatus,
    now: DateTime<Utc>,
    unmet_dependencies: &[String],
) -> Result<Decision, Error> {
    if spec.paused {
        return Ok(Decision::Paused);
    }

    if let Some(schedule_spec) = &spec.options.schedule {
        match status.scheduled_at_epoch_seconds {
            None => {
                let cron = CronSchedule::parse(&schedule_spec.cron).map_err(|source| Error::InvalidSchedule {
                    source,
                    cron: schedule_spec.cron.clone(),
                })?;
                let fire_at = cron.next_after(now).map_err(|source| Error::NoNextFireTime {
                    source,
                    cron: schedule_spec.cron.clone(),
                })?;
                let delay = (fire_at - now).to_std().unwrap_or(std::time::Duration::ZERO);

                let mut next_status = status.clone();
                next_status.scheduled_at_epoch_seconds = Some(fire_at.timestamp());
                set_condition(&mut next_status, condition_types::BUNDLE_SCHEDULED, true, "Scheduled", "waiting for next cron fire".to_owned(), now);
                set_condition(&mut next_status, condition_types::DEPLOYED, false, "Scheduled", "deployment deferred to schedule".to_owned(), now);
                return Ok(Decision::Scheduled { status: next_status, delay });
            }
            Some(scheduled_at) => {
                let scheduled_at = DateTime::from_timestamp(scheduled_at, 0).unwrap_or(now);
                if scheduled_at > now {
                    let delay = (scheduled_at - now).to_std().unwrap_or(std::time::Duration::ZERO);
                    return Ok(Decision::AwaitingWindow { delay });
                }
                // Either still within the window or missed it entirely
                // while disconnected (S3): both fall through to install
                // below, which clears the schedule unconditionally.
            }
        }
    }

    if !unmet_dependencies.is_empty() {
        let mut next_status = status.clone();
        next_status.unmet_dependencies = unmet_dependencies.to_vec();
        next_status.ready = false;
        set_condition(
            &mut next_status,
            condition_types::READY,
            false,
            "DependencyUnmet",
            format!("unmet dependencies: {}", unmet_dependencies.join(", ")),
            now,
        );
        return Ok(Decision::DependencyUnmet { status: next_status });
    }

    let mut next_status = status.clone();
    next_status.unmet_dependencies.clear();
    next_status.scheduled_at_epoch_seconds = None;
    Ok(Decision::Install { status: next_status })
}

/// Build the [`InstallRequest`] for a deployment whose `decide` call
/// returned [`Decision::Install`].
pub fn build_install_request(spec: &DeploymentSpec, release_name: String, namespace: String) -> InstallRequest {
    let helm = spec.options.helm.clone().unwrap_or_default();
    InstallRequest {
        release_name,
        namespace,
        chart_ref: helm.chart.unwrap_or_default(),
        values: helm.values,
        take_ownership: helm.take_ownership,
        atomic: helm.atomic,
        force: helm.force,
        wait_for_jobs: helm.wait_for_jobs,
        timeout_seconds: helm.timeout_seconds,
    }
}

/// Record the outcome of the Helm call against `status`.
pub fn finalize_install(
    mut status: DeploymentStatus,
    spec: &DeploymentSpec,
    result: &Result<ReleaseInfo, HelmError>,
    now: DateTime<Utc>,
) -> DeploymentStatus {
    match result {
        Ok(release) => {
            status.applied_deployment_id = Some(spec.deployment_id.clone());
            status.applied_force_sync_generation = spec.options.force_sync_generation;
            status.release = Some(format!("{}:{}", release.name, release.revision));
            set_condition(&mut status, condition_types::INSTALLED, true, "Installed", "helm install/upgrade succeeded".to_owned(), now);
            set_condition(&mut status, condition_types::DEPLOYED, true, "Deployed", "deployment applied".to_owned(), now);
        }
        Err(err) => {
            set_condition(&mut status, condition_types::INSTALLED, false, error_reason(err), err.to_string(), now);
            set_condition(&mut status, condition_types::READY, false, error_reason(err), err.to_string(), now);
            status.ready = false;
        }
    }
    status
}

fn error_reason(err: &HelmError) -> &'static str {
    match err {
        HelmError::ValidationFailure { .. } => "ValidationFailure",
        HelmError::KubeVersionMismatch { .. } => "KubeVersionMismatch",
        HelmError::ImmutableFieldUpdate { .. } => "ImmutableFieldUpdate",
        HelmError::TimedOutWaiting { .. } => "TimedOutWaiting",
        HelmError::AtomicRollback { .. } => "AtomicRollback",
        HelmError::YamlParse { .. } => "YamlParseError",
        HelmError::Transient { .. } | HelmError::ProcessFailed { .. } | HelmError::Spawn { .. } => "TransientError",
    }
}

fn set_condition(status: &mut DeploymentStatus, type_: &str, value: bool, reason: &str, message: String, now: DateTime<Utc>) {
    condition::set_condition(&mut status.conditions, type_, value, reason, message, 0, Time(now));
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use fleet_api::{crd::deployment::ScheduleSpec, fleet_yaml::BundleOptions};

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 2, 0, 0).single().expect("valid time")
    }

    fn spec() -> DeploymentSpec {
        DeploymentSpec {
            bundle_name: "b".to_owned(),
            bundle_namespace: "ns".to_owned(),
            content_keys: vec!["abc".to_owned()],
            options: Default::default(),
            deployment_id: "dep-1".to_owned(),
            paused: false,
            depends_on: vec![],
        }
    }

    fn with_schedule(schedule: ScheduleSpec) -> DeploymentSpec {
        DeploymentSpec {
            options: BundleOptions { schedule: Some(schedule), ..Default::default() },
            ..spec()
        }
    }

    #[test]
    fn paused_is_a_no_op() {
        let spec = DeploymentSpec { paused: true, ..spec() };
        let decision = decide(&spec, &DeploymentStatus::default(), now(), &[]).expect("decide");
        assert!(matches!(decision, Decision::Paused));
    }

    #[test]
    fn unset_schedule_is_computed_and_written() {
        let spec = with_schedule(ScheduleSpec { cron: "0 3 * * *".to_owned(), window: "1h".to_owned() });
        let decision = decide(&spec, &DeploymentStatus::default(), now(), &[]).expect("decide");
        match decision {
            Decision::Scheduled { status, .. } => {
                assert!(status.scheduled_at_epoch_seconds.is_some());
                assert!(condition::is_true(&status.conditions, condition_types::BUNDLE_SCHEDULED));
                assert!(condition::is_false(&status.conditions, condition_types::DEPLOYED));
            }
            other => panic!("expected Scheduled, got {other:?}"),
        }
    }

    #[test]
    fn future_schedule_requeues_remaining_delay() {
        let spec = with_schedule(ScheduleSpec { cron: "0 3 * * *".to_owned(), window: "1h".to_owned() });
        let fire_at = Utc.with_ymd_and_hms(2026, 1, 1, 3, 0, 0).single().expect("valid time");
        let status = DeploymentStatus {
            scheduled_at_epoch_seconds: Some(fire_at.timestamp()),
            ..Default::default()
        };
        let decision = decide(&spec, &status, now(), &[]).expect("decide");
        assert!(matches!(decision, Decision::AwaitingWindow { .. }));
    }

    #[test]
    fn missed_window_falls_through_to_install() {
        let spec = with_schedule(ScheduleSpec { cron: "0 3 * * *".to_owned(), window: "1h".to_owned() });
        // Scheduled at 03:00, now is 05:00: scheduledAt + 1h (04:00) < now.
        let fire_at = Utc.with_ymd_and_hms(2026, 1, 1, 3, 0, 0).single().expect("valid time");
        let disconnected_now = Utc.with_ymd_and_hms(2026, 1, 1, 5, 0, 0).single().expect("valid time");
        let status = DeploymentStatus {
            scheduled_at_epoch_seconds: Some(fire_at.timestamp()),
            ..Default::default()
        };
        let decision = decide(&spec, &status, disconnected_now, &[]).expect("decide");
        assert!(matches!(decision, Decision::Install { .. }));
    }

    #[test]
    fn unmet_dependency_blocks_install() {
        let decision = decide(&spec(), &DeploymentStatus::default(), now(), &["sibling".to_owned()]).expect("decide");
        match decision {
            Decision::DependencyUnmet { status } => {
                assert_eq!(status.unmet_dependencies, vec!["sibling".to_owned()]);
                assert!(!status.ready);
            }
            other => panic!("expected DependencyUnmet, got {other:?}"),
        }
    }

    #[test]
    fn successful_install_sets_applied_deployment_id() {
        let release = Ok(ReleaseInfo { name: "r".to_owned(), revision: 1, namespace: "ns".to_owned() });
        let status = finalize_install(DeploymentStatus::default(), &spec(), &release, now());
        assert_eq!(status.applied_deployment_id.as_deref(), Some("dep-1"));
        assert!(condition::is_true(&status.conditions, condition_types::INSTALLED));
    }

    #[test]
    fn non_transient_failure_does_not_set_applied_deployment_id() {
        let err = Err(HelmError::ImmutableFieldUpdate { resource: "svc".to_owned(), field: "clusterIP".to_owned() });
        let status = finalize_install(DeploymentStatus::default(), &spec(), &err, now());
        assert!(status.applied_deployment_id.is_none());
        assert!(condition::is_false(&status.conditions, condition_types::INSTALLED));
        assert!(!status.ready);
    }
}
