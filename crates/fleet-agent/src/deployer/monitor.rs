//! The Monitor handler: re-reads a
//! release's plan, normalizes it against the deployment's diff
//! configuration, summarizes per-object health, and writes
//! `ready`/`modified`/`nonReadyStatus`/`modifiedStatus`.
//!
//! Everything here is a pure function over an already-fetched [`Plan`]
//! and caller-supplied [`ObjectSummary`] list ("handler-chain
//! with status hooks": the I/O — dry-run apply, live-object health
//! lookups via the pluggable summarizer set — belongs to
//! `crate::deployer::run_monitor`; this module is where the specified
//! *decision* lives, and where property 6 (idempotence) is tested).

use chrono::{DateTime, Utc};
use fleet_api::{
    crd::deployment::{DeploymentStatus, condition_types},
    fleet_yaml::{ComparePatch, CorrectDriftOptions},
};
use fleet_core::condition;
use fleet_helm::{ModifiedObject, ObjectRef, Plan};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use regex::Regex;

/// The "first 10" truncation on status message lists, kept as a
/// constant rather than a magic number.
pub const STATUS_LIST_LIMIT: usize = 10;

/// Per-object health as determined by the pluggable summarizer set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObjectHealth {
    Ready,
    Transitioning,
    Error,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ObjectSummary {
    pub reference: ObjectRef,
    pub health: ObjectHealth,
    pub message: String,
}

/// A live object's health, as produced by a pluggable per-kind
/// summarizer. Implementors
/// inspect one object's observed JSON and return a verdict, or `None` if
/// they don't recognize the kind — the caller tries each in turn and
/// falls back to `Ready` for an unrecognized kind (mere existence is all
/// that can be asked of an object type with no known health shape).
pub trait Summarizer: Send + Sync {
    fn summarize(&self, reference: &ObjectRef, live: &serde_json::Value) -> Option<ObjectSummary>;
}

/// Run `summarizers` in order over `objects`, falling back to `Ready`
/// for any kind none of them recognize, and deduplicating repeated
/// identical messages the way condition lists avoid re-announcing an
/// unchanged state.
pub fn run_summarizers(summarizers: &[Box<dyn Summarizer>], objects: &[(ObjectRef, serde_json::Value)]) -> Vec<ObjectSummary> {
    objects
        .iter()
        .map(|(reference, live)| {
            summarizers
                .iter()
                .find_map(|summarizer| summarizer.summarize(reference, live))
                .unwrap_or_else(|| ObjectSummary {
                    reference: reference.clone(),
                    health: ObjectHealth::Ready,
                    message: String::new(),
                })
        })
        .collect()
}

/// Strip changed pointers under `/webhooks/*/clientConfig/caBundle`,
/// which admission-webhook controllers autofill server-side.
fn strip_webhook_ca_bundle_autofills(update: Vec<ModifiedObject>) -> Vec<ModifiedObject> {
    let ca_bundle_pointer = Regex::new(r"^/webhooks/\d+/clientConfig/caBundle$").expect("static regex is valid");
    retain_non_empty(update, |entry| {
        matches!(entry.reference.kind.as_str(), "ValidatingWebhookConfiguration" | "MutatingWebhookConfiguration")
            && ca_bundle_pointer.is_match_pointer(&entry.changed_json_pointers)
    })
}

trait PointerMatcher {
    fn is_match_pointer(&self, pointers: &[String]) -> bool;
}
impl PointerMatcher for Regex {
    fn is_match_pointer(&self, pointers: &[String]) -> bool {
        pointers.iter().any(|p| self.is_match(p))
    }
}

fn strip_pointers_matching(update: Vec<ModifiedObject>, applies: impl Fn(&ModifiedObject) -> bool, pointer_matches: impl Fn(&str) -> bool) -> Vec<ModifiedObject> {
    update
        .into_iter()
        .filter_map(|mut entry| {
            if applies(&entry) {
                entry.changed_json_pointers.retain(|p| !pointer_matches(p));
            }
            if entry.changed_json_pointers.is_empty() { None } else { Some(entry) }
        })
        .collect()
}

fn retain_non_empty(update: Vec<ModifiedObject>, webhook_ca_bundle: impl Fn(&ModifiedObject) -> bool) -> Vec<ModifiedObject> {
    update
        .into_iter()
        .filter_map(|mut entry| {
            if webhook_ca_bundle(&entry) {
                entry.changed_json_pointers.retain(|p| !p.contains("clientConfig/caBundle"));
            }
            if entry.changed_json_pointers.is_empty() { None } else { Some(entry) }
        })
        .collect()
}

/// Strip changed pointers under `/status` or `/metadata/managedFields`:
/// orchestrator-managed bookkeeping fields that should never count as
/// meaningful drift.
fn strip_managed_status_fields(update: Vec<ModifiedObject>) -> Vec<ModifiedObject> {
    strip_pointers_matching(update, |_| true, |pointer| pointer.starts_with("/status") || pointer.starts_with("/metadata/managedFields"))
}

/// A minimal "known-types" normalizer: a `Deployment`'s
/// `kubernetes.io/change-cause`-style revision annotation is rewritten
/// by the deployment controller itself on every rollout, never by the
/// user or Helm, so a diff limited to it is not meaningful drift.
fn strip_known_controller_managed_fields(update: Vec<ModifiedObject>) -> Vec<ModifiedObject> {
    strip_pointers_matching(
        update,
        |entry| entry.reference.kind == "Deployment",
        |pointer| pointer == "/metadata/annotations/deployment.kubernetes.io~1revision",
    )
}

/// Does `patch` apply to `reference`?
fn compare_patch_matches(patch: &ComparePatch, reference: &ObjectRef) -> bool {
    if patch.api_version != reference.api_version || patch.kind != reference.kind {
        return false;
    }
    if let Some(namespace) = &patch.namespace
        && reference.namespace.as_deref() != Some(namespace.as_str())
    {
        return false;
    }
    if let Some(name) = &patch.name {
        return name == &reference.name;
    }
    if let Some(name_regex) = &patch.name_regex {
        return Regex::new(name_regex).is_ok_and(|re| re.is_match(&reference.name));
    }
    true
}

/// Apply every `spec.diff.comparePatches` entry: a
/// `jsonPointers` list strips those pointers from the update bucket's
/// diff (S4's drift-ignore); an `operations` list containing a JSON
/// Patch `remove` op drops the whole object from the create bucket,
/// treating it as intentionally excluded from this release's management.
fn apply_compare_patches(create: Vec<ObjectRef>, update: Vec<ModifiedObject>, patches: &[ComparePatch]) -> (Vec<ObjectRef>, Vec<ModifiedObject>) {
    let filtered_create = create
        .into_iter()
        .filter(|reference| {
            !patches.iter().any(|patch| {
                compare_patch_matches(patch, reference) && patch.operations.iter().any(|op| op.get("op").and_then(|v| v.as_str()) == Some("remove"))
            })
        })
        .collect();

    let filtered_update = update
        .into_iter()
        .filter_map(|mut entry| {
            let ignored_pointers: Vec<&str> = patches
                .iter()
                .filter(|patch| compare_patch_matches(patch, &entry.reference))
                .flat_map(|patch| patch.json_pointers.iter().map(String::as_str))
                .collect();
            entry.changed_json_pointers.retain(|p| !ignored_pointers.contains(&p.as_str()));
            if entry.changed_json_pointers.is_empty() { None } else { Some(entry) }
        })
        .collect();

    (filtered_create, filtered_update)
}

/// Run every normalizer over `plan` in the order lists them.
pub fn normalize_plan(plan: Plan, compare_patches: &[ComparePatch]) -> Plan {
    let update = strip_webhook_ca_bundle_autofills(plan.update);
    let update = strip_managed_status_fields(update);
    let (create, update) = apply_compare_patches(plan.create, update, compare_patches);
    let update = strip_known_controller_managed_fields(update);
    Plan { create, update, delete: plan.delete }
}

fn format_modified(entry: &ModifiedObject) -> String {
    let namespace = entry.reference.namespace.as_deref().unwrap_or("");
    format!("{}/{}/{}: {}", entry.reference.kind, namespace, entry.reference.name, entry.changed_json_pointers.join(", "))
}

fn format_created_or_deleted(reference: &ObjectRef, verb: &str) -> String {
    let namespace = reference.namespace.as_deref().unwrap_or("");
    format!("{}/{}/{}: {verb}", reference.kind, namespace, reference.name)
}

fn format_non_ready(summary: &ObjectSummary) -> String {
    let namespace = summary.reference.namespace.as_deref().unwrap_or("");
    format!("{}/{}/{}: {}", summary.reference.kind, namespace, summary.reference.name, summary.message)
}

/// Should the `shouldRedeploy` behavior fire regardless of
/// `correctDrift`? Upstream treats any
/// deployment whose Helm release name starts with `fleet-agent` as
/// always-redeployable on drift. Carried forward as-is, gated behind a
/// flag for future deprecation rather than baked in unconditionally.
pub fn should_always_redeploy_by_name(release_name: &str, enabled: bool) -> bool {
    enabled && release_name.starts_with("fleet-agent")
}

/// Compute the Monitor handler's status write. `plan` is
/// the raw, un-normalized dry-run result; `summaries` are the caller's
/// already-computed per-object health (from running the summarizer
/// chain over each live object in the release).
#[allow(clippy::too_many_arguments)]
pub fn compute_status(
    mut status: DeploymentStatus,
    deployment_id: &str,
    release_name: &str,
    plan: Plan,
    compare_patches: &[ComparePatch],
    summaries: &[ObjectSummary],
    correct_drift: &CorrectDriftOptions,
    always_redeploy_fleet_agent_prefix: bool,
    force_sync_generation_advanced: bool,
    now: DateTime<Utc>,
) -> DeploymentStatus {
    let normalized = normalize_plan(plan, compare_patches);
    let non_modified = normalized.is_empty();

    let ready = summaries.iter().all(|s| s.health == ObjectHealth::Ready);

    let mut non_ready_status: Vec<String> = summaries
        .iter()
        .filter(|s| s.health != ObjectHealth::Ready)
        .map(format_non_ready)
        .collect();
    non_ready_status.truncate(STATUS_LIST_LIMIT);

    let mut modified_status: Vec<String> = normalized
        .update
        .iter()
        .map(format_modified)
        .chain(normalized.create.iter().map(|r| format_created_or_deleted(r, "missing")))
        .chain(normalized.delete.iter().map(|r| format_created_or_deleted(r, "stray")))
        .collect();
    modified_status.truncate(STATUS_LIST_LIMIT);

    status.ready = ready;
    status.modified = !non_modified;
    status.non_ready_status = non_ready_status;
    status.modified_status = modified_status;

    set_condition(
        &mut status,
        condition_types::READY,
        ready,
        if ready { "AllObjectsReady" } else { "ObjectsNotReady" },
        format!("{} non-ready resource(s)", status.non_ready_status.len()),
        now,
    );

    let redeploy_trigger = should_always_redeploy_by_name(release_name, always_redeploy_fleet_agent_prefix) || force_sync_generation_advanced;
    if status.modified && correct_drift.enabled && (correct_drift.force || redeploy_trigger) {
        status.applied_deployment_id = None;
    } else if status.applied_deployment_id.is_none() && ready {
        // A prior clear already triggered the Deploy handler; once
        // re-applied it will set this again. Nothing to do here.
    } else if status.applied_deployment_id.as_deref() != Some(deployment_id) {
        // The spec bundle a caller is polling may have changed under
        // us; Monitor only clears, it
        // never sets — the Deploy handler owns setting it back.
    }

    status
}

fn set_condition(status: &mut DeploymentStatus, type_: &str, value: bool, reason: &str, message: String, now: DateTime<Utc>) {
    condition::set_condition(&mut status.conditions, type_, value, reason, message, 0, Time(now));
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use fleet_api::fleet_yaml::DiffOptions;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().expect("valid time")
    }

    fn object_ref(kind: &str, name: &str) -> ObjectRef {
        ObjectRef {
            api_version: "apps/v1".to_owned(),
            kind: kind.to_owned(),
            namespace: Some("ns".to_owned()),
            name: name.to_owned(),
        }
    }

    #[test]
    fn empty_plan_and_ready_summaries_yield_ready_and_non_modified() {
        let status = compute_status(
            DeploymentStatus::default(),
            "dep-1",
            "my-release",
            Plan::default(),
            &[],
            &[],
            &CorrectDriftOptions::default(),
            true,
            false,
            now(),
        );
        assert!(status.ready);
        assert!(!status.modified);
        assert!(status.non_ready_status.is_empty());
    }

    #[test]
    fn comparepatch_jsonpointers_silence_an_ignored_drift_field() {
        // S4: a manual edit to spec.replicas on a Deployment with a
        // comparePatch ignoring that pointer keeps Ready=true and
        // nonModified=true.
        let plan = Plan {
            create: vec![],
            update: vec![ModifiedObject {
                reference: object_ref("Deployment", "app"),
                changed_json_pointers: vec!["/spec/replicas".to_owned()],
            }],
            delete: vec![],
        };
        let patches = vec![ComparePatch {
            api_version: "apps/v1".to_owned(),
            kind: "Deployment".to_owned(),
            namespace: None,
            name: None,
            name_regex: None,
            operations: vec![],
            json_pointers: vec!["/spec/replicas".to_owned()],
        }];
        let status = compute_status(
            DeploymentStatus::default(),
            "dep-1",
            "my-release",
            plan,
            &patches,
            &[],
            &CorrectDriftOptions::default(),
            true,
            false,
            now(),
        );
        assert!(!status.modified, "ignored pointer must not count as drift");
        assert!(status.ready);
    }

    #[test]
    fn unignored_drift_is_reported() {
        let plan = Plan {
            create: vec![],
            update: vec![ModifiedObject {
                reference: object_ref("Deployment", "app"),
                changed_json_pointers: vec!["/spec/template/spec/containers/0/image".to_owned()],
            }],
            delete: vec![],
        };
        let status = compute_status(
            DeploymentStatus::default(),
            "dep-1",
            "my-release",
            plan,
            &[],
            &[],
            &CorrectDriftOptions::default(),
            true,
            false,
            now(),
        );
        assert!(status.modified);
        assert_eq!(status.modified_status.len(), 1);
    }

    #[test]
    fn non_ready_object_surfaces_on_the_ready_condition() {
        let summaries = vec![ObjectSummary {
            reference: object_ref("Deployment", "app"),
            health: ObjectHealth::Transitioning,
            message: "waiting for rollout".to_owned(),
        }];
        let status = compute_status(
            DeploymentStatus::default(),
            "dep-1",
            "my-release",
            Plan::default(),
            &[],
            &summaries,
            &CorrectDriftOptions::default(),
            true,
            false,
            now(),
        );
        assert!(!status.ready);
        assert_eq!(status.non_ready_status.len(), 1);
        assert!(condition::is_false(&status.conditions, condition_types::READY));
    }

    #[test]
    fn correct_drift_disabled_never_clears_applied_deployment_id() {
        let plan = Plan {
            create: vec![],
            update: vec![ModifiedObject {
                reference: object_ref("Deployment", "app"),
                changed_json_pointers: vec!["/spec/replicas".to_owned()],
            }],
            delete: vec![],
        };
        let status = DeploymentStatus {
            applied_deployment_id: Some("dep-1".to_owned()),
            ..Default::default()
        };
        let result = compute_status(
            status,
            "dep-1",
            "fleet-agent",
            plan,
            &[],
            &[],
            &CorrectDriftOptions { enabled: false, force: false },
            true,
            false,
            now(),
        );
        assert_eq!(result.applied_deployment_id.as_deref(), Some("dep-1"));
    }

    #[test]
    fn fleet_agent_prefixed_release_redeploys_on_drift_when_correct_drift_enabled() {
        let plan = Plan {
            create: vec![],
            update: vec![ModifiedObject {
                reference: object_ref("Deployment", "app"),
                changed_json_pointers: vec!["/spec/replicas".to_owned()],
            }],
            delete: vec![],
        };
        let status = DeploymentStatus {
            applied_deployment_id: Some("dep-1".to_owned()),
            ..Default::default()
        };
        let result = compute_status(
            status,
            "dep-1",
            "fleet-agent-local",
            plan,
            &[],
            &[],
            &CorrectDriftOptions { enabled: true, force: false },
            true,
            false,
            now(),
        );
        assert!(result.applied_deployment_id.is_none());
    }

    #[test]
    fn running_monitor_twice_on_a_steady_deployment_is_byte_identical() {
        // Property 6.
        let summaries = vec![ObjectSummary {
            reference: object_ref("Deployment", "app"),
            health: ObjectHealth::Ready,
            message: String::new(),
        }];
        let first = compute_status(
            DeploymentStatus::default(),
            "dep-1",
            "my-release",
            Plan::default(),
            &[],
            &summaries,
            &CorrectDriftOptions::default(),
            true,
            false,
            now(),
        );
        let second = compute_status(
            first.clone(),
            "dep-1",
            "my-release",
            Plan::default(),
            &[],
            &summaries,
            &CorrectDriftOptions::default(),
            true,
            false,
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).single().expect("valid time"),
        );
        assert_eq!(first, second, "an unchanged deployment must produce byte-identical status across Monitor passes");
    }

    #[test]
    fn webhook_ca_bundle_autofill_is_not_drift() {
        let plan = Plan {
            create: vec![],
            update: vec![ModifiedObject {
                reference: ObjectRef {
                    api_version: "admissionregistration.k8s.io/v1".to_owned(),
                    kind: "MutatingWebhookConfiguration".to_owned(),
                    namespace: None,
                    name: "my-webhook".to_owned(),
                },
                changed_json_pointers: vec!["/webhooks/0/clientConfig/caBundle".to_owned()],
            }],
            delete: vec![],
        };
        let normalized = normalize_plan(plan, &[]);
        assert!(normalized.is_empty());
    }

    #[test]
    fn operations_remove_excludes_object_from_create_bucket() {
        let create = vec![object_ref("ConfigMap", "externally-managed")];
        let patches = vec![ComparePatch {
            api_version: "apps/v1".to_owned(),
            kind: "ConfigMap".to_owned(),
            namespace: None,
            name: Some("externally-managed".to_owned()),
            name_regex: None,
            operations: vec![serde_json::json!({"op": "remove", "path": "/"})],
            json_pointers: vec![],
        }];
        let (filtered_create, _) = apply_compare_patches(create, vec![], &patches);
        assert!(filtered_create.is_empty());
    }

    #[test]
    fn diff_options_default_has_no_compare_patches() {
        assert!(DiffOptions::default().compare_patches.is_empty());
    }
}
