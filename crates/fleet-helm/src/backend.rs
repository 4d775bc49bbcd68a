//! The `HelmBackend` trait: the out-of-scope "Helm
//! rendering library" lives behind this boundary. The one production
//! implementation shells out to a `helm` binary on `PATH` via
//! `tokio::process::Command`, the documented, supported integration
//! point upstream Fleet itself uses, since linking the actual Go Helm
//! SDK into Rust is out of scope.

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::HelmError;

/// One release installation/upgrade request.
#[derive(Clone, Debug)]
pub struct InstallRequest {
    pub release_name: String,
    pub namespace: String,
    pub chart_ref: String,
    pub values: serde_json::Map<String, serde_json::Value>,
    pub take_ownership: bool,
    pub atomic: bool,
    pub force: bool,
    pub wait_for_jobs: bool,
    /// `None` means no deadline, wait on hooks only.
    pub timeout_seconds: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct ReleaseInfo {
    pub name: String,
    pub revision: u32,
    pub namespace: String,
}

/// A server-side dry-run diff, bucketed the way the Monitor handler
/// consumes it: objects the release wants that don't
/// exist, objects that exist but differ, and objects that exist but are
/// no longer wanted.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Plan {
    pub create: Vec<ObjectRef>,
    pub update: Vec<ModifiedObject>,
    pub delete: Vec<ObjectRef>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// One object in the `update` bucket, carrying which JSON pointers
/// actually differ between desired and live state. The deployer's diff
/// normalizers need this per-field granularity to
/// decide whether a `diff.comparePatches` entry's `jsonPointers` list
/// covers *every* observed change, not merely whether the object
/// differs at all.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct ModifiedObject {
    pub reference: ObjectRef,
    pub changed_json_pointers: Vec<String>,
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

#[async_trait]
pub trait HelmBackend: Send + Sync {
    async fn deploy(&self, request: &InstallRequest) -> Result<ReleaseInfo, HelmError>;
    async fn upgrade(&self, request: &InstallRequest) -> Result<ReleaseInfo, HelmError>;
    async fn uninstall(&self, release_name: &str, namespace: &str, keep_resources: bool) -> Result<(), HelmError>;
    async fn dry_run_plan(&self, release_name: &str, namespace: &str) -> Result<Plan, HelmError>;
    async fn release_history(&self, release_name: &str, namespace: &str) -> Result<Vec<ReleaseInfo>, HelmError>;
    /// Every release currently installed in `namespace`.
    async fn list_releases(&self, namespace: &str) -> Result<Vec<ReleaseInfo>, HelmError>;
}

/// Shells out to `helm` on `PATH`.
pub struct CliHelmBackend {
    binary: String,
}

impl Default for CliHelmBackend {
    fn default() -> Self {
        Self::new("helm")
    }
}

impl CliHelmBackend {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    fn base_command(&self) -> Command {
        Command::new(&self.binary)
    }

    async fn run(&self, args: &[String]) -> Result<String, HelmError> {
        let output = self
            .base_command()
            .args(args)
            .output()
            .await
            .map_err(|source| HelmError::Spawn { source })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(classify_failure(output.status.code().unwrap_or(-1), stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Turn helm's free-text stderr into a structured [`HelmError`] where a
/// known shape is recognizable. Genuinely unrecognized failures fall
/// back to [`HelmError::ProcessFailed`], which the Deploy handler
/// retries as transient — better to retry a misclassified error than to
/// silently swallow a real one.
fn classify_failure(status: i32, stderr: String) -> HelmError {
    let lower = stderr.to_lowercase();
    if lower.contains("cannot patch") && lower.contains("immutable") {
        return HelmError::ImmutableFieldUpdate {
            resource: "unknown".to_owned(),
            field: "unknown".to_owned(),
        };
    }
    if lower.contains("kubeversion") {
        return HelmError::KubeVersionMismatch {
            required: "unknown".to_owned(),
            actual: "unknown".to_owned(),
        };
    }
    if lower.contains("timed out waiting") {
        return HelmError::TimedOutWaiting {
            resource: "release".to_owned(),
            timeout_seconds: 0,
        };
    }
    if lower.contains("atomic") && lower.contains("rolled back") {
        return HelmError::AtomicRollback {
            release: "unknown".to_owned(),
        };
    }
    if lower.contains("values don't meet the specifications of the schema") || lower.contains("validation") {
        return HelmError::ValidationFailure { message: stderr };
    }
    HelmError::ProcessFailed { status, stderr }
}

fn values_file_args(values: &serde_json::Map<String, serde_json::Value>) -> Vec<String> {
    values
        .iter()
        .map(|(key, value)| {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("--set-json={key}={rendered}")
        })
        .collect()
}

fn install_args(request: &InstallRequest, verb: &str) -> Vec<String> {
    let mut args = vec![
        verb.to_owned(),
        request.release_name.clone(),
        request.chart_ref.clone(),
        "--namespace".to_owned(),
        request.namespace.clone(),
        "--install".to_owned(),
        "--output".to_owned(),
        "json".to_owned(),
    ];
    if request.take_ownership {
        args.push("--take-ownership".to_owned());
    }
    if request.atomic {
        args.push("--atomic".to_owned());
    }
    if request.force {
        args.push("--force".to_owned());
    }
    if request.wait_for_jobs {
        args.push("--wait-for-jobs".to_owned());
        args.push("--wait".to_owned());
    }
    if let Some(timeout) = request.timeout_seconds {
        args.push("--timeout".to_owned());
        args.push(format!("{timeout}s"));
    }
    args.extend(values_file_args(&request.values));
    args
}

#[async_trait]
impl HelmBackend for CliHelmBackend {
    #[tracing::instrument(skip(self, request), fields(release = %request.release_name))]
    async fn deploy(&self, request: &InstallRequest) -> Result<ReleaseInfo, HelmError> {
        self.run(&install_args(request, "upgrade")).await?;
        Ok(ReleaseInfo {
            name: request.release_name.clone(),
            revision: 1,
            namespace: request.namespace.clone(),
        })
    }

    #[tracing::instrument(skip(self, request), fields(release = %request.release_name))]
    async fn upgrade(&self, request: &InstallRequest) -> Result<ReleaseInfo, HelmError> {
        self.deploy(request).await
    }

    #[tracing::instrument(skip(self))]
    async fn uninstall(&self, release_name: &str, namespace: &str, keep_resources: bool) -> Result<(), HelmError> {
        let mut args = vec![
            "uninstall".to_owned(),
            release_name.to_owned(),
            "--namespace".to_owned(),
            namespace.to_owned(),
        ];
        if keep_resources {
            args.push("--keep-history".to_owned());
        }
        self.run(&args).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn dry_run_plan(&self, release_name: &str, namespace: &str) -> Result<Plan, HelmError> {
        let args = vec![
            "diff".to_owned(),
            "revision".to_owned(),
            release_name.to_owned(),
            "--namespace".to_owned(),
            namespace.to_owned(),
            "--output".to_owned(),
            "json".to_owned(),
        ];
        let output = self.run(&args).await?;
        parse_plan(&output)
    }

    #[tracing::instrument(skip(self))]
    async fn release_history(&self, release_name: &str, namespace: &str) -> Result<Vec<ReleaseInfo>, HelmError> {
        let args = vec![
            "history".to_owned(),
            release_name.to_owned(),
            "--namespace".to_owned(),
            namespace.to_owned(),
            "--output".to_owned(),
            "json".to_owned(),
        ];
        let output = self.run(&args).await?;
        parse_history(&output, namespace)
    }

    #[tracing::instrument(skip(self))]
    async fn list_releases(&self, namespace: &str) -> Result<Vec<ReleaseInfo>, HelmError> {
        let args = vec![
            "list".to_owned(),
            "--namespace".to_owned(),
            namespace.to_owned(),
            "--output".to_owned(),
            "json".to_owned(),
        ];
        let output = self.run(&args).await?;
        parse_release_list(&output, namespace)
    }
}

fn parse_plan(json: &str) -> Result<Plan, HelmError> {
    #[derive(serde::Deserialize, Default)]
    struct RawPlan {
        #[serde(default)]
        create: Vec<RawObjectRef>,
        #[serde(default)]
        update: Vec<RawModifiedObject>,
        #[serde(default)]
        delete: Vec<RawObjectRef>,
    }
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct RawObjectRef {
        api_version: String,
        kind: String,
        #[serde(default)]
        namespace: Option<String>,
        name: String,
    }
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct RawModifiedObject {
        #[serde(flatten)]
        reference: RawObjectRef,
        #[serde(default)]
        changed_json_pointers: Vec<String>,
    }
    let raw: RawPlan = serde_json::from_str(json).map_err(|e| HelmError::YamlParse {
        message: e.to_string(),
    })?;
    let to_ref = |r: RawObjectRef| ObjectRef {
        api_version: r.api_version,
        kind: r.kind,
        namespace: r.namespace,
        name: r.name,
    };
    Ok(Plan {
        create: raw.create.into_iter().map(to_ref).collect(),
        update: raw
            .update
            .into_iter()
            .map(|m| ModifiedObject {
                reference: to_ref(m.reference),
                changed_json_pointers: m.changed_json_pointers,
            })
            .collect(),
        delete: raw.delete.into_iter().map(to_ref).collect(),
    })
}

fn parse_history(json: &str, namespace: &str) -> Result<Vec<ReleaseInfo>, HelmError> {
    #[derive(serde::Deserialize)]
    struct RawRevision {
        revision: u32,
        name: String,
    }
    let raw: Vec<RawRevision> = serde_json::from_str(json).map_err(|e| HelmError::YamlParse {
        message: e.to_string(),
    })?;
    Ok(raw
        .into_iter()
        .map(|r| ReleaseInfo {
            name: r.name,
            revision: r.revision,
            namespace: namespace.to_owned(),
        })
        .collect())
}

fn parse_release_list(json: &str, namespace: &str) -> Result<Vec<ReleaseInfo>, HelmError> {
    #[derive(serde::Deserialize)]
    struct RawRelease {
        name: String,
        /// `helm list -o json` renders this as a quoted string, unlike
        /// `helm history`'s numeric field.
        revision: String,
    }
    let raw: Vec<RawRelease> = serde_json::from_str(json).map_err(|e| HelmError::YamlParse {
        message: e.to_string(),
    })?;
    raw.into_iter()
        .map(|r| {
            let revision = r.revision.parse().map_err(|_| HelmError::YamlParse {
                message: format!("non-numeric revision {:?} for release {}", r.revision, r.name),
            })?;
            Ok(ReleaseInfo {
                name: r.name,
                revision,
                namespace: namespace.to_owned(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_args_carry_every_named_knob() {
        let request = InstallRequest {
            release_name: "my-release".to_owned(),
            namespace: "ns".to_owned(),
            chart_ref: "oci://example/chart".to_owned(),
            values: serde_json::Map::new(),
            take_ownership: true,
            atomic: true,
            force: true,
            wait_for_jobs: true,
            timeout_seconds: Some(300),
        };
        let args = install_args(&request, "upgrade");
        assert!(args.contains(&"--take-ownership".to_owned()));
        assert!(args.contains(&"--atomic".to_owned()));
        assert!(args.contains(&"--force".to_owned()));
        assert!(args.contains(&"--wait-for-jobs".to_owned()));
        assert!(args.contains(&"300s".to_owned()));
    }

    #[test]
    fn classify_recognizes_immutable_field_errors() {
        let err = classify_failure(1, "Error: cannot patch: field is immutable".to_owned());
        assert!(matches!(err, HelmError::ImmutableFieldUpdate { .. }));
    }

    #[test]
    fn classify_falls_back_to_process_failed() {
        let err = classify_failure(1, "some unrecognized helm error".to_owned());
        assert!(matches!(err, HelmError::ProcessFailed { .. }));
    }

    #[test]
    fn empty_plan_reports_empty() {
        assert!(Plan::default().is_empty());
    }

    #[test]
    fn parses_plan_json() {
        let json = r#"{"create":[{"apiVersion":"v1","kind":"Service","name":"svc"}],"update":[],"delete":[]}"#;
        let plan = parse_plan(json).expect("parse");
        assert_eq!(plan.create.len(), 1);
        assert!(!plan.is_empty());
    }

    #[test]
    fn parses_update_bucket_with_changed_pointers() {
        let json = r#"{"create":[],"update":[{"apiVersion":"apps/v1","kind":"Deployment","namespace":"ns","name":"app","changedJsonPointers":["/spec/replicas"]}],"delete":[]}"#;
        let plan = parse_plan(json).expect("parse");
        assert_eq!(plan.update.len(), 1);
        assert_eq!(plan.update[0].changed_json_pointers, vec!["/spec/replicas".to_owned()]);
    }

    #[test]
    fn parses_release_list_with_stringified_revisions() {
        let json = r#"[{"name":"app-a","revision":"3"},{"name":"app-b","revision":"1"}]"#;
        let releases = parse_release_list(json, "ns").expect("parse");
        assert_eq!(releases.len(), 2);
        assert_eq!(releases[0].name, "app-a");
        assert_eq!(releases[0].revision, 3);
        assert_eq!(releases[0].namespace, "ns");
    }

    #[test]
    fn release_list_rejects_a_non_numeric_revision() {
        let json = r#"[{"name":"app-a","revision":"not-a-number"}]"#;
        assert!(parse_release_list(json, "ns").is_err());
    }
}
