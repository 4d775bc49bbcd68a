//! The production `Summarizer`: per-object health for the handful of workload kinds that
//! carry an observable readiness signal in their own `status`. Every
//! other kind falls through to [`monitor::run_summarizers`]'s default
//! (mere existence counts as `Ready`).

use fleet_helm::ObjectRef;
use serde_json::Value;

use super::monitor::{ObjectHealth, ObjectSummary, Summarizer};

/// Reads `status.conditions[].{type,status,message}` the way every
/// built-in Kubernetes workload controller reports them, plus each
/// kind's own desired-vs-observed replica counts.
pub struct KnownTypesSummarizer;

fn condition(live: &Value, type_: &str) -> Option<(String, String)> {
    live.pointer("/status/conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
        .map(|c| {
            (
                c.get("status").and_then(Value::as_str).unwrap_or("Unknown").to_owned(),
                c.get("message").and_then(Value::as_str).unwrap_or("").to_owned(),
            )
        })
}

fn replica_summary(reference: &ObjectRef, live: &Value, desired_field: &str) -> ObjectSummary {
    let spec_replicas = live.pointer(&format!("/spec/{desired_field}")).and_then(Value::as_i64).unwrap_or(1);
    let ready_replicas = live.pointer("/status/readyReplicas").and_then(Value::as_i64).unwrap_or(0);
    let updated_replicas = live.pointer("/status/updatedReplicas").and_then(Value::as_i64).unwrap_or(0);

    if ready_replicas >= spec_replicas && updated_replicas >= spec_replicas {
        ObjectSummary {
            reference: reference.clone(),
            health: ObjectHealth::Ready,
            message: String::new(),
        }
    } else {
        ObjectSummary {
            reference: reference.clone(),
            health: ObjectHealth::Transitioning,
            message: format!("{ready_replicas}/{spec_replicas} replicas ready"),
        }
    }
}

impl Summarizer for KnownTypesSummarizer {
    fn summarize(&self, reference: &ObjectRef, live: &Value) -> Option<ObjectSummary> {
        match reference.kind.as_str() {
            "Deployment" | "ReplicaSet" => Some(replica_summary(reference, live, "replicas")),
            "StatefulSet" => Some(replica_summary(reference, live, "replicas")),
            "DaemonSet" => {
                let desired = live.pointer("/status/desiredNumberScheduled").and_then(Value::as_i64).unwrap_or(0);
                let ready = live.pointer("/status/numberReady").and_then(Value::as_i64).unwrap_or(0);
                Some(if ready >= desired {
                    ObjectSummary {
                        reference: reference.clone(),
                        health: ObjectHealth::Ready,
                        message: String::new(),
                    }
                } else {
                    ObjectSummary {
                        reference: reference.clone(),
                        health: ObjectHealth::Transitioning,
                        message: format!("{ready}/{desired} daemon pods ready"),
                    }
                })
            }
            "Job" => {
                let failed = live.pointer("/status/failed").and_then(Value::as_i64).unwrap_or(0);
                if failed > 0 {
                    return Some(ObjectSummary {
                        reference: reference.clone(),
                        health: ObjectHealth::Error,
                        message: format!("{failed} failed pods"),
                    });
                }
                let succeeded = live.pointer("/status/succeeded").and_then(Value::as_i64).unwrap_or(0);
                Some(if succeeded > 0 {
                    ObjectSummary {
                        reference: reference.clone(),
                        health: ObjectHealth::Ready,
                        message: String::new(),
                    }
                } else {
                    ObjectSummary {
                        reference: reference.clone(),
                        health: ObjectHealth::Transitioning,
                        message: "job running".to_owned(),
                    }
                })
            }
            "Pod" => {
                let phase = live.pointer("/status/phase").and_then(Value::as_str).unwrap_or("");
                Some(match phase {
                    "Running" | "Succeeded" => ObjectSummary {
                        reference: reference.clone(),
                        health: ObjectHealth::Ready,
                        message: String::new(),
                    },
                    "Failed" => ObjectSummary {
                        reference: reference.clone(),
                        health: ObjectHealth::Error,
                        message: "pod failed".to_owned(),
                    },
                    _ => ObjectSummary {
                        reference: reference.clone(),
                        health: ObjectHealth::Transitioning,
                        message: format!("pod phase {phase}"),
                    },
                })
            }
            "APIService" | "CustomResourceDefinition" => condition(live, "Established").map(|(status, message)| ObjectSummary {
                reference: reference.clone(),
                health: if status == "True" { ObjectHealth::Ready } else { ObjectHealth::Transitioning },
                message,
            }),
            _ => None,
        }
    }
}

/// The default summarizer chain a production deployer runs. A future release that adds more kinds only needs to extend
/// this list.
pub fn default_summarizers() -> Vec<Box<dyn Summarizer>> {
    vec![Box::new(KnownTypesSummarizer)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(kind: &str) -> ObjectRef {
        ObjectRef {
            api_version: "apps/v1".to_owned(),
            kind: kind.to_owned(),
            namespace: Some("default".to_owned()),
            name: "app".to_owned(),
        }
    }

    #[test]
    fn deployment_with_all_replicas_ready_is_ready() {
        let live = serde_json::json!({
            "spec": {"replicas": 3},
            "status": {"readyReplicas": 3, "updatedReplicas": 3},
        });
        let summary = KnownTypesSummarizer.summarize(&reference("Deployment"), &live).expect("known kind");
        assert_eq!(summary.health, ObjectHealth::Ready);
    }

    #[test]
    fn deployment_missing_replicas_is_transitioning() {
        let live = serde_json::json!({
            "spec": {"replicas": 3},
            "status": {"readyReplicas": 1, "updatedReplicas": 1},
        });
        let summary = KnownTypesSummarizer.summarize(&reference("Deployment"), &live).expect("known kind");
        assert_eq!(summary.health, ObjectHealth::Transitioning);
    }

    #[test]
    fn failed_job_is_error() {
        let live = serde_json::json!({"status": {"failed": 1}});
        let summary = KnownTypesSummarizer.summarize(&reference("Job"), &live).expect("known kind");
        assert_eq!(summary.health, ObjectHealth::Error);
    }

    #[test]
    fn unknown_kind_falls_through() {
        let live = serde_json::json!({});
        assert!(KnownTypesSummarizer.summarize(&reference("Widget"), &live).is_none());
    }
}
