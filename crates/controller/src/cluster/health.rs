//! Readiness and terminal-state assessment of dynamic objects.
//!
//! Used by `verify_recovery` (is the recreated object healthy yet?) and by
//! the resync scan (which objects are already stuck?).

use kube::api::DynamicObject;
use serde_json::Value;
use std::fmt;

/// Health of one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// Not ready yet, but nothing says it will not get there
    Progressing(String),
    /// Terminal failure that will not resolve on its own
    Failed { reason: String, message: String },
}

impl Health {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Health::Healthy)
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Health::Failed { .. })
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Healthy => f.write_str("healthy"),
            Health::Progressing(detail) => write!(f, "progressing: {detail}"),
            Health::Failed { reason, message } => write!(f, "failed ({reason}): {message}"),
        }
    }
}

/// Pod waiting reasons that never clear without intervention
const TERMINAL_WAITING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
    "InvalidImageName",
];

/// Assess an object by kind.
#[must_use]
pub fn assess(object: &DynamicObject) -> Health {
    let kind = object.types.as_ref().map_or("", |t| t.kind.as_str());
    let status = object.data.get("status");

    if object.metadata.deletion_timestamp.is_some() {
        return Health::Progressing("terminating".to_string());
    }

    match kind {
        "Kustomization" | "HelmRelease" | "GitRepository" | "HelmRepository" | "OCIRepository" => {
            assess_flux(status)
        }
        "Deployment" => assess_deployment(object, status),
        "StatefulSet" | "ReplicaSet" => assess_replicas(object, status, "readyReplicas"),
        "DaemonSet" => assess_daemonset(status),
        "Pod" => assess_pod(status),
        "Job" => assess_job(status),
        _ => Health::Healthy,
    }
}

fn conditions(status: Option<&Value>) -> &[Value] {
    status
        .and_then(|s| s.get("conditions"))
        .and_then(Value::as_array)
        .map_or(&[][..], Vec::as_slice)
}

fn condition<'a>(status: Option<&'a Value>, type_: &str) -> Option<&'a Value> {
    conditions(status)
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
}

fn str_field<'a>(value: &'a Value, field: &str) -> &'a str {
    value.get(field).and_then(Value::as_str).unwrap_or_default()
}

fn int_field(status: Option<&Value>, field: &str) -> i64 {
    status
        .and_then(|s| s.get(field))
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

fn failed_from(condition: &Value) -> Health {
    Health::Failed {
        reason: str_field(condition, "reason").to_string(),
        message: str_field(condition, "message").to_string(),
    }
}

fn assess_flux(status: Option<&Value>) -> Health {
    if let Some(stalled) = condition(status, "Stalled") {
        if str_field(stalled, "status") == "True" {
            return failed_from(stalled);
        }
    }
    match condition(status, "Ready") {
        Some(ready) if str_field(ready, "status") == "True" => Health::Healthy,
        Some(ready) if str_field(ready, "status") == "False" => {
            let reason = str_field(ready, "reason");
            // Flux keeps retrying these, so they are not terminal on their own
            if reason == "Progressing" || reason == "DependencyNotReady" {
                Health::Progressing(reason.to_string())
            } else {
                failed_from(ready)
            }
        }
        _ => Health::Progressing("waiting for Ready condition".to_string()),
    }
}

fn desired_replicas(object: &DynamicObject) -> i64 {
    object
        .data
        .pointer("/spec/replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1)
}

fn assess_deployment(object: &DynamicObject, status: Option<&Value>) -> Health {
    if let Some(progressing) = condition(status, "Progressing") {
        if str_field(progressing, "reason") == "ProgressDeadlineExceeded" {
            return failed_from(progressing);
        }
    }
    assess_replicas(object, status, "readyReplicas")
}

fn assess_replicas(object: &DynamicObject, status: Option<&Value>, ready_field: &str) -> Health {
    let desired = desired_replicas(object);
    let ready = int_field(status, ready_field);
    if ready >= desired {
        Health::Healthy
    } else {
        Health::Progressing(format!("{ready}/{desired} replicas ready"))
    }
}

fn assess_daemonset(status: Option<&Value>) -> Health {
    let desired = int_field(status, "desiredNumberScheduled");
    let ready = int_field(status, "numberReady");
    if status.is_some() && ready >= desired {
        Health::Healthy
    } else {
        Health::Progressing(format!("{ready}/{desired} pods ready"))
    }
}

fn assess_pod(status: Option<&Value>) -> Health {
    let statuses = status
        .and_then(|s| s.get("containerStatuses"))
        .and_then(Value::as_array)
        .map_or(&[][..], Vec::as_slice);

    for container in statuses {
        if let Some(waiting) = container.pointer("/state/waiting") {
            let reason = str_field(waiting, "reason");
            if TERMINAL_WAITING_REASONS.contains(&reason) {
                return Health::Failed {
                    reason: reason.to_string(),
                    message: str_field(waiting, "message").to_string(),
                };
            }
        }
    }

    match status.map(|s| str_field(s, "phase")) {
        Some("Running" | "Succeeded") => Health::Healthy,
        Some("Failed") => Health::Failed {
            reason: "PodFailed".to_string(),
            message: status.map(|s| str_field(s, "message")).unwrap_or_default().to_string(),
        },
        Some(phase) if !phase.is_empty() => Health::Progressing(phase.to_string()),
        _ => Health::Progressing("no phase reported".to_string()),
    }
}

fn assess_job(status: Option<&Value>) -> Health {
    if let Some(failed) = condition(status, "Failed") {
        if str_field(failed, "status") == "True" {
            return failed_from(failed);
        }
    }
    match condition(status, "Complete") {
        Some(complete) if str_field(complete, "status") == "True" => Health::Healthy,
        _ => Health::Progressing("job running".to_string()),
    }
}
