//! Edge extraction passes.
//!
//! Each pass looks at one object and returns the edges it declares. The
//! passes are independent of each other and of the ordering code; the
//! builder unions their output.

use super::{DependencyEdge, EdgeKind};
use crate::cluster::kinds;
use crate::resource::ResourceKey;
use kube::api::DynamicObject;
use serde_json::Value;
use std::collections::BTreeSet;

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn array_at<'a>(value: &'a Value, pointer: &str) -> &'a [Value] {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .map_or(&[][..], Vec::as_slice)
}

/// Key for a reference, resolving the namespace the way Kubernetes does:
/// cluster-scoped kinds have none, everything else defaults to the referrer's.
fn reference(kind: &str, namespace: Option<&str>, name: &str, referrer: &ResourceKey) -> ResourceKey {
    let cluster_scoped = kinds::lookup(kind).is_some_and(|info| !info.namespaced);
    if cluster_scoped {
        ResourceKey::cluster_scoped(kind, name)
    } else {
        ResourceKey::new(kind, namespace.unwrap_or(&referrer.namespace), name)
    }
}

/// Ownership pass: an owned object depends on each of its owners.
#[must_use]
pub fn ownership_edges(object: &DynamicObject, key: &ResourceKey) -> Vec<DependencyEdge> {
    object
        .metadata
        .owner_references
        .iter()
        .flatten()
        .map(|owner| {
            DependencyEdge::new(
                key.clone(),
                reference(&owner.kind, None, &owner.name, key),
                EdgeKind::Ownership,
            )
        })
        .collect()
}

/// Location of the pod spec inside a workload kind
fn pod_spec_pointer(kind: &str) -> Option<&'static str> {
    match kind {
        "Pod" => Some("/spec"),
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Job" => Some("/spec/template/spec"),
        "CronJob" => Some("/spec/jobTemplate/spec/template/spec"),
        _ => None,
    }
}

/// ConfigMaps, Secrets and PVCs referenced from a pod spec
fn pod_spec_references(spec: &Value, out: &mut BTreeSet<(&'static str, String)>) {
    let mut add = |kind: &'static str, name: Option<&str>| {
        if let Some(name) = name {
            out.insert((kind, name.to_string()));
        }
    };

    for list in ["/containers", "/initContainers", "/ephemeralContainers"] {
        for container in array_at(spec, list) {
            for env in array_at(container, "/env") {
                add("ConfigMap", str_at(env, "/valueFrom/configMapKeyRef/name"));
                add("Secret", str_at(env, "/valueFrom/secretKeyRef/name"));
            }
            for source in array_at(container, "/envFrom") {
                add("ConfigMap", str_at(source, "/configMapRef/name"));
                add("Secret", str_at(source, "/secretRef/name"));
            }
        }
    }

    for volume in array_at(spec, "/volumes") {
        add("ConfigMap", str_at(volume, "/configMap/name"));
        add("Secret", str_at(volume, "/secret/secretName"));
        add(
            "PersistentVolumeClaim",
            str_at(volume, "/persistentVolumeClaim/claimName"),
        );
        for projected in array_at(volume, "/projected/sources") {
            add("ConfigMap", str_at(projected, "/configMap/name"));
            add("Secret", str_at(projected, "/secret/name"));
        }
    }

    for pull_secret in array_at(spec, "/imagePullSecrets") {
        add("Secret", str_at(pull_secret, "/name"));
    }
}

/// Data-reference pass: workloads on their ConfigMaps, Secrets and PVCs,
/// HelmReleases on their `valuesFrom`, Ingresses on backends and TLS secrets.
#[must_use]
pub fn data_edges(object: &DynamicObject, key: &ResourceKey) -> Vec<DependencyEdge> {
    let mut refs: BTreeSet<(&'static str, String)> = BTreeSet::new();
    let data = &object.data;

    if let Some(spec) = pod_spec_pointer(&key.kind).and_then(|p| data.pointer(p)) {
        pod_spec_references(spec, &mut refs);
    }

    match key.kind.as_str() {
        "HelmRelease" => {
            for source in array_at(data, "/spec/valuesFrom") {
                let name = str_at(source, "/name");
                match (str_at(source, "/kind"), name) {
                    (Some("ConfigMap"), Some(name)) => {
                        refs.insert(("ConfigMap", name.to_string()));
                    }
                    (Some("Secret"), Some(name)) => {
                        refs.insert(("Secret", name.to_string()));
                    }
                    _ => {}
                }
            }
        }
        "Ingress" => {
            if let Some(name) = str_at(data, "/spec/defaultBackend/service/name") {
                refs.insert(("Service", name.to_string()));
            }
            for rule in array_at(data, "/spec/rules") {
                for path in array_at(rule, "/http/paths") {
                    if let Some(name) = str_at(path, "/backend/service/name") {
                        refs.insert(("Service", name.to_string()));
                    }
                }
            }
            for tls in array_at(data, "/spec/tls") {
                if let Some(name) = str_at(tls, "/secretName") {
                    refs.insert(("Secret", name.to_string()));
                }
            }
        }
        _ => {}
    }

    refs.into_iter()
        .map(|(kind, name)| {
            DependencyEdge::new(key.clone(), reference(kind, None, &name, key), EdgeKind::Data)
        })
        .collect()
}

/// Orchestration pass: Flux `dependsOn` and source references.
#[must_use]
pub fn orchestration_edges(object: &DynamicObject, key: &ResourceKey) -> Vec<DependencyEdge> {
    let data = &object.data;
    let mut edges = Vec::new();

    if matches!(key.kind.as_str(), "Kustomization" | "HelmRelease") {
        for dependency in array_at(data, "/spec/dependsOn") {
            if let Some(name) = str_at(dependency, "/name") {
                edges.push(DependencyEdge::new(
                    key.clone(),
                    reference(&key.kind, str_at(dependency, "/namespace"), name, key),
                    EdgeKind::Orchestration,
                ));
            }
        }
    }

    let source_pointers: &[&str] = match key.kind.as_str() {
        "Kustomization" => &["/spec/sourceRef"],
        "HelmRelease" => &["/spec/chart/spec/sourceRef", "/spec/chartRef"],
        _ => &[],
    };
    for pointer in source_pointers {
        let Some(source) = data.pointer(pointer) else {
            continue;
        };
        if let (Some(kind), Some(name)) = (str_at(source, "/kind"), str_at(source, "/name")) {
            edges.push(DependencyEdge::new(
                key.clone(),
                reference(kind, str_at(source, "/namespace"), name, key),
                EdgeKind::Orchestration,
            ));
        }
    }

    edges
}

/// All three passes, unioned.
#[must_use]
pub fn all_edges(object: &DynamicObject, key: &ResourceKey) -> Vec<DependencyEdge> {
    let mut edges = ownership_edges(object, key);
    edges.extend(data_edges(object, key));
    edges.extend(orchestration_edges(object, key));
    edges
}
