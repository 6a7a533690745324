//! Static table of the kinds the controller reads and writes.

use kube::discovery::ApiResource;

/// One managed kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindInfo {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
    pub namespaced: bool,
}

impl KindInfo {
    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Dynamic API resource for `Api<DynamicObject>`.
    #[must_use]
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.to_string(),
            version: self.version.to_string(),
            api_version: self.api_version(),
            kind: self.kind.to_string(),
            plural: self.plural.to_string(),
        }
    }
}

const fn kind(
    group: &'static str,
    version: &'static str,
    kind: &'static str,
    plural: &'static str,
    namespaced: bool,
) -> KindInfo {
    KindInfo {
        group,
        version,
        kind,
        plural,
        namespaced,
    }
}

/// Every kind the recovery engine may touch.
pub const KNOWN_KINDS: &[KindInfo] = &[
    kind("", "v1", "Namespace", "namespaces", false),
    kind("", "v1", "PersistentVolume", "persistentvolumes", false),
    kind("", "v1", "Pod", "pods", true),
    kind("", "v1", "ConfigMap", "configmaps", true),
    kind("", "v1", "Secret", "secrets", true),
    kind("", "v1", "Service", "services", true),
    kind("", "v1", "ServiceAccount", "serviceaccounts", true),
    kind("", "v1", "PersistentVolumeClaim", "persistentvolumeclaims", true),
    kind("apps", "v1", "Deployment", "deployments", true),
    kind("apps", "v1", "ReplicaSet", "replicasets", true),
    kind("apps", "v1", "StatefulSet", "statefulsets", true),
    kind("apps", "v1", "DaemonSet", "daemonsets", true),
    kind("batch", "v1", "Job", "jobs", true),
    kind("batch", "v1", "CronJob", "cronjobs", true),
    kind("networking.k8s.io", "v1", "Ingress", "ingresses", true),
    kind("kustomize.toolkit.fluxcd.io", "v1", "Kustomization", "kustomizations", true),
    kind("helm.toolkit.fluxcd.io", "v2", "HelmRelease", "helmreleases", true),
    kind("source.toolkit.fluxcd.io", "v1", "GitRepository", "gitrepositories", true),
    kind("source.toolkit.fluxcd.io", "v1", "HelmRepository", "helmrepositories", true),
    kind("source.toolkit.fluxcd.io", "v1beta2", "OCIRepository", "ocirepositories", true),
];

/// Look up a kind by name (case-sensitive, as Kubernetes kinds are).
#[must_use]
pub fn lookup(kind: &str) -> Option<&'static KindInfo> {
    KNOWN_KINDS.iter().find(|info| info.kind == kind)
}

/// Kinds listed when building a dependency graph from the live cluster.
#[must_use]
pub fn graph_kinds() -> Vec<&'static str> {
    KNOWN_KINDS
        .iter()
        .filter(|info| info.namespaced)
        .map(|info| info.kind)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_and_grouped_api_versions() {
        let cm = lookup("ConfigMap").unwrap();
        assert_eq!(cm.api_version(), "v1");
        assert!(cm.namespaced);

        let hr = lookup("HelmRelease").unwrap();
        assert_eq!(hr.api_version(), "helm.toolkit.fluxcd.io/v2");
        let ar = hr.api_resource();
        assert_eq!(ar.plural, "helmreleases");
        assert_eq!(ar.group, "helm.toolkit.fluxcd.io");

        assert!(lookup("configmap").is_none());
        assert!(!lookup("Namespace").unwrap().namespaced);
    }

    #[test]
    fn graph_kinds_are_namespaced() {
        let kinds = graph_kinds();
        assert!(kinds.contains(&"Deployment"));
        assert!(kinds.contains(&"Kustomization"));
        assert!(!kinds.contains(&"Namespace"));
    }
}
