//! Resource identity shared by every component.

use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use std::fmt;

/// `(kind, namespace, name)` identity of a cluster object.
///
/// Cluster-scoped objects carry an empty namespace. Ordering is lexical on
/// `(kind, namespace, name)` so graph algorithms iterate deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    #[must_use]
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object.
    #[must_use]
    pub fn cluster_scoped(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(kind, "", name)
    }

    /// Build a key from a dynamic object, if it carries a kind and a name.
    #[must_use]
    pub fn from_object(obj: &DynamicObject) -> Option<Self> {
        let kind = obj.types.as_ref()?.kind.clone();
        let name = obj.metadata.name.clone()?;
        let namespace = obj.metadata.namespace.clone().unwrap_or_default();
        Some(Self {
            kind,
            namespace,
            name,
        })
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(&self.namespace)
        }
    }

    /// Parse `Kind/namespace/name` or `Kind/name` (cluster-scoped).
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [kind, name] if !kind.is_empty() && !name.is_empty() => {
                Some(Self::cluster_scoped(*kind, *name))
            }
            [kind, namespace, name] if !kind.is_empty() && !name.is_empty() => {
                Some(Self::new(*kind, *namespace, *name))
            }
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_agree() {
        let key = ResourceKey::parse("Deployment/apps/web").unwrap();
        assert_eq!(key, ResourceKey::new("Deployment", "apps", "web"));
        assert_eq!(key.to_string(), "Deployment/apps/web");

        let node = ResourceKey::parse("Node/worker-1").unwrap();
        assert_eq!(node.namespace(), None);
        assert_eq!(node.to_string(), "Node/worker-1");

        assert!(ResourceKey::parse("Deployment").is_none());
        assert!(ResourceKey::parse("a/b/c/d").is_none());
    }

    #[test]
    fn from_object_requires_kind_and_name() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "settings", "namespace": "apps" },
        }))
        .unwrap();
        assert_eq!(
            ResourceKey::from_object(&obj),
            Some(ResourceKey::new("ConfigMap", "apps", "settings"))
        );

        let nameless: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {},
        }))
        .unwrap();
        assert_eq!(ResourceKey::from_object(&nameless), None);
    }
}
