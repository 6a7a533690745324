//! Graph construction from the live cluster or a manifest directory.

use super::extract;
use super::{DependencyGraph, ResourceNode};
use crate::cluster::{kinds, ClusterApi, ClusterError};
use crate::error::{Error, Result};
use crate::resource::ResourceKey;
use kube::api::DynamicObject;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Collects objects, then runs the extraction passes once in [`Self::build`].
#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    objects: BTreeMap<ResourceKey, DynamicObject>,
}

impl GraphBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one object; objects without a kind or name are ignored.
    pub fn add_object(&mut self, object: DynamicObject) -> &mut Self {
        match ResourceKey::from_object(&object) {
            Some(key) => {
                self.objects.insert(key, object);
            }
            None => debug!("Skipping object without kind or name"),
        }
        self
    }

    #[must_use]
    pub fn with_objects(objects: impl IntoIterator<Item = DynamicObject>) -> Self {
        let mut builder = Self::new();
        for object in objects {
            builder.add_object(object);
        }
        builder
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn objects(&self) -> impl Iterator<Item = &DynamicObject> {
        self.objects.values()
    }

    /// List every graph kind, across all namespaces or the given ones.
    ///
    /// Kinds the API server does not serve (e.g. Flux CRDs not installed)
    /// are skipped; connectivity failures abort.
    pub async fn from_cluster(
        cluster: &dyn ClusterApi,
        namespaces: &[String],
    ) -> std::result::Result<Self, ClusterError> {
        let mut builder = Self::new();
        let scopes: Vec<Option<&str>> = if namespaces.is_empty() {
            vec![None]
        } else {
            namespaces.iter().map(|ns| Some(ns.as_str())).collect()
        };

        for kind in kinds::graph_kinds() {
            for scope in &scopes {
                match cluster.list(kind, *scope).await {
                    Ok(objects) => {
                        for object in objects {
                            builder.add_object(object);
                        }
                    }
                    Err(e) if e.is_connectivity() => return Err(e),
                    Err(e) => {
                        warn!(kind, namespace = scope.unwrap_or("<all>"), error = %e, "Skipping kind while building graph");
                    }
                }
            }
        }

        info!(objects = builder.object_count(), "Collected cluster objects for dependency graph");
        Ok(builder)
    }

    /// Read every `.yaml`/`.yml` file under `dir`. Multi-document files and
    /// `kind: List` wrappers are expanded.
    pub fn from_manifest_dir(dir: &Path) -> Result<Self> {
        let mut builder = Self::new();
        let mut files = 0_usize;

        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::Manifest {
                path: dir.display().to_string(),
                details: e.to_string(),
            })?;
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yaml" || e == "yml");
            if !entry.file_type().is_file() || !is_yaml {
                continue;
            }

            let text = std::fs::read_to_string(path)?;
            for object in parse_manifests(&text).map_err(|details| Error::Manifest {
                path: path.display().to_string(),
                details,
            })? {
                builder.add_object(object);
            }
            files += 1;
        }

        info!(
            dir = %dir.display(),
            files,
            objects = builder.object_count(),
            "Loaded manifests for dependency graph"
        );
        Ok(builder)
    }

    /// Run the three extraction passes and assemble the graph.
    #[must_use]
    pub fn build(self) -> DependencyGraph {
        let mut edges = Vec::new();
        for (key, object) in &self.objects {
            edges.extend(extract::all_edges(object, key));
        }

        let nodes = self
            .objects
            .into_iter()
            .map(|(key, object)| ResourceNode::observed(key, object));
        let graph = DependencyGraph::new(nodes, edges);
        debug!(
            nodes = graph.len(),
            edges = graph.edge_count(),
            "Dependency graph built"
        );
        graph
    }
}

/// Split a YAML stream into objects, skipping empty documents.
pub fn parse_manifests(text: &str) -> std::result::Result<Vec<DynamicObject>, String> {
    use serde::Deserialize;

    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(document).map_err(|e| e.to_string())?;
        if value.is_null() {
            continue;
        }

        let is_list = value.get("kind").and_then(serde_yaml::Value::as_str) == Some("List");
        if is_list {
            let items = value
                .get("items")
                .and_then(serde_yaml::Value::as_sequence)
                .cloned()
                .unwrap_or_default();
            for item in items {
                objects.push(serde_yaml::from_value(item).map_err(|e| e.to_string())?);
            }
        } else {
            objects.push(serde_yaml::from_value(value).map_err(|e| e.to_string())?);
        }
    }
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::graph::EdgeKind;
    use std::collections::BTreeSet;

    const MANIFESTS: &str = r"
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
  namespace: apps
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: apps
spec:
  template:
    spec:
      containers:
        - name: web
          envFrom:
            - configMapRef:
                name: settings
---
# comment-only document
---
apiVersion: v1
kind: List
items:
  - apiVersion: v1
    kind: Service
    metadata:
      name: web
      namespace: apps
";

    #[test]
    fn parses_multi_document_streams() {
        let objects = parse_manifests(MANIFESTS).unwrap();
        let kinds: Vec<_> = objects
            .iter()
            .map(|o| o.types.as_ref().unwrap().kind.clone())
            .collect();
        assert_eq!(kinds, vec!["ConfigMap", "Deployment", "Service"]);
    }

    #[test]
    fn manifest_dir_builds_graph() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("apps")).unwrap();
        std::fs::write(dir.path().join("apps/web.yaml"), MANIFESTS).unwrap();
        std::fs::write(dir.path().join("README.md"), "not yaml").unwrap();

        let graph = GraphBuilder::from_manifest_dir(dir.path()).unwrap().build();
        assert_eq!(graph.len(), 3);

        let web = ResourceKey::new("Deployment", "apps", "web");
        let settings = ResourceKey::new("ConfigMap", "apps", "settings");
        assert_eq!(graph.dependencies_of(&web).collect::<Vec<_>>(), vec![&settings]);
        assert!(graph.node(&settings).unwrap().snapshot.is_some());
    }

    #[test]
    fn broken_manifest_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "kind: [unclosed").unwrap();
        let err = GraphBuilder::from_manifest_dir(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Manifest { ref path, .. } if path.ends_with("bad.yaml")));
    }

    #[tokio::test]
    async fn cluster_source_unions_all_passes() {
        let objects: Vec<DynamicObject> = parse_manifests(
            r"
apiVersion: kustomize.toolkit.fluxcd.io/v1
kind: Kustomization
metadata: { name: apps, namespace: flux-system }
spec:
  dependsOn: [{ name: infrastructure }]
  sourceRef: { kind: GitRepository, name: flux-system }
---
apiVersion: apps/v1
kind: ReplicaSet
metadata:
  name: web-1
  namespace: apps
  ownerReferences: [{ apiVersion: apps/v1, kind: Deployment, name: web, uid: d-1 }]
spec:
  template:
    spec:
      containers: [{ name: web }]
      volumes: [{ name: data, persistentVolumeClaim: { claimName: web-data } }]
",
        )
        .unwrap();
        let cluster = InMemoryCluster::with_objects(objects);

        let graph = GraphBuilder::from_cluster(&cluster, &[]).await.unwrap().build();
        let kinds: BTreeSet<EdgeKind> = graph.edges().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            BTreeSet::from([EdgeKind::Ownership, EdgeKind::Data, EdgeKind::Orchestration])
        );
        // Referenced-only nodes are present without snapshots
        let pvc = ResourceKey::new("PersistentVolumeClaim", "apps", "web-data");
        assert!(graph.node(&pvc).unwrap().snapshot.is_none());
    }

    #[tokio::test]
    async fn cluster_outage_aborts() {
        let cluster = InMemoryCluster::new();
        cluster.set_unreachable(true);
        let err = GraphBuilder::from_cluster(&cluster, &[]).await.unwrap_err();
        assert!(err.is_connectivity());
    }
}
