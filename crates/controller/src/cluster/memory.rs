//! In-memory [`ClusterApi`] used by `dry-run` and the test suites.
//!
//! Deletes can be made to linger for a number of reads to mimic finalizers
//! and graceful termination, and every mutation is journaled so callers can
//! assert on the exact order of side effects.

use super::{ClusterApi, ClusterError, DeleteOptions};
use crate::resource::ResourceKey;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::DynamicObject;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A recorded mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterOp {
    Delete(ResourceKey),
    Create(ResourceKey),
}

impl ClusterOp {
    #[must_use]
    pub fn key(&self) -> &ResourceKey {
        match self {
            ClusterOp::Delete(key) | ClusterOp::Create(key) => key,
        }
    }
}

impl fmt::Display for ClusterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterOp::Delete(key) => write!(f, "delete {key}"),
            ClusterOp::Create(key) => write!(f, "create {key}"),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<ResourceKey, DynamicObject>,
    /// Deleted objects still visible, with the number of reads left
    terminating: BTreeMap<ResourceKey, u32>,
    journal: Vec<ClusterOp>,
    delete_lag: u32,
    auto_ready: bool,
    failing_creates: BTreeSet<ResourceKey>,
    failing_deletes: BTreeSet<ResourceKey>,
    unreachable: bool,
    next_version: u64,
}

/// Object map behind a mutex
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    inner: Mutex<Inner>,
}

impl InMemoryCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from existing objects. Objects without a kind or name are skipped.
    #[must_use]
    pub fn with_objects(objects: impl IntoIterator<Item = DynamicObject>) -> Self {
        let cluster = Self::new();
        for object in objects {
            cluster.insert(object);
        }
        cluster
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace an object without journaling.
    pub fn insert(&self, object: DynamicObject) -> Option<ResourceKey> {
        let key = ResourceKey::from_object(&object)?;
        let mut inner = self.lock();
        inner.terminating.remove(&key);
        inner.objects.insert(key.clone(), object);
        Some(key)
    }

    /// Remove an object out-of-band (an external actor deleting it).
    pub fn remove(&self, key: &ResourceKey) -> Option<DynamicObject> {
        let mut inner = self.lock();
        inner.terminating.remove(key);
        inner.objects.remove(key)
    }

    /// Number of reads a deleted object stays visible for.
    pub fn set_delete_lag(&self, reads: u32) {
        self.lock().delete_lag = reads;
    }

    /// Give created objects a status that reads as healthy.
    pub fn set_auto_ready(&self, enabled: bool) {
        self.lock().auto_ready = enabled;
    }

    /// Make every create of `key` fail with a server error.
    pub fn fail_creates(&self, key: ResourceKey) {
        self.lock().failing_creates.insert(key);
    }

    /// Make every delete of `key` fail with a server error.
    pub fn fail_deletes(&self, key: ResourceKey) {
        self.lock().failing_deletes.insert(key);
    }

    /// Simulate a lost API server.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Overwrite the `status` of a stored object.
    pub fn set_status(&self, key: &ResourceKey, status: serde_json::Value) -> bool {
        let mut inner = self.lock();
        match inner.objects.get_mut(key) {
            Some(object) => {
                set_field(object, "status", status);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn journal(&self) -> Vec<ClusterOp> {
        self.lock().journal.clone()
    }

    #[must_use]
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.lock().objects.contains_key(key)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<ResourceKey> {
        self.lock().objects.keys().cloned().collect()
    }

    #[must_use]
    pub fn objects(&self) -> Vec<DynamicObject> {
        self.lock().objects.values().cloned().collect()
    }

    fn check_reachable(inner: &Inner) -> Result<(), ClusterError> {
        if inner.unreachable {
            return Err(ClusterError::Connectivity(
                "in-memory cluster marked unreachable".to_string(),
            ));
        }
        Ok(())
    }
}

fn set_field(object: &mut DynamicObject, field: &str, value: serde_json::Value) {
    if !object.data.is_object() {
        object.data = serde_json::Value::Object(serde_json::Map::new());
    }
    if let Some(map) = object.data.as_object_mut() {
        map.insert(field.to_string(), value);
    }
}

/// Status that [`super::health::assess`] reads as healthy for the kind.
fn ready_status(object: &DynamicObject, kind: &str) -> serde_json::Value {
    let replicas = object
        .data
        .pointer("/spec/replicas")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(1);
    let generation = object.metadata.generation.unwrap_or(1);
    match kind {
        "Deployment" => json!({
            "observedGeneration": generation,
            "replicas": replicas,
            "updatedReplicas": replicas,
            "readyReplicas": replicas,
            "availableReplicas": replicas,
            "conditions": [
                { "type": "Available", "status": "True", "reason": "MinimumReplicasAvailable" },
                { "type": "Progressing", "status": "True", "reason": "NewReplicaSetAvailable" }
            ]
        }),
        "StatefulSet" | "ReplicaSet" => json!({
            "observedGeneration": generation,
            "replicas": replicas,
            "readyReplicas": replicas,
            "availableReplicas": replicas,
        }),
        "DaemonSet" => json!({
            "observedGeneration": generation,
            "desiredNumberScheduled": 1,
            "numberReady": 1,
        }),
        "Pod" => json!({ "phase": "Running" }),
        "Job" => json!({
            "succeeded": 1,
            "conditions": [{ "type": "Complete", "status": "True" }]
        }),
        _ => json!({
            "observedGeneration": generation,
            "conditions": [
                { "type": "Ready", "status": "True", "reason": "ReconciliationSucceeded" }
            ]
        }),
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn get(&self, key: &ResourceKey) -> Result<Option<DynamicObject>, ClusterError> {
        let mut inner = self.lock();
        Self::check_reachable(&inner)?;

        let object = inner.objects.get(key).cloned();
        if let Some(reads_left) = inner.terminating.get_mut(key) {
            if *reads_left == 0 {
                inner.terminating.remove(key);
                inner.objects.remove(key);
                return Ok(None);
            }
            *reads_left -= 1;
        }
        Ok(object)
    }

    async fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        let inner = self.lock();
        Self::check_reachable(&inner)?;
        Ok(inner
            .objects
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .filter(|(key, _)| namespace.map_or(true, |ns| key.namespace == ns))
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn delete(&self, key: &ResourceKey, _options: &DeleteOptions) -> Result<bool, ClusterError> {
        let mut inner = self.lock();
        Self::check_reachable(&inner)?;
        if inner.failing_deletes.contains(key) {
            return Err(ClusterError::Api {
                code: 500,
                message: format!("injected delete failure for {key}"),
            });
        }
        if !inner.objects.contains_key(key) || inner.terminating.contains_key(key) {
            return Ok(false);
        }

        inner.journal.push(ClusterOp::Delete(key.clone()));
        let lag = inner.delete_lag;
        if lag == 0 {
            inner.objects.remove(key);
        } else {
            if let Some(object) = inner.objects.get_mut(key) {
                object.metadata.deletion_timestamp = Some(Time(Utc::now()));
            }
            inner.terminating.insert(key.clone(), lag);
        }
        Ok(true)
    }

    async fn create(&self, object: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let key = ResourceKey::from_object(object)
            .ok_or_else(|| ClusterError::InvalidObject("object has no kind or name".to_string()))?;

        let mut inner = self.lock();
        Self::check_reachable(&inner)?;
        if inner.failing_creates.contains(&key) {
            return Err(ClusterError::Api {
                code: 500,
                message: format!("injected create failure for {key}"),
            });
        }
        if inner.objects.contains_key(&key) {
            return Err(ClusterError::Api {
                code: 409,
                message: format!("{key} already exists"),
            });
        }

        inner.next_version += 1;
        let version = inner.next_version;
        let mut created = object.clone();
        created.metadata.uid = Some(format!("mem-{version}"));
        created.metadata.resource_version = Some(version.to_string());
        created.metadata.generation = Some(1);
        created.metadata.deletion_timestamp = None;
        if inner.auto_ready {
            let status = ready_status(&created, &key.kind);
            set_field(&mut created, "status", status);
        }

        inner.journal.push(ClusterOp::Create(key.clone()));
        inner.objects.insert(key, created.clone());
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(name: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": name, "namespace": "apps", "uid": "orig" },
            "spec": { "replicas": 2 }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn delete_lingers_for_configured_reads() {
        let cluster = InMemoryCluster::with_objects([deployment("web")]);
        cluster.set_delete_lag(2);
        let key = ResourceKey::new("Deployment", "apps", "web");

        assert!(cluster.delete(&key, &DeleteOptions::default()).await.unwrap());
        // Second delete of a terminating object is a no-op
        assert!(!cluster.delete(&key, &DeleteOptions::default()).await.unwrap());

        let first = cluster.get(&key).await.unwrap().unwrap();
        assert!(first.metadata.deletion_timestamp.is_some());
        assert!(cluster.get(&key).await.unwrap().is_some());
        assert!(cluster.get(&key).await.unwrap().is_none());
        assert_eq!(cluster.journal(), vec![ClusterOp::Delete(key)]);
    }

    #[tokio::test]
    async fn create_assigns_identity_and_ready_status() {
        let cluster = InMemoryCluster::new();
        cluster.set_auto_ready(true);

        let created = cluster.create(&deployment("web")).await.unwrap();
        assert_eq!(created.metadata.uid.as_deref(), Some("mem-1"));
        assert_eq!(
            created.data.pointer("/status/readyReplicas"),
            Some(&json!(2))
        );

        let err = cluster.create(&deployment("web")).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn injected_failures_and_outage() {
        let cluster = InMemoryCluster::new();
        let key = ResourceKey::new("Deployment", "apps", "web");
        cluster.fail_creates(key.clone());
        assert!(matches!(
            cluster.create(&deployment("web")).await,
            Err(ClusterError::Api { code: 500, .. })
        ));

        cluster.set_unreachable(true);
        assert!(cluster.get(&key).await.unwrap_err().is_connectivity());
        assert!(cluster.journal().is_empty());
    }

    #[tokio::test]
    async fn list_filters_by_kind_and_namespace() {
        let mut other = deployment("api");
        other.metadata.namespace = Some("infra".to_string());
        let cluster = InMemoryCluster::with_objects([deployment("web"), other]);

        assert_eq!(cluster.list("Deployment", None).await.unwrap().len(), 2);
        assert_eq!(cluster.list("Deployment", Some("apps")).await.unwrap().len(), 1);
        assert!(cluster.list("StatefulSet", None).await.unwrap().is_empty());
    }
}
