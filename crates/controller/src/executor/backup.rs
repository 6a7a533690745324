//! Backup sinks for `backup_resource_spec`.

use crate::resource::ResourceKey;
use async_trait::async_trait;
use chrono::Utc;
use kube::api::DynamicObject;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;

/// Directory used for cluster-scoped objects in the file layout
const CLUSTER_SCOPE_DIR: &str = "_cluster";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackupError {
    #[error("IO error at {path}: {details}")]
    Io { path: String, details: String },

    #[error("could not serialize {key}: {details}")]
    Serialize { key: String, details: String },

    #[error("backup rejected: {0}")]
    Rejected(String),
}

/// Durable store for pre-deletion snapshots
#[async_trait]
pub trait BackupSink: Send + Sync {
    /// Persist a snapshot and return where it went.
    async fn store(&self, key: &ResourceKey, object: &DynamicObject) -> Result<String, BackupError>;

    /// Most recent snapshot for `key`, if any.
    async fn latest(&self, key: &ResourceKey) -> Result<Option<DynamicObject>, BackupError>;
}

/// Writes `<root>/<kind>/<namespace>/<name>/<timestamp>.yaml`
#[derive(Debug, Clone)]
pub struct FileBackupSink {
    root: PathBuf,
}

impl FileBackupSink {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, key: &ResourceKey) -> PathBuf {
        let namespace = key.namespace().unwrap_or(CLUSTER_SCOPE_DIR);
        self.root.join(&key.kind).join(namespace).join(&key.name)
    }
}

fn io_error(path: &Path, err: &std::io::Error) -> BackupError {
    BackupError::Io {
        path: path.display().to_string(),
        details: err.to_string(),
    }
}

#[async_trait]
impl BackupSink for FileBackupSink {
    async fn store(&self, key: &ResourceKey, object: &DynamicObject) -> Result<String, BackupError> {
        let dir = self.dir_for(key);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, &e))?;

        let yaml = serde_yaml::to_string(object).map_err(|e| BackupError::Serialize {
            key: key.to_string(),
            details: e.to_string(),
        })?;

        // Lexical order of the file names is chronological order
        let file = dir.join(format!("{}.yaml", Utc::now().format("%Y%m%dT%H%M%S%.6fZ")));
        tokio::fs::write(&file, yaml)
            .await
            .map_err(|e| io_error(&file, &e))?;

        debug!(resource = %key, path = %file.display(), "Backup written");
        Ok(file.display().to_string())
    }

    async fn latest(&self, key: &ResourceKey) -> Result<Option<DynamicObject>, BackupError> {
        let dir = self.dir_for(key);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&dir, &e)),
        };

        let mut newest: Option<PathBuf> = None;
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, &e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            if newest.as_ref().is_none_or(|current| path > *current) {
                newest = Some(path);
            }
        }

        let Some(path) = newest else {
            return Ok(None);
        };
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_error(&path, &e))?;
        let object = serde_yaml::from_str(&text).map_err(|e| BackupError::Serialize {
            key: key.to_string(),
            details: e.to_string(),
        })?;
        Ok(Some(object))
    }
}

/// Keeps snapshots in memory; used by `dry-run` and tests
#[derive(Debug, Default)]
pub struct MemoryBackupSink {
    snapshots: Mutex<BTreeMap<ResourceKey, Vec<DynamicObject>>>,
    reject: Mutex<bool>,
}

impl MemoryBackupSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `store` fail.
    pub fn reject_writes(&self, reject: bool) {
        *self.reject.lock().unwrap_or_else(PoisonError::into_inner) = reject;
    }

    fn snapshots(&self) -> MutexGuard<'_, BTreeMap<ResourceKey, Vec<DynamicObject>>> {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn count(&self, key: &ResourceKey) -> usize {
        self.snapshots().get(key).map_or(0, Vec::len)
    }
}

#[async_trait]
impl BackupSink for MemoryBackupSink {
    async fn store(&self, key: &ResourceKey, object: &DynamicObject) -> Result<String, BackupError> {
        if *self.reject.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(BackupError::Rejected(format!("writes disabled for {key}")));
        }
        let mut snapshots = self.snapshots();
        let entry = snapshots.entry(key.clone()).or_default();
        entry.push(object.clone());
        Ok(format!("memory://{key}#{}", entry.len()))
    }

    async fn latest(&self, key: &ResourceKey) -> Result<Option<DynamicObject>, BackupError> {
        Ok(self.snapshots().get(key).and_then(|v| v.last().cloned()))
    }
}
