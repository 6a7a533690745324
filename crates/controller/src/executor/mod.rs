//! # Recovery Action Executor
//!
//! Runs the steps of one recovery action against one resource, strictly in
//! declared order, under the action's overall deadline. The first failing
//! step aborts the action and is reported in the [`Outcome`].

pub mod backup;

use crate::cluster::{assess, ClusterApi, ClusterError, DeleteOptions, Health};
use crate::config::PollConfig;
use crate::graph::{EdgeKind, GraphBuilder};
use crate::patterns::{RecoveryAction, Step};
use crate::resource::ResourceKey;
use futures::future::join_all;
use kube::api::DynamicObject;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

pub use backup::{BackupError, BackupSink, FileBackupSink, MemoryBackupSink};

/// Why a step failed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error("target vanished: {0} was deleted outside the recovery")]
    TargetVanished(ResourceKey),

    #[error("cluster API error: {0}")]
    Api(#[from] ClusterError),

    #[error("action deadline of {}s exceeded", .0.as_secs())]
    DeadlineExceeded(Duration),

    #[error("verification timed out after {}s (last seen: {last_health})", .waited.as_secs())]
    VerificationTimeout { waited: Duration, last_health: String },

    #[error("backup failed: {0}")]
    BackupFailed(#[from] BackupError),

    #[error("no backup snapshot available for {0}")]
    NoBackup(ResourceKey),

    #[error("cannot order dependent cleanup: {0}")]
    Cycle(String),

    #[error("invalid object after applying spec patch: {0}")]
    InvalidPatch(String),
}

/// Result of one recovery attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded,
    Failed { step: Step, error: StepError },
}

impl Outcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }

    /// One-line description for state records and reports.
    #[must_use]
    pub fn summary(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Succeeded => f.write_str("succeeded"),
            Outcome::Failed { step, error } => write!(f, "failed at {step}: {error}"),
        }
    }
}

impl Serialize for Outcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.summary())
    }
}

/// Per-attempt working state
struct Attempt<'a> {
    key: &'a ResourceKey,
    action: &'a RecoveryAction,
    deadline: Instant,
    snapshot: Option<DynamicObject>,
    /// Owned dependents captured before the target is deleted
    owned: Option<Vec<ResourceKey>>,
}

/// Executes recovery actions through the cluster seam
#[derive(Clone)]
pub struct RecoveryExecutor {
    cluster: Arc<dyn ClusterApi>,
    backups: Arc<dyn BackupSink>,
    poll: PollConfig,
}

impl RecoveryExecutor {
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterApi>, backups: Arc<dyn BackupSink>, poll: PollConfig) -> Self {
        Self {
            cluster,
            backups,
            poll,
        }
    }

    #[must_use]
    pub fn cluster(&self) -> &Arc<dyn ClusterApi> {
        &self.cluster
    }

    /// Run every step of `action` against `key`.
    pub async fn execute(&self, key: &ResourceKey, action: &RecoveryAction) -> Outcome {
        let started = Instant::now();
        let mut attempt = Attempt {
            key,
            action,
            deadline: started + action.timeout,
            snapshot: None,
            owned: None,
        };

        info!(
            resource = %key,
            action = %action.name,
            steps = action.steps.len(),
            timeout_secs = action.timeout.as_secs(),
            "Starting recovery action"
        );

        for step in &action.steps {
            debug!(resource = %key, action = %action.name, step = %step, "Executing recovery step");
            let result = match timeout_at(attempt.deadline, self.run_step(*step, &mut attempt)).await {
                Ok(result) => result,
                Err(_) => Err(StepError::DeadlineExceeded(action.timeout)),
            };

            if let Err(error) = result {
                warn!(
                    resource = %key,
                    action = %action.name,
                    step = %step,
                    error = %error,
                    "Recovery step failed, aborting action"
                );
                return Outcome::Failed { step: *step, error };
            }
            info!(resource = %key, action = %action.name, step = %step, "Recovery step completed");
        }

        info!(
            resource = %key,
            action = %action.name,
            elapsed_secs = started.elapsed().as_secs(),
            "Recovery action succeeded"
        );
        Outcome::Succeeded
    }

    async fn run_step(&self, step: Step, attempt: &mut Attempt<'_>) -> Result<(), StepError> {
        match step {
            Step::BackupResourceSpec => self.backup(attempt).await,
            Step::DeleteResourceGracefully => self.delete_target(attempt).await,
            Step::CleanupDependencies => self.cleanup_dependencies(attempt).await,
            Step::RecreateResource => self.recreate(attempt).await,
            Step::VerifyRecovery => self.verify(attempt).await,
        }
    }

    /// Current object, or `TargetVanished` if someone else removed it.
    async fn require_target(&self, key: &ResourceKey) -> Result<DynamicObject, StepError> {
        match self.cluster.get(key).await? {
            Some(object) if object.metadata.deletion_timestamp.is_none() => Ok(object),
            _ => Err(StepError::TargetVanished(key.clone())),
        }
    }

    async fn backup(&self, attempt: &mut Attempt<'_>) -> Result<(), StepError> {
        let object = self.require_target(attempt.key).await?;
        let location = self.backups.store(attempt.key, &object).await?;
        info!(resource = %attempt.key, location = %location, "Resource spec backed up");
        attempt.snapshot = Some(object);
        Ok(())
    }

    async fn delete_target(&self, attempt: &mut Attempt<'_>) -> Result<(), StepError> {
        let object = self.require_target(attempt.key).await?;
        if attempt.snapshot.is_none() {
            attempt.snapshot = Some(object);
        }

        // Dependents are garbage collected along with the owner, so capture them first
        if attempt.action.steps.contains(&Step::CleanupDependencies) {
            attempt.owned = Some(self.owned_dependents(attempt.key).await?);
        }

        let options = DeleteOptions {
            grace_period: attempt.action.grace_period,
            propagation: attempt.action.propagation,
        };
        if !self.cluster.delete(attempt.key, &options).await? {
            return Err(StepError::TargetVanished(attempt.key.clone()));
        }
        self.wait_for_removal(attempt.key).await
    }

    async fn owned_dependents(&self, key: &ResourceKey) -> Result<Vec<ResourceKey>, StepError> {
        let namespaces: Vec<String> = key.namespace().map(str::to_string).into_iter().collect();
        let graph = GraphBuilder::from_cluster(self.cluster.as_ref(), &namespaces)
            .await?
            .build();
        Ok(graph.owned_closure(key).into_iter().collect())
    }

    async fn cleanup_dependencies(&self, attempt: &mut Attempt<'_>) -> Result<(), StepError> {
        let owned = match attempt.owned.take() {
            Some(owned) => owned,
            None => self.owned_dependents(attempt.key).await?,
        };
        if owned.is_empty() {
            debug!(resource = %attempt.key, "No owned dependents to clean up");
            return Ok(());
        }

        // Order among the dependents themselves from a fresh graph
        let namespaces: Vec<String> = attempt.key.namespace().map(str::to_string).into_iter().collect();
        let graph = GraphBuilder::from_cluster(self.cluster.as_ref(), &namespaces)
            .await?
            .build();
        let scope = owned.iter().cloned().collect();
        let plan = graph
            .subgraph(&scope)
            .order()
            .map_err(|e| StepError::Cycle(e.to_string()))?;

        let mut remaining: BTreeSet<ResourceKey> = scope;
        for (index, batch) in plan.cleanup_batches.iter().enumerate() {
            info!(
                resource = %attempt.key,
                batch = index,
                size = batch.len(),
                "Cleaning up dependent batch"
            );
            let results = join_all(batch.iter().map(|dependent| self.delete_dependent(dependent))).await;
            for result in results {
                result?;
            }
            for dependent in batch {
                remaining.remove(dependent);
            }
        }

        // Dependents already collected by the garbage collector are not in the fresh graph
        for gone in &remaining {
            debug!(resource = %gone, "Dependent already removed");
        }

        for edge in graph.edges() {
            if &edge.to == attempt.key && edge.kind != EdgeKind::Ownership {
                info!(
                    resource = %attempt.key,
                    dependent = %edge.from,
                    kind = %edge.kind,
                    "Leaving non-owned dependent in place"
                );
            }
        }
        Ok(())
    }

    async fn delete_dependent(&self, key: &ResourceKey) -> Result<(), StepError> {
        if self.cluster.delete(key, &DeleteOptions::default()).await? {
            self.wait_for_removal(key).await?;
        }
        Ok(())
    }

    async fn wait_for_removal(&self, key: &ResourceKey) -> Result<(), StepError> {
        let mut delay = self.poll.initial;
        loop {
            if self.cluster.get(key).await?.is_none() {
                debug!(resource = %key, "Deletion observed");
                return Ok(());
            }
            sleep(delay).await;
            delay = self.poll.next(delay);
        }
    }

    async fn recreate(&self, attempt: &mut Attempt<'_>) -> Result<(), StepError> {
        let snapshot = match attempt.snapshot.clone() {
            Some(snapshot) => snapshot,
            None => self
                .backups
                .latest(attempt.key)
                .await?
                .ok_or_else(|| StepError::NoBackup(attempt.key.clone()))?,
        };

        let manifest = prepare_for_create(&snapshot, attempt.action.spec_patch.as_ref())?;
        match self.cluster.create(&manifest).await {
            Ok(created) => {
                info!(
                    resource = %attempt.key,
                    uid = created.metadata.uid.as_deref().unwrap_or_default(),
                    patched = attempt.action.spec_patch.is_some(),
                    "Resource recreated"
                );
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                // A GitOps reconciler got there first
                info!(resource = %attempt.key, "Resource already recreated by another actor");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn verify(&self, attempt: &mut Attempt<'_>) -> Result<(), StepError> {
        let verify_timeout = attempt.action.verify_timeout;
        let started = Instant::now();
        let give_up = started + verify_timeout;
        let mut delay = self.poll.initial;

        loop {
            let object = self.require_target(attempt.key).await?;
            let health = assess(&object);
            if health == Health::Healthy {
                info!(
                    resource = %attempt.key,
                    waited_secs = started.elapsed().as_secs(),
                    "Recovery verified healthy"
                );
                return Ok(());
            }
            debug!(resource = %attempt.key, health = %health, "Waiting for recovered resource");

            let now = Instant::now();
            if now >= give_up {
                return Err(StepError::VerificationTimeout {
                    waited: verify_timeout,
                    last_health: health.to_string(),
                });
            }
            sleep(delay.min(give_up - now)).await;
            delay = self.poll.next(delay);
        }
    }
}

/// Server-populated metadata that must not be sent on create
const SERVER_METADATA: &[&str] = &[
    "uid",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "managedFields",
    "selfLink",
];

/// Turn a snapshot into a creatable manifest: strip server-owned fields and
/// `status`, then apply the optional JSON merge patch.
pub fn prepare_for_create(
    snapshot: &DynamicObject,
    spec_patch: Option<&serde_json::Value>,
) -> Result<DynamicObject, StepError> {
    let mut value =
        serde_json::to_value(snapshot).map_err(|e| StepError::InvalidPatch(e.to_string()))?;

    if let Some(object) = value.as_object_mut() {
        object.remove("status");
        if let Some(metadata) = object.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            for field in SERVER_METADATA {
                metadata.remove(*field);
            }
        }
    }
    if let Some(patch) = spec_patch {
        json_patch::merge(&mut value, patch);
    }

    let manifest: DynamicObject =
        serde_json::from_value(value).map_err(|e| StepError::InvalidPatch(e.to_string()))?;
    if manifest.metadata.name.is_none() || manifest.types.is_none() {
        return Err(StepError::InvalidPatch(
            "patched object lost its kind or name".to_string(),
        ));
    }
    Ok(manifest)
}
