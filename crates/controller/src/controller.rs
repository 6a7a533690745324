//! # Recovery Controller
//!
//! Wires the pipeline together: events are matched against the active
//! pattern store, admitted by the state tracker and handed to a bounded
//! worker pool that runs the executor and releases the outcome.
//!
//! The dispatcher is the only place that admits; workers are the only
//! place that releases. The pattern store is swapped atomically on reload
//! and each job carries its own copy of the action it was admitted with.

use crate::cluster::ClusterApi;
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::events::ClusterEvent;
use crate::executor::{BackupSink, Outcome, RecoveryExecutor};
use crate::graph::GraphBuilder;
use crate::patterns::{PatternMatcher, PatternStore, RecoveryAction};
use crate::report::{AnalysisSummary, StatusReport};
use crate::resource::ResourceKey;
use crate::state::{Admission, AdmissionRequest, DenialReason, RecoveryStateTracker};
use futures::future::join_all;
use kube::Client;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// What the dispatcher decided for one event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Unmatched,
    NotActionable { pattern: String, confidence: f64 },
    Denied { pattern: String, reason: DenialReason },
    Admitted { pattern: String, action: String },
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Unmatched => f.write_str("no pattern matched"),
            Decision::NotActionable { pattern, confidence } => {
                write!(f, "matched {pattern} at confidence {confidence:.2}, not actionable")
            }
            Decision::Denied { pattern, reason } => write!(f, "matched {pattern}, denied ({reason})"),
            Decision::Admitted { pattern, action } => write!(f, "matched {pattern}, running {action}"),
        }
    }
}

/// Admitted recovery waiting for a worker
#[derive(Debug, Clone)]
pub struct RecoveryJob {
    pub key: ResourceKey,
    pub pattern: String,
    pub action: RecoveryAction,
}

/// Dispatch decision plus the outcome when a recovery ran
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedEvent {
    pub key: ResourceKey,
    pub reason: String,
    pub synthetic: bool,
    #[serde(flatten)]
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
}

/// Result of a successful reload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub version: String,
    pub patterns: usize,
    pub actions: usize,
}

pub struct RecoveryController {
    config: RuntimeConfig,
    client: Option<Client>,
    store: RwLock<Arc<PatternStore>>,
    tracker: RecoveryStateTracker,
    executor: RecoveryExecutor,
    last_analysis: RwLock<Option<AnalysisSummary>>,
    dedup_window: watch::Sender<Duration>,
    running: AtomicBool,
}

impl RecoveryController {
    #[must_use]
    pub fn new(
        config: RuntimeConfig,
        store: PatternStore,
        cluster: Arc<dyn ClusterApi>,
        backups: Arc<dyn BackupSink>,
    ) -> Self {
        let settings = store.settings().clone();
        let (dedup_window, _) = watch::channel(settings.dedup_window);
        Self {
            executor: RecoveryExecutor::new(cluster, backups, config.poll),
            tracker: RecoveryStateTracker::new(settings),
            store: RwLock::new(Arc::new(store)),
            last_analysis: RwLock::new(None),
            dedup_window,
            running: AtomicBool::new(false),
            client: None,
            config,
        }
    }

    /// Client used to reload ConfigMap-backed pattern sources.
    #[must_use]
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn tracker(&self) -> &RecoveryStateTracker {
        &self.tracker
    }

    /// Currently active pattern store.
    #[must_use]
    pub fn store(&self) -> Arc<PatternStore> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Dedup window updates for the event watcher.
    #[must_use]
    pub fn dedup_window(&self) -> watch::Receiver<Duration> {
        self.dedup_window.subscribe()
    }

    /// The dispatch loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Match and admit one event. An admitted key stays in progress until
    /// the returned job has been executed and released.
    pub fn dispatch(&self, event: &ClusterEvent) -> (Decision, Option<RecoveryJob>) {
        let key = event.key();
        let store = self.store();
        let matcher = PatternMatcher::new(Arc::clone(&store));

        let Some(matched) = matcher.match_event(event) else {
            return (Decision::Unmatched, None);
        };
        if !matched.actionable {
            return (
                Decision::NotActionable {
                    pattern: matched.pattern,
                    confidence: matched.confidence,
                },
                None,
            );
        }

        let Some(action) = store.action(&matched.recovery_action).cloned() else {
            // Validated at load time; only reachable through a hand-built store
            error!(
                resource = %key,
                pattern = %matched.pattern,
                action = %matched.recovery_action,
                "Matched pattern references a missing recovery action"
            );
            return (Decision::Unmatched, None);
        };

        let request = AdmissionRequest {
            severity: matched.severity,
            pattern: &matched.pattern,
            max_retries: matched.max_retries,
        };
        match self.tracker.admit(&key, request) {
            Admission::Denied(reason) => (
                Decision::Denied {
                    pattern: matched.pattern,
                    reason,
                },
                None,
            ),
            Admission::Admitted => {
                debug!(
                    resource = %key,
                    action = %action.name,
                    synthetic = event.synthetic,
                    "Dispatching recovery"
                );
                let decision = Decision::Admitted {
                    pattern: matched.pattern.clone(),
                    action: action.name.clone(),
                };
                let job = RecoveryJob {
                    key,
                    pattern: matched.pattern,
                    action,
                };
                (decision, Some(job))
            }
        }
    }

    /// Run an admitted job and release its key.
    pub async fn execute(&self, job: &RecoveryJob) -> Outcome {
        let outcome = self.executor.execute(&job.key, &job.action).await;
        let status = self.tracker.release(&job.key, &outcome);
        match &outcome {
            Outcome::Succeeded => info!(
                resource = %job.key,
                pattern = %job.pattern,
                action = %job.action.name,
                status = %status,
                "Recovery succeeded"
            ),
            Outcome::Failed { step, error } => warn!(
                resource = %job.key,
                pattern = %job.pattern,
                action = %job.action.name,
                step = %step,
                error = %error,
                status = %status,
                "Recovery failed"
            ),
        }
        outcome
    }

    /// Dispatch and, when admitted, execute inline.
    pub async fn process(&self, event: &ClusterEvent) -> ProcessedEvent {
        let (decision, job) = self.dispatch(event);
        let outcome = match job {
            Some(job) => Some(self.execute(&job).await),
            None => None,
        };
        ProcessedEvent {
            key: event.key(),
            reason: event.reason.clone(),
            synthetic: event.synthetic,
            decision,
            outcome,
        }
    }

    /// Consume events until the channel closes or shutdown is signalled.
    ///
    /// Admitted jobs go through a bounded queue to a fixed pool of workers.
    /// On shutdown the queue is closed and queued jobs still run to
    /// completion so no key is left in progress.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ClusterEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let workers = self
            .config
            .worker_count(self.tracker.settings().max_concurrent_recoveries);
        let (job_tx, job_rx) = mpsc::channel::<RecoveryJob>(workers);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let controller = Arc::clone(&self);
                let jobs = Arc::clone(&job_rx);
                tokio::spawn(async move {
                    loop {
                        let next = jobs.lock().await.recv().await;
                        let Some(job) = next else {
                            break;
                        };
                        debug!(worker, resource = %job.key, "Worker picked up recovery");
                        controller.execute(&job).await;
                    }
                    debug!(worker, "Recovery worker stopped");
                })
            })
            .collect();

        self.running.store(true, Ordering::SeqCst);
        info!(workers, "Recovery dispatcher started");

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("Event channel closed");
                        break;
                    };
                    let (decision, job) = self.dispatch(&event);
                    match (&decision, job) {
                        (_, Some(job)) => {
                            if job_tx.send(job).await.is_err() {
                                error!("Recovery workers are gone");
                                break;
                            }
                        }
                        (Decision::NotActionable { pattern, confidence }, None) => {
                            info!(
                                resource = %event.key(),
                                pattern = %pattern,
                                confidence,
                                "Pattern observed but not actionable"
                            );
                        }
                        (Decision::Denied { pattern, reason }, None) => {
                            debug!(
                                resource = %event.key(),
                                pattern = %pattern,
                                reason = %reason,
                                "Recovery admission denied"
                            );
                        }
                        _ => {}
                    }
                }
                _ = shutdown.changed() => {
                    info!("Dispatcher shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        drop(job_tx);
        join_all(handles).await;
        info!("All recovery workers finished");
    }

    /// Reload the pattern document. A failed load keeps the active store.
    pub async fn reload(&self) -> Result<ReloadSummary> {
        match PatternStore::load(&self.config.patterns, self.client.as_ref()).await {
            Ok(store) => Ok(self.install(store)),
            Err(e) => {
                error!(
                    source = %self.config.patterns,
                    error = %e,
                    active_version = %self.store().version(),
                    "Pattern reload failed, keeping previous rule set"
                );
                Err(e.into())
            }
        }
    }

    /// Activate an already-validated store.
    pub fn install(&self, store: PatternStore) -> ReloadSummary {
        let summary = ReloadSummary {
            version: store.version().to_string(),
            patterns: store.patterns().len(),
            actions: store.actions().len(),
        };
        let settings = store.settings().clone();

        *self.store.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(store);
        self.dedup_window.send_replace(settings.dedup_window);
        self.tracker.update_settings(settings);

        info!(
            version = %summary.version,
            patterns = summary.patterns,
            actions = summary.actions,
            "Pattern store activated"
        );
        summary
    }

    /// Manually clear a key, typically one in the `failed` state.
    pub fn clear(&self, key: &ResourceKey) -> bool {
        self.tracker.clear(key)
    }

    /// Rebuild the live dependency graph and keep the analysis for reports.
    pub async fn analyze(&self, namespaces: &[String]) -> Result<AnalysisSummary> {
        let graph = GraphBuilder::from_cluster(self.executor.cluster().as_ref(), namespaces)
            .await?
            .build();
        let summary = AnalysisSummary::from_graph(&graph, self.config.spof_threshold);

        if summary.has_cycles() {
            for cycle in &summary.cycles {
                let path: Vec<String> = cycle.iter().map(ToString::to_string).collect();
                warn!(cycle = %path.join(" -> "), "Dependency cycle detected");
            }
        }
        info!(
            nodes = summary.nodes,
            edges = summary.edges,
            cycles = summary.cycles.len(),
            blocked = summary.blocked.len(),
            "Dependency analysis complete"
        );

        *self
            .last_analysis
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(summary.clone());
        Ok(summary)
    }

    /// Refresh the analysis every `analysis_interval` until shutdown.
    pub async fn run_analysis(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let namespaces: Vec<String> = self.config.watch_namespace.iter().cloned().collect();
        let mut ticker = tokio::time::interval(self.config.analysis_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.analyze(&namespaces).await {
                        warn!(error = %e, category = e.category(), "Dependency analysis failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    #[must_use]
    pub fn status_report(&self) -> StatusReport {
        let analysis = self
            .last_analysis
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        StatusReport::new(&self.store(), self.tracker.snapshot(), analysis)
    }
}
