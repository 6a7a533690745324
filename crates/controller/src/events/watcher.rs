//! Event watch loop.
//!
//! Subscribes to core/v1 Events, normalizes and deduplicates them and
//! forwards them on a channel. After every (re)list completes, the known
//! kinds are scanned for objects that are already in a terminal state and
//! synthetic events are emitted for them, so failures that happened while
//! the controller was down are not missed.

use super::{ClusterEvent, EventDeduplicator, InvolvedObject};
use crate::cluster::{assess, ClusterApi, Health};
use crate::config::RuntimeConfig;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Event as KubeEvent;
use kube::runtime::watcher::{self, Event as WatchEvent};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Scan `kinds` for objects in a terminal state and describe each as a
/// synthetic event. List failures are logged and skipped.
pub async fn synthesize_terminal_events(
    cluster: &dyn ClusterApi,
    kinds: &[String],
    namespace: Option<&str>,
) -> Vec<ClusterEvent> {
    let mut events = Vec::new();
    for kind in kinds {
        let objects = match cluster.list(kind, namespace).await {
            Ok(objects) => objects,
            Err(e) => {
                warn!(kind = %kind, error = %e, "Resync scan could not list kind");
                continue;
            }
        };

        for object in objects {
            let Health::Failed { reason, message } = assess(&object) else {
                continue;
            };
            let Some(name) = object.metadata.name.clone() else {
                continue;
            };
            let involved = InvolvedObject {
                kind: kind.clone(),
                namespace: object.metadata.namespace.clone().unwrap_or_default(),
                name,
                uid: object.metadata.uid.clone().unwrap_or_default(),
            };
            debug!(resource = %involved, reason = %reason, "Resync found object in terminal state");

            let mut event = ClusterEvent::new(involved, &reason, &message);
            event.source_resource_version = object.metadata.resource_version.clone().unwrap_or_default();
            event.synthetic = true;
            events.push(event);
        }
    }
    events
}

/// Normalizes watch events and pushes them downstream.
pub(crate) struct EventForwarder {
    dedup: EventDeduplicator,
    tx: mpsc::Sender<ClusterEvent>,
    stale_after: chrono::Duration,
}

impl EventForwarder {
    pub(crate) fn new(tx: mpsc::Sender<ClusterEvent>, dedup_window: Duration, stale_after: Duration) -> Self {
        Self {
            dedup: EventDeduplicator::new(dedup_window),
            tx,
            stale_after: chrono::Duration::from_std(stale_after)
                .unwrap_or_else(|_| chrono::Duration::minutes(15)),
        }
    }

    pub(crate) fn set_window(&mut self, window: Duration) {
        debug!(window_secs = window.as_secs(), "Updating dedup window");
        self.dedup.set_window(window);
    }

    pub(crate) fn prune(&mut self) {
        self.dedup.prune(Utc::now());
    }

    /// Forward one event. Returns `false` once the receiver is gone.
    pub(crate) async fn forward(&mut self, event: ClusterEvent) -> bool {
        if !self.dedup.observe(&event) {
            debug!(resource = %event.involved_object, reason = %event.reason, "Dropping duplicate event");
            return true;
        }
        self.tx.send(event).await.is_ok()
    }

    /// Handle an item from a relist or live watch.
    pub(crate) async fn on_kube_event(&mut self, event: &KubeEvent, relisted: bool) -> bool {
        let Some(normalized) = ClusterEvent::from_kube_event(event) else {
            return true;
        };
        if relisted && Utc::now() - normalized.timestamp > self.stale_after {
            debug!(resource = %normalized.involved_object, "Skipping stale relisted event");
            return true;
        }
        self.forward(normalized).await
    }
}

/// Cluster-wide (or single-namespace) event watch
pub struct EventWatcher {
    client: Client,
    cluster: Arc<dyn ClusterApi>,
    namespace: Option<String>,
    resync_kinds: Vec<String>,
    keepalive: Duration,
    stale_after: Duration,
}

impl EventWatcher {
    #[must_use]
    pub fn new(client: Client, cluster: Arc<dyn ClusterApi>, config: &RuntimeConfig) -> Self {
        Self {
            client,
            cluster,
            namespace: config.watch_namespace.clone(),
            resync_kinds: config.resync_kinds.clone(),
            keepalive: config.keepalive_interval,
            stale_after: config.stale_event_age,
        }
    }

    /// Run until shutdown is signalled or the receiver goes away.
    ///
    /// `window` carries dedup-window updates from reloads.
    pub async fn run(
        self,
        tx: mpsc::Sender<ClusterEvent>,
        mut window: watch::Receiver<Duration>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let api: Api<KubeEvent> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);

        let initial_window = *window.borrow_and_update();
        let mut forwarder = EventForwarder::new(tx, initial_window, self.stale_after);
        let mut keepalive = tokio::time::interval(self.keepalive);
        let mut window_open = true;
        let mut relisting = false;

        info!(
            namespace = self.namespace.as_deref().unwrap_or("<all>"),
            "Starting event watch"
        );

        loop {
            tokio::select! {
                item = stream.next() => {
                    let keep_going = match item {
                        Some(Ok(WatchEvent::Init)) => {
                            debug!("Event re-list started");
                            relisting = true;
                            true
                        }
                        Some(Ok(WatchEvent::InitApply(event))) => {
                            forwarder.on_kube_event(&event, true).await
                        }
                        Some(Ok(WatchEvent::InitDone)) => {
                            relisting = false;
                            self.resync(&mut forwarder).await
                        }
                        Some(Ok(WatchEvent::Apply(event))) => {
                            forwarder.on_kube_event(&event, relisting).await
                        }
                        Some(Ok(WatchEvent::Delete(_))) => true,
                        Some(Err(e)) => {
                            warn!(error = %e, "Event watch error, backing off");
                            true
                        }
                        None => {
                            warn!("Event watch stream ended");
                            false
                        }
                    };
                    if !keep_going {
                        break;
                    }
                }
                _ = keepalive.tick() => {
                    forwarder.prune();
                }
                changed = window.changed(), if window_open => {
                    if changed.is_ok() {
                        let next = *window.borrow_and_update();
                        forwarder.set_window(next);
                    } else {
                        window_open = false;
                    }
                }
                _ = shutdown.changed() => {
                    info!("Event watch shutting down");
                    break;
                }
            }
        }
    }

    async fn resync(&self, forwarder: &mut EventForwarder) -> bool {
        let events =
            synthesize_terminal_events(self.cluster.as_ref(), &self.resync_kinds, self.namespace.as_deref())
                .await;
        info!(found = events.len(), "Resync scan complete");
        for event in events {
            if !forwarder.forward(event).await {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use kube::api::DynamicObject;
    use serde_json::json;

    fn stalled_kustomization() -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "kustomize.toolkit.fluxcd.io/v1",
            "kind": "Kustomization",
            "metadata": { "name": "apps", "namespace": "flux-system", "uid": "k-1", "resourceVersion": "7" },
            "status": { "conditions": [
                { "type": "Ready", "status": "False", "reason": "ReconciliationFailed",
                  "message": "Deployment/apps/web dry-run failed: field is immutable" }
            ]}
        }))
        .unwrap()
    }

    fn healthy_deployment() -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "apps" },
            "spec": { "replicas": 1 },
            "status": { "readyReplicas": 1 }
        }))
        .unwrap()
    }

    fn kube_event(timestamp: &str) -> KubeEvent {
        serde_json::from_value(json!({
            "metadata": { "name": "web.1", "namespace": "apps" },
            "involvedObject": { "kind": "Deployment", "namespace": "apps", "name": "web", "uid": "d-1" },
            "reason": "FailedUpdate",
            "message": "field is immutable",
            "lastTimestamp": timestamp
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn resync_emits_synthetic_events_for_terminal_objects() {
        let cluster = InMemoryCluster::with_objects([stalled_kustomization(), healthy_deployment()]);
        let kinds = vec!["Kustomization".to_string(), "Deployment".to_string()];

        let events = synthesize_terminal_events(&cluster, &kinds, None).await;
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert!(event.synthetic);
        assert_eq!(event.involved_object.uid, "k-1");
        assert_eq!(event.reason, "ReconciliationFailed");
        assert!(event.message.contains("field is immutable"));
        assert_eq!(event.source_resource_version, "7");
    }

    #[tokio::test]
    async fn resync_survives_unlistable_kinds() {
        let cluster = InMemoryCluster::with_objects([stalled_kustomization()]);
        cluster.set_unreachable(true);
        let events = synthesize_terminal_events(&cluster, &["Kustomization".to_string()], None).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn forwarder_dedups_and_skips_stale_relists() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut forwarder = EventForwarder::new(tx, Duration::from_secs(30), Duration::from_secs(900));

        let fresh = kube_event(&Utc::now().to_rfc3339());
        assert!(forwarder.on_kube_event(&fresh, false).await);
        assert!(forwarder.on_kube_event(&fresh, false).await);
        assert_eq!(rx.recv().await.unwrap().reason, "FailedUpdate");
        assert!(rx.try_recv().is_err());

        let old = kube_event("2020-01-01T00:00:00Z");
        assert!(forwarder.on_kube_event(&old, true).await);
        assert!(rx.try_recv().is_err());

        // The same old event arriving live is still forwarded
        assert!(forwarder.on_kube_event(&old, false).await);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn forwarder_reports_closed_receiver() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut forwarder = EventForwarder::new(tx, Duration::from_secs(30), Duration::from_secs(900));
        assert!(!forwarder.on_kube_event(&kube_event(&Utc::now().to_rfc3339()), false).await);
    }
}
