//! End-to-end recovery against the in-memory cluster.

use kube::api::DynamicObject;
use recovery_controller::cluster::{ClusterOp, InMemoryCluster};
use recovery_controller::config::RuntimeConfig;
use recovery_controller::controller::Decision;
use recovery_controller::events::{
    synthesize_terminal_events, ClusterEvent, EventDeduplicator, InvolvedObject,
};
use recovery_controller::executor::{MemoryBackupSink, Outcome, StepError};
use recovery_controller::graph::{builder::parse_manifests, DependencyEdge, GraphBuilder};
use recovery_controller::patterns::{PatternStore, Step};
use recovery_controller::state::{DenialReason, RecoveryStatus};
use recovery_controller::{ClusterApi, RecoveryController, ResourceKey};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MANIFESTS: &str = r"
apiVersion: v1
kind: ConfigMap
metadata: { name: settings, namespace: apps, uid: cm-1 }
data: { LOG_LEVEL: info }
---
apiVersion: v1
kind: Secret
metadata: { name: tls, namespace: apps, uid: s-1 }
---
apiVersion: apps/v1
kind: Deployment
metadata: { name: web, namespace: apps, uid: d-1, resourceVersion: '41', generation: 7 }
spec:
  replicas: 2
  selector: { matchLabels: { app: web } }
  template:
    metadata: { labels: { app: web } }
    spec:
      containers:
        - name: web
          envFrom: [{ configMapRef: { name: settings } }]
      volumes:
        - name: certs
          secret: { secretName: tls }
status: { readyReplicas: 0 }
---
apiVersion: kustomize.toolkit.fluxcd.io/v1
kind: Kustomization
metadata: { name: apps, namespace: flux-system, uid: k-1 }
spec:
  sourceRef: { kind: GitRepository, name: flux-system }
status:
  conditions:
    - type: Ready
      status: 'False'
      reason: ReconciliationFailed
      message: 'Deployment/apps/web dry-run failed: spec.selector: field is immutable'
";

fn shipped_store() -> PatternStore {
    PatternStore::from_file(&Path::new(env!("CARGO_MANIFEST_DIR")).join("config/patterns.yaml")).unwrap()
}

fn fast_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.poll.initial = Duration::from_millis(5);
    config.poll.max = Duration::from_millis(20);
    config
}

fn seeded_cluster() -> Arc<InMemoryCluster> {
    let cluster = Arc::new(InMemoryCluster::with_objects(parse_manifests(MANIFESTS).unwrap()));
    cluster.set_auto_ready(true);
    cluster
}

fn controller(cluster: &Arc<InMemoryCluster>, store: PatternStore) -> RecoveryController {
    let api: Arc<dyn ClusterApi> = cluster.clone();
    RecoveryController::new(fast_config(), store, api, Arc::new(MemoryBackupSink::new()))
}

fn selector_event() -> ClusterEvent {
    ClusterEvent::new(
        InvolvedObject {
            kind: "Deployment".to_string(),
            namespace: "apps".to_string(),
            name: "web".to_string(),
            uid: "d-1".to_string(),
        },
        "FailedUpdate",
        "Deployment.apps \"web\" is invalid: spec.selector: Invalid value: field is immutable",
    )
}

async fn edges(cluster: &InMemoryCluster) -> BTreeSet<DependencyEdge> {
    GraphBuilder::from_cluster(cluster, &[])
        .await
        .unwrap()
        .build()
        .edges()
        .cloned()
        .collect()
}

#[tokio::test]
async fn immutable_selector_is_recreated_and_verified() {
    let cluster = seeded_cluster();
    let controller = controller(&cluster, shipped_store());
    let web = ResourceKey::new("Deployment", "apps", "web");

    let processed = controller.process(&selector_event()).await;
    assert_eq!(
        processed.decision,
        Decision::Admitted {
            pattern: "immutable-selector".to_string(),
            action: "recreate-workload".to_string()
        }
    );
    assert_eq!(processed.outcome, Some(Outcome::Succeeded));

    let journal = cluster.journal();
    assert_eq!(journal.first(), Some(&ClusterOp::Delete(web.clone())));
    assert_eq!(journal.last(), Some(&ClusterOp::Create(web.clone())));

    let recreated = cluster.get(&web).await.unwrap().unwrap();
    assert_ne!(recreated.metadata.uid.as_deref(), Some("d-1"));
    assert_eq!(recreated.data["spec"]["replicas"], 2);

    let state = controller.tracker().state(&web).unwrap();
    assert_eq!(state.status, RecoveryStatus::CoolingDown);
    assert_eq!(state.retry_count, 0);
}

#[tokio::test]
async fn replayed_event_recovers_once() {
    let cluster = seeded_cluster();
    let controller = controller(&cluster, shipped_store());
    let web = ResourceKey::new("Deployment", "apps", "web");
    let mut dedup = EventDeduplicator::new(controller.store().settings().dedup_window);
    let event = selector_event();
    let replay = event.clone();

    assert!(dedup.observe(&event));
    let (first, job) = controller.dispatch(&event);
    assert!(matches!(first, Decision::Admitted { .. }));
    let job = job.unwrap();

    // Dropped by the window, and refused by admission if it slips through
    assert!(!dedup.observe(&replay));
    let (second, none) = controller.dispatch(&replay);
    assert_eq!(
        second,
        Decision::Denied {
            pattern: "immutable-selector".to_string(),
            reason: DenialReason::AlreadyInProgress
        }
    );
    assert!(none.is_none());

    assert_eq!(controller.execute(&job).await, Outcome::Succeeded);
    let (third, none) = controller.dispatch(&replay);
    assert_eq!(
        third,
        Decision::Denied {
            pattern: "immutable-selector".to_string(),
            reason: DenialReason::CooldownActive
        }
    );
    assert!(none.is_none());

    let journal = cluster.journal();
    assert_eq!(journal.iter().filter(|op| **op == ClusterOp::Delete(web.clone())).count(), 1);
    assert_eq!(journal.iter().filter(|op| **op == ClusterOp::Create(web.clone())).count(), 1);
}

#[tokio::test]
async fn target_removed_during_verification_fails_fast() {
    let cluster = Arc::new(InMemoryCluster::with_objects(parse_manifests(MANIFESTS).unwrap()));
    let web = ResourceKey::new("Deployment", "apps", "web");
    let store = PatternStore::from_yaml_str(
        r"
error_patterns:
  - name: immutable-selector
    error_pattern: 'field is immutable'
    recovery_action: recreate
    severity: critical
recovery_actions:
  recreate:
    steps: [backup_resource_spec, delete_resource_gracefully, recreate_resource, verify_recovery]
    timeout: 60s
    verify_timeout: 30s
",
    )
    .unwrap();
    let controller = controller(&cluster, store);

    let remover = {
        let cluster = Arc::clone(&cluster);
        let web = web.clone();
        tokio::spawn(async move {
            while !cluster.journal().contains(&ClusterOp::Create(web.clone())) {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            cluster.remove(&web);
        })
    };

    let started = Instant::now();
    let processed = controller.process(&selector_event()).await;
    remover.await.unwrap();

    assert_eq!(
        processed.outcome,
        Some(Outcome::Failed {
            step: Step::VerifyRecovery,
            error: StepError::TargetVanished(web.clone()),
        })
    );
    assert!(started.elapsed() < Duration::from_secs(5));

    let state = controller.tracker().state(&web).unwrap();
    assert_eq!(state.status, RecoveryStatus::CoolingDown);
    assert_eq!(state.retry_count, 1);
    assert_eq!(controller.tracker().in_flight(), 0);
}

#[tokio::test]
async fn recreation_preserves_dependency_edges() {
    let cluster = seeded_cluster();
    let before = edges(&cluster).await;
    assert!(!before.is_empty());

    let controller = controller(&cluster, shipped_store());
    let processed = controller.process(&selector_event()).await;
    assert_eq!(processed.outcome, Some(Outcome::Succeeded));

    assert_eq!(edges(&cluster).await, before);
}

#[tokio::test]
async fn resync_finds_stalled_kustomization() {
    let cluster = seeded_cluster();
    let controller = controller(&cluster, shipped_store());

    let events = synthesize_terminal_events(
        cluster.as_ref(),
        &["Kustomization".to_string(), "Deployment".to_string()],
        None,
    )
    .await;
    let stalled: Vec<_> = events
        .iter()
        .filter(|e| e.involved_object.kind == "Kustomization")
        .collect();
    assert_eq!(stalled.len(), 1);
    assert!(stalled[0].synthetic);

    let processed = controller.process(stalled[0]).await;
    assert_eq!(
        processed.decision,
        Decision::Admitted {
            pattern: "flux-dry-run-immutable".to_string(),
            action: "reconcile-kustomization".to_string()
        }
    );
    assert_eq!(processed.outcome, Some(Outcome::Succeeded));
}

#[tokio::test]
async fn repeated_failures_exclude_the_resource() {
    let cluster = seeded_cluster();
    let web = ResourceKey::new("Deployment", "apps", "web");
    cluster.fail_creates(web.clone());

    let store = PatternStore::from_yaml_str(
        r"
global_settings: { recovery_cooldown: 0s }
error_patterns:
  - name: immutable-selector
    error_pattern: 'field is immutable'
    recovery_action: recreate
    severity: critical
    max_retries: 2
recovery_actions:
  recreate:
    steps: [backup_resource_spec, delete_resource_gracefully, recreate_resource]
    timeout: 30s
",
    )
    .unwrap();
    let controller = controller(&cluster, store);

    for _ in 0..2 {
        let processed = controller.process(&selector_event()).await;
        assert!(matches!(processed.decision, Decision::Admitted { .. }));
        assert!(matches!(processed.outcome, Some(Outcome::Failed { .. })));
    }

    let denied = controller.process(&selector_event()).await;
    assert_eq!(
        denied.decision,
        Decision::Denied {
            pattern: "immutable-selector".to_string(),
            reason: DenialReason::RetriesExhausted
        }
    );

    let report = controller.status_report();
    assert_eq!(report.recoveries[0].key, web);
    assert_eq!(report.recoveries[0].status, RecoveryStatus::Failed);

    assert!(controller.clear(&web));
    assert_eq!(controller.tracker().state(&web), None);
}

#[tokio::test]
async fn manifest_dir_analysis_matches_cluster_analysis() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("all.yaml"), MANIFESTS).unwrap();

    let from_files: BTreeSet<DependencyEdge> = GraphBuilder::from_manifest_dir(dir.path())
        .unwrap()
        .build()
        .edges()
        .cloned()
        .collect();
    assert_eq!(from_files, edges(&seeded_cluster()).await);
}

#[test]
fn objects_without_names_are_ignored() {
    let objects: Vec<DynamicObject> =
        parse_manifests("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n").unwrap();
    assert_eq!(GraphBuilder::with_objects(objects).object_count(), 0);
}
