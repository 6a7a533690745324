//! Acceptance scenarios for matching, admission and ordering.

use recovery_controller::events::{ClusterEvent, InvolvedObject};
use recovery_controller::executor::{Outcome, StepError};
use recovery_controller::graph::{DependencyGraph, EdgeKind};
use recovery_controller::patterns::{GlobalSettings, LoadError, PatternMatcher, PatternStore, Severity, Step};
use recovery_controller::state::{Admission, AdmissionRequest, DenialReason, RecoveryStateTracker, RecoveryStatus};
use recovery_controller::ResourceKey;
use std::path::Path;
use std::sync::{Arc, Barrier};

fn deployment_event(reason: &str, message: &str) -> ClusterEvent {
    ClusterEvent::new(
        InvolvedObject {
            kind: "Deployment".to_string(),
            namespace: "apps".to_string(),
            name: "web".to_string(),
            uid: "d-1".to_string(),
        },
        reason,
        message,
    )
}

fn request(severity: Severity, max_retries: u32) -> AdmissionRequest<'static> {
    AdmissionRequest {
        severity,
        pattern: "selector-conflict",
        max_retries,
    }
}

#[test]
fn scenario_a_substring_pattern_selects_action() {
    let store = PatternStore::from_yaml_str(
        r"
error_patterns:
  - name: selector-conflict
    error_pattern: 'field is immutable'
    recovery_action: recreate_deployment
    severity: critical
recovery_actions:
  recreate_deployment:
    steps: [backup_resource_spec, delete_resource_gracefully, recreate_resource, verify_recovery]
",
    )
    .unwrap();
    let matcher = PatternMatcher::new(Arc::new(store));
    let event = deployment_event("FailedUpdate", "Deployment.spec.selector: field is immutable");

    let result = matcher.match_event(&event).unwrap();
    assert_eq!(result.pattern, "selector-conflict");
    assert_eq!(result.severity, Severity::Critical);
    assert_eq!(result.recovery_action, "recreate_deployment");

    // Deterministic for the same store and event
    assert_eq!(matcher.match_event(&event), Some(result));
}

#[test]
fn load_names_the_offending_pattern() {
    let err = PatternStore::from_yaml_str(
        r"
error_patterns:
  - name: fine
    error_pattern: 'x'
    recovery_action: recreate
  - name: broken-regex
    error_pattern: { type: regex, pattern: '([unclosed' }
    recovery_action: recreate
recovery_actions:
  recreate: { steps: [recreate_resource] }
",
    )
    .unwrap_err();
    assert!(matches!(err, LoadError::InvalidExpression { ref pattern, .. } if pattern == "broken-regex"));
}

#[test]
fn scenario_b_concurrency_limit_admits_exactly_two() {
    let tracker = Arc::new(RecoveryStateTracker::new(GlobalSettings {
        max_concurrent_recoveries: 2,
        ..GlobalSettings::default()
    }));
    let barrier = Arc::new(Barrier::new(3));

    let handles: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|name| {
            let tracker = Arc::clone(&tracker);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                tracker.admit(&ResourceKey::new("Deployment", "apps", name), request(Severity::Critical, 3))
            })
        })
        .collect();
    let results: Vec<Admission> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|a| a.is_admitted()).count(), 2);
    assert_eq!(
        results
            .iter()
            .filter(|a| **a == Admission::Denied(DenialReason::ConcurrencyLimitReached))
            .count(),
        1
    );
}

#[test]
fn scenario_c_chain_orders_dependents_first_for_cleanup() {
    let key = |name: &str| ResourceKey::new("Kustomization", "flux-system", name);
    let graph = DependencyGraph::from_pairs(
        &[(key("A"), key("B")), (key("B"), key("C"))],
        EdgeKind::Orchestration,
    );
    let plan = graph.order().unwrap();
    assert_eq!(plan.cleanup_batches, vec![vec![key("A")], vec![key("B")], vec![key("C")]]);
    assert_eq!(plan.recreation_batches, vec![vec![key("C")], vec![key("B")], vec![key("A")]]);
}

#[test]
fn scenario_d_two_cycle_is_reported() {
    let key = |name: &str| ResourceKey::new("Kustomization", "flux-system", name);
    let graph = DependencyGraph::from_pairs(
        &[(key("X"), key("Y")), (key("Y"), key("X"))],
        EdgeKind::Orchestration,
    );
    let err = graph.order().unwrap_err();
    assert_eq!(err.path, vec![key("X"), key("Y"), key("X")]);

    // Every consecutive pair is a real edge
    for pair in err.path.windows(2) {
        assert!(graph.dependencies_of(&pair[0]).any(|dep| *dep == pair[1]));
    }
}

#[test]
fn scenario_e_exhausted_retries_fail_the_key() {
    let tracker = RecoveryStateTracker::new(GlobalSettings {
        recovery_cooldown: std::time::Duration::ZERO,
        ..GlobalSettings::default()
    });
    let key = ResourceKey::new("Deployment", "apps", "web");
    let failed = Outcome::Failed {
        step: Step::RecreateResource,
        error: StepError::NoBackup(key.clone()),
    };

    for attempt in 1..=3 {
        assert_eq!(
            tracker.admit(&key, request(Severity::Critical, 3)),
            Admission::Admitted,
            "attempt {attempt}"
        );
        tracker.release(&key, &failed);
    }

    assert_eq!(
        tracker.admit(&key, request(Severity::Critical, 3)),
        Admission::Denied(DenialReason::RetriesExhausted)
    );
    assert_eq!(tracker.state(&key).unwrap().status, RecoveryStatus::Failed);

    assert!(tracker.clear(&key));
    assert!(tracker.admit(&key, request(Severity::Critical, 3)).is_admitted());
}

#[test]
fn shipped_rule_set_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/patterns.yaml");
    let store = PatternStore::from_file(&path).unwrap();
    assert_eq!(store.patterns().len(), 5);
    for pattern in store.patterns() {
        assert!(store.action(&pattern.recovery_action).is_some(), "{}", pattern.name);
    }
}
