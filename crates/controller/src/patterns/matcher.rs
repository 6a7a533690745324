//! Pattern matcher: first match wins, in declaration order.

use super::store::PatternStore;
use super::types::Severity;
use crate::events::ClusterEvent;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of matching one event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub pattern: String,
    pub severity: Severity,
    pub recovery_action: String,
    pub max_retries: u32,
    pub confidence: f64,
    /// Confidence reached `min_recovery_confidence`
    pub actionable: bool,
    /// Later patterns that would also have matched
    pub shadowed: Vec<String>,
}

/// Evaluates events against a loaded store
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    store: Arc<PatternStore>,
}

impl PatternMatcher {
    #[must_use]
    pub fn new(store: Arc<PatternStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<PatternStore> {
        &self.store
    }

    /// Match an event. Deterministic for a given store and event.
    #[must_use]
    pub fn match_event(&self, event: &ClusterEvent) -> Option<MatchResult> {
        let mut matched = self
            .store
            .patterns()
            .iter()
            .filter_map(|pattern| pattern.evaluate(event).map(|score| (pattern, score)));

        let (pattern, confidence) = matched.next()?;
        let shadowed: Vec<String> = matched.map(|(p, _)| p.name.clone()).collect();

        let threshold = self.store.settings().min_recovery_confidence;
        let result = MatchResult {
            pattern: pattern.name.clone(),
            severity: pattern.severity,
            recovery_action: pattern.recovery_action.clone(),
            max_retries: pattern.max_retries,
            confidence,
            actionable: confidence >= threshold,
            shadowed,
        };

        if !result.shadowed.is_empty() {
            warn!(
                resource = %event.involved_object,
                pattern = %result.pattern,
                shadowed = ?result.shadowed,
                "Match ambiguity: multiple patterns apply, first match wins"
            );
        }

        if result.actionable {
            debug!(
                resource = %event.involved_object,
                pattern = %result.pattern,
                severity = %result.severity,
                confidence = result.confidence,
                "Event matched error pattern"
            );
        } else {
            info!(
                resource = %event.involved_object,
                pattern = %result.pattern,
                confidence = result.confidence,
                threshold,
                "Observed but not actionable: match confidence below threshold"
            );
        }

        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InvolvedObject;

    const RULES: &str = r#"
global_settings:
  min_recovery_confidence: 0.6
error_patterns:
  - name: selector-conflict
    error_pattern: "field is immutable"
    recovery_action: recreate_deployment
    severity: high
  - name: failed-update
    error_pattern:
      type: field_equals
      field: reason
      value: FailedUpdate
    recovery_action: recreate_deployment
    severity: critical
  - name: backoff
    error_pattern:
      type: regex
      field: message
      pattern: "^Back-off restarting failed container"
    recovery_action: recreate_deployment
    severity: warning
recovery_actions:
  recreate_deployment:
    steps: [backup_resource_spec, delete_resource_gracefully, recreate_resource]
"#;

    fn matcher() -> PatternMatcher {
        PatternMatcher::new(Arc::new(PatternStore::from_yaml_str(RULES).unwrap()))
    }

    fn event(reason: &str, message: &str) -> ClusterEvent {
        ClusterEvent::new(
            InvolvedObject {
                kind: "Deployment".to_string(),
                namespace: "apps".to_string(),
                name: "web".to_string(),
                uid: "uid-1".to_string(),
            },
            reason,
            message,
        )
    }

    #[test]
    fn first_declared_match_wins_and_records_shadowed() {
        let result = matcher()
            .match_event(&event(
                "FailedUpdate",
                "Deployment.spec.selector: field is immutable",
            ))
            .unwrap();
        assert_eq!(result.pattern, "selector-conflict");
        assert_eq!(result.severity, Severity::High);
        assert_eq!(result.shadowed, vec!["failed-update".to_string()]);
    }

    #[test]
    fn weak_substring_match_is_observed_but_not_actionable() {
        let result = matcher()
            .match_event(&event("Other", "field is immutable"))
            .unwrap();
        assert!((result.confidence - 0.5).abs() < 1e-9);
        assert!(!result.actionable);

        let result = matcher()
            .match_event(&event("FailedUpdate", "something else"))
            .unwrap();
        assert_eq!(result.pattern, "failed-update");
        assert!(result.actionable);
    }

    #[test]
    fn matching_is_deterministic() {
        let m = matcher();
        let ev = event("BackOff", "Back-off restarting failed container app");
        let first = m.match_event(&ev);
        let second = m.match_event(&ev);
        assert_eq!(first, second);
        assert_eq!(first.unwrap().pattern, "backoff");
    }

    #[test]
    fn unrelated_event_does_not_match() {
        assert!(matcher()
            .match_event(&event("Scheduled", "Successfully assigned pod"))
            .is_none());
    }
}
