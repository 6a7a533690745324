//! Recovery State Tracker
//!
//! Single owner of per-resource recovery state. Every mutation goes through
//! [`RecoveryStateTracker::admit`], [`RecoveryStateTracker::release`] or
//! [`RecoveryStateTracker::clear`], each of which holds the lock for the whole
//! check-and-update so concurrent callers never observe a torn state.
//!
//! Lifecycle of one key:
//!
//! ```text
//! idle ──admit──▶ in_progress ──release──▶ cooling_down ──(cooldown elapses)──▶ idle
//!                                    │
//!                                    └──(failed attempts reach max_retries)──▶ failed ──clear──▶ idle
//! ```

use crate::executor::Outcome;
use crate::patterns::{GlobalSettings, Severity};
use crate::resource::ResourceKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Status of a resource's recovery lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Idle,
    InProgress,
    CoolingDown,
    Failed,
}

impl RecoveryStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryStatus::Idle => "idle",
            RecoveryStatus::InProgress => "in_progress",
            RecoveryStatus::CoolingDown => "cooling_down",
            RecoveryStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery record for one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub key: ResourceKey,
    pub status: RecoveryStatus,
    pub active_since: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Consecutive failed attempts
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_pattern: Option<String>,
    pub last_outcome: Option<String>,
}

impl RecoveryState {
    fn new(key: ResourceKey) -> Self {
        Self {
            key,
            status: RecoveryStatus::Idle,
            active_since: None,
            cooldown_until: None,
            retry_count: 0,
            max_retries: 0,
            last_pattern: None,
            last_outcome: None,
        }
    }

    /// Move `cooling_down` to `idle` once the cooldown has elapsed.
    fn settle(&mut self, now: DateTime<Utc>) {
        if self.status == RecoveryStatus::CoolingDown
            && self.cooldown_until.map_or(true, |until| until <= now)
        {
            self.status = RecoveryStatus::Idle;
        }
    }
}

/// Why an admission request was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    AutoRecoveryDisabled,
    SeverityNotEligible,
    CooldownActive,
    ConcurrencyLimitReached,
    AlreadyInProgress,
    RetriesExhausted,
}

impl DenialReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DenialReason::AutoRecoveryDisabled => "auto_recovery_disabled",
            DenialReason::SeverityNotEligible => "severity_not_eligible",
            DenialReason::CooldownActive => "cooldown_active",
            DenialReason::ConcurrencyLimitReached => "concurrency_limit_reached",
            DenialReason::AlreadyInProgress => "already_in_progress",
            DenialReason::RetriesExhausted => "retries_exhausted",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an admission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Denied(DenialReason),
}

impl Admission {
    #[must_use]
    pub fn is_admitted(self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Parameters of one admission request
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    pub severity: Severity,
    pub pattern: &'a str,
    pub max_retries: u32,
}

#[derive(Debug)]
struct TrackerInner {
    settings: GlobalSettings,
    states: BTreeMap<ResourceKey, RecoveryState>,
}

impl TrackerInner {
    fn in_flight(&self) -> usize {
        self.states
            .values()
            .filter(|s| s.status == RecoveryStatus::InProgress)
            .count()
    }
}

/// Process-wide admission gate
#[derive(Debug)]
pub struct RecoveryStateTracker {
    inner: Mutex<TrackerInner>,
}

impl RecoveryStateTracker {
    #[must_use]
    pub fn new(settings: GlobalSettings) -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                settings,
                states: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply settings from a reloaded store. Existing records are kept.
    pub fn update_settings(&self, settings: GlobalSettings) {
        let mut inner = self.lock();
        info!(
            enabled = settings.auto_recovery_enabled,
            max_concurrent = settings.max_concurrent_recoveries,
            cooldown_secs = settings.recovery_cooldown.as_secs(),
            "Recovery settings updated"
        );
        inner.settings = settings;
    }

    #[must_use]
    pub fn settings(&self) -> GlobalSettings {
        self.lock().settings.clone()
    }

    pub fn admit(&self, key: &ResourceKey, request: AdmissionRequest<'_>) -> Admission {
        self.admit_at(key, request, Utc::now())
    }

    /// Admission with an explicit clock.
    pub fn admit_at(
        &self,
        key: &ResourceKey,
        request: AdmissionRequest<'_>,
        now: DateTime<Utc>,
    ) -> Admission {
        let mut inner = self.lock();
        let decision = Self::decide(&mut inner, key, request, now);

        match decision {
            Admission::Admitted => {
                let state = inner
                    .states
                    .entry(key.clone())
                    .or_insert_with(|| RecoveryState::new(key.clone()));
                state.status = RecoveryStatus::InProgress;
                state.active_since = Some(now);
                state.max_retries = request.max_retries;
                state.last_pattern = Some(request.pattern.to_string());
                info!(
                    resource = %key,
                    pattern = request.pattern,
                    severity = %request.severity,
                    attempt = state.retry_count + 1,
                    "Recovery admitted"
                );
            }
            Admission::Denied(reason) => {
                debug!(
                    resource = %key,
                    pattern = request.pattern,
                    reason = %reason,
                    "Recovery admission denied"
                );
            }
        }
        decision
    }

    fn decide(
        inner: &mut TrackerInner,
        key: &ResourceKey,
        request: AdmissionRequest<'_>,
        now: DateTime<Utc>,
    ) -> Admission {
        if !inner.settings.auto_recovery_enabled {
            return Admission::Denied(DenialReason::AutoRecoveryDisabled);
        }
        if !inner.settings.auto_recovery_severities.contains(&request.severity) {
            return Admission::Denied(DenialReason::SeverityNotEligible);
        }

        if let Some(state) = inner.states.get_mut(key) {
            state.settle(now);
            match state.status {
                RecoveryStatus::Failed => return Admission::Denied(DenialReason::RetriesExhausted),
                RecoveryStatus::InProgress => {
                    return Admission::Denied(DenialReason::AlreadyInProgress)
                }
                RecoveryStatus::CoolingDown => {
                    return Admission::Denied(DenialReason::CooldownActive)
                }
                RecoveryStatus::Idle => {}
            }
        }

        if inner.in_flight() >= inner.settings.max_concurrent_recoveries {
            return Admission::Denied(DenialReason::ConcurrencyLimitReached);
        }
        Admission::Admitted
    }

    pub fn release(&self, key: &ResourceKey, outcome: &Outcome) -> RecoveryStatus {
        self.release_at(key, outcome, Utc::now())
    }

    /// Record the end of an admitted recovery and return the key's new status.
    pub fn release_at(
        &self,
        key: &ResourceKey,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> RecoveryStatus {
        let mut inner = self.lock();
        let cooldown = chrono::Duration::from_std(inner.settings.recovery_cooldown)
            .unwrap_or_else(|_| chrono::Duration::days(7));

        let Some(state) = inner.states.get_mut(key) else {
            warn!(resource = %key, "Release for a resource that was never admitted");
            return RecoveryStatus::Idle;
        };
        if state.status != RecoveryStatus::InProgress {
            warn!(resource = %key, status = %state.status, "Release for a resource that is not in progress");
            return state.status;
        }

        state.active_since = None;
        state.cooldown_until = Some(
            now.checked_add_signed(cooldown)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
        state.last_outcome = Some(outcome.summary());

        if outcome.is_success() {
            state.retry_count = 0;
            state.status = RecoveryStatus::CoolingDown;
            info!(resource = %key, "Recovery succeeded, cooling down");
        } else {
            state.retry_count += 1;
            if state.retry_count >= state.max_retries {
                state.status = RecoveryStatus::Failed;
                warn!(
                    resource = %key,
                    attempts = state.retry_count,
                    outcome = %outcome.summary(),
                    "Recovery retries exhausted, resource excluded until cleared"
                );
            } else {
                state.status = RecoveryStatus::CoolingDown;
                warn!(
                    resource = %key,
                    attempts = state.retry_count,
                    max_retries = state.max_retries,
                    outcome = %outcome.summary(),
                    "Recovery failed, cooling down before retry"
                );
            }
        }
        state.status
    }

    /// Manually reset a key. In-progress recoveries cannot be cleared.
    pub fn clear(&self, key: &ResourceKey) -> bool {
        let mut inner = self.lock();
        match inner.states.get(key) {
            Some(state) if state.status == RecoveryStatus::InProgress => {
                warn!(resource = %key, "Refusing to clear an in-progress recovery");
                false
            }
            Some(_) => {
                inner.states.remove(key);
                info!(resource = %key, "Recovery state cleared");
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn state(&self, key: &ResourceKey) -> Option<RecoveryState> {
        let now = Utc::now();
        self.lock().states.get(key).map(|state| {
            let mut state = state.clone();
            state.settle(now);
            state
        })
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight()
    }

    /// All records with cooldowns settled against `now`.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RecoveryState> {
        let now = Utc::now();
        self.lock()
            .states
            .values()
            .map(|state| {
                let mut state = state.clone();
                state.settle(now);
                state
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::StepError;
    use crate::patterns::Step;
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    fn settings() -> GlobalSettings {
        GlobalSettings {
            max_concurrent_recoveries: 2,
            recovery_cooldown: Duration::from_secs(300),
            ..GlobalSettings::default()
        }
    }

    fn request(max_retries: u32) -> AdmissionRequest<'static> {
        AdmissionRequest {
            severity: Severity::High,
            pattern: "selector-conflict",
            max_retries,
        }
    }

    fn failure() -> Outcome {
        Outcome::Failed {
            step: Step::VerifyRecovery,
            error: StepError::VerificationTimeout {
                waited: Duration::from_secs(60),
                last_health: "progressing".to_string(),
            },
        }
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("Deployment", "apps", name)
    }

    #[test]
    fn concurrent_admissions_respect_limit() {
        let tracker = Arc::new(RecoveryStateTracker::new(settings()));
        let barrier = Arc::new(Barrier::new(3));

        let handles: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                let tracker = Arc::clone(&tracker);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    tracker.admit(&key(name), request(3))
                })
            })
            .collect();

        let results: Vec<Admission> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let admitted = results.iter().filter(|a| a.is_admitted()).count();
        let limited = results
            .iter()
            .filter(|a| **a == Admission::Denied(DenialReason::ConcurrencyLimitReached))
            .count();
        assert_eq!(admitted, 2);
        assert_eq!(limited, 1);
        assert_eq!(tracker.in_flight(), 2);
    }

    #[test]
    fn cooldown_past_calendar_end_saturates() {
        let tracker = RecoveryStateTracker::new(GlobalSettings {
            recovery_cooldown: Duration::from_secs(7 * 24 * 3600),
            ..settings()
        });
        let web = key("web");
        let now = DateTime::<Utc>::MAX_UTC - chrono::Duration::days(1);

        assert!(tracker.admit_at(&web, request(3), now).is_admitted());
        assert_eq!(tracker.release_at(&web, &failure(), now), RecoveryStatus::CoolingDown);

        let state = tracker.state(&web).unwrap();
        assert_eq!(state.cooldown_until, Some(DateTime::<Utc>::MAX_UTC));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn retries_exhaust_into_failed() {
        let tracker = RecoveryStateTracker::new(settings());
        let web = key("web");
        let mut now = Utc::now();

        for attempt in 1..=3 {
            assert_eq!(tracker.admit_at(&web, request(3), now), Admission::Admitted, "attempt {attempt}");
            tracker.release_at(&web, &failure(), now);
            // Step past the cooldown before the next attempt
            now += chrono::Duration::seconds(301);
        }

        assert_eq!(
            tracker.admit_at(&web, request(3), now),
            Admission::Denied(DenialReason::RetriesExhausted)
        );
        let state = tracker.state(&web).unwrap();
        assert_eq!(state.status, RecoveryStatus::Failed);
        assert_eq!(state.retry_count, 3);
    }

    #[test]
    fn same_key_is_mutually_exclusive() {
        let tracker = RecoveryStateTracker::new(settings());
        let web = key("web");
        assert!(tracker.admit(&web, request(3)).is_admitted());
        assert_eq!(
            tracker.admit(&web, request(3)),
            Admission::Denied(DenialReason::AlreadyInProgress)
        );
    }

    #[test]
    fn cooldown_applies_after_success_and_expires() {
        let tracker = RecoveryStateTracker::new(settings());
        let web = key("web");
        let t0 = Utc::now();

        tracker.admit_at(&web, request(3), t0);
        let status = tracker.release_at(&web, &Outcome::Succeeded, t0);
        assert_eq!(status, RecoveryStatus::CoolingDown);

        assert_eq!(
            tracker.admit_at(&web, request(3), t0 + chrono::Duration::seconds(10)),
            Admission::Denied(DenialReason::CooldownActive)
        );
        assert_eq!(
            tracker.admit_at(&web, request(3), t0 + chrono::Duration::seconds(300)),
            Admission::Admitted
        );
    }

    #[test]
    fn success_resets_retry_count() {
        let tracker = RecoveryStateTracker::new(settings());
        let web = key("web");
        let mut now = Utc::now();

        tracker.admit_at(&web, request(3), now);
        tracker.release_at(&web, &failure(), now);
        now += chrono::Duration::seconds(301);
        tracker.admit_at(&web, request(3), now);
        tracker.release_at(&web, &Outcome::Succeeded, now);

        let state = tracker.state(&web).unwrap();
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.last_outcome.as_deref(), Some("succeeded"));
    }

    #[test]
    fn settings_gate_admission() {
        let tracker = RecoveryStateTracker::new(settings());
        let low = AdmissionRequest {
            severity: Severity::Warning,
            ..request(3)
        };
        assert_eq!(
            tracker.admit(&key("web"), low),
            Admission::Denied(DenialReason::SeverityNotEligible)
        );

        tracker.update_settings(GlobalSettings {
            auto_recovery_enabled: false,
            ..settings()
        });
        assert_eq!(
            tracker.admit(&key("web"), request(3)),
            Admission::Denied(DenialReason::AutoRecoveryDisabled)
        );
    }

    #[test]
    fn clear_resets_failed_but_not_active() {
        let tracker = RecoveryStateTracker::new(settings());
        let web = key("web");
        let now = Utc::now();

        tracker.admit_at(&web, request(1), now);
        assert!(!tracker.clear(&web));
        assert_eq!(tracker.release_at(&web, &failure(), now), RecoveryStatus::Failed);

        assert!(tracker.clear(&web));
        assert!(tracker.state(&web).is_none());
        assert!(tracker.admit(&web, request(1)).is_admitted());
    }
}
