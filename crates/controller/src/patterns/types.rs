//! Typed rule-set model.
//!
//! The `*Def` structs mirror the YAML document one-to-one and are only used
//! while loading. Everything the hot path touches (`ErrorPattern`, `Clause`,
//! `RecoveryAction`, `GlobalSettings`) is validated and compiled by
//! [`super::store::PatternStore`] first.

use crate::events::ClusterEvent;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Severity levels, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Warning,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Warning => "warning",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "warning" => Ok(Severity::Warning),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!(
                "unknown severity '{other}' (expected low|warning|high|critical)"
            )),
        }
    }
}

/// Event field a clause inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventField {
    Kind,
    Namespace,
    Name,
    Reason,
    #[default]
    Message,
}

impl EventField {
    /// Borrow the field's value from an event.
    #[must_use]
    pub fn value<'a>(self, event: &'a ClusterEvent) -> &'a str {
        match self {
            EventField::Kind => &event.involved_object.kind,
            EventField::Namespace => &event.involved_object.namespace,
            EventField::Name => &event.involved_object.name,
            EventField::Reason => &event.reason,
            EventField::Message => &event.message,
        }
    }
}

/// One compiled match clause
#[derive(Debug, Clone)]
pub enum Clause {
    Substring { field: EventField, value: String },
    Regex { field: EventField, regex: Regex },
    FieldEquals { field: EventField, value: String },
}

impl Clause {
    #[must_use]
    pub fn matches(&self, event: &ClusterEvent) -> bool {
        match self {
            Clause::Substring { field, value } => field.value(event).contains(value.as_str()),
            Clause::Regex { field, regex } => regex.is_match(field.value(event)),
            Clause::FieldEquals { field, value } => field.value(event) == value,
        }
    }

    /// Discriminating weight of this clause for the confidence score.
    ///
    /// Exact reason equality is the strongest signal, message substrings the
    /// weakest; kind equality alone barely discriminates.
    #[must_use]
    pub fn weight(&self) -> f64 {
        match self {
            Clause::FieldEquals {
                field: EventField::Reason,
                ..
            } => 0.8,
            Clause::FieldEquals {
                field: EventField::Kind,
                ..
            } => 0.3,
            Clause::FieldEquals { .. } => 0.5,
            Clause::Regex { .. } => 0.7,
            Clause::Substring { .. } => 0.5,
        }
    }
}

/// A validated error pattern
#[derive(Debug, Clone)]
pub struct ErrorPattern {
    pub name: String,
    pub description: Option<String>,
    pub clauses: Vec<Clause>,
    pub recovery_action: String,
    pub severity: Severity,
    pub max_retries: u32,
}

impl ErrorPattern {
    /// Confidence of a match: noisy-or over the clause weights, `None` when
    /// any clause fails.
    #[must_use]
    pub fn evaluate(&self, event: &ClusterEvent) -> Option<f64> {
        if self.clauses.is_empty() {
            return None;
        }
        let mut miss = 1.0_f64;
        for clause in &self.clauses {
            if !clause.matches(event) {
                return None;
            }
            miss *= 1.0 - clause.weight();
        }
        Some(1.0 - miss)
    }
}

/// Recovery steps, executed strictly in declared order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    BackupResourceSpec,
    DeleteResourceGracefully,
    CleanupDependencies,
    RecreateResource,
    VerifyRecovery,
}

impl Step {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Step::BackupResourceSpec => "backup_resource_spec",
            Step::DeleteResourceGracefully => "delete_resource_gracefully",
            Step::CleanupDependencies => "cleanup_dependencies",
            Step::RecreateResource => "recreate_resource",
            Step::VerifyRecovery => "verify_recovery",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "backup_resource_spec" => Ok(Step::BackupResourceSpec),
            "delete_resource_gracefully" => Ok(Step::DeleteResourceGracefully),
            "cleanup_dependencies" => Ok(Step::CleanupDependencies),
            "recreate_resource" => Ok(Step::RecreateResource),
            "verify_recovery" => Ok(Step::VerifyRecovery),
            other => Err(format!("unknown step '{other}'")),
        }
    }
}

/// Deletion propagation used by `delete_resource_gracefully`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Propagation {
    #[default]
    Background,
    Foreground,
    Orphan,
}

/// A validated recovery action
#[derive(Debug, Clone)]
pub struct RecoveryAction {
    pub name: String,
    pub steps: Vec<Step>,
    /// Overall deadline for the whole action
    pub timeout: Duration,
    pub grace_period: Duration,
    pub verify_timeout: Duration,
    pub propagation: Propagation,
    /// JSON merge patch applied to the snapshot before recreation
    pub spec_patch: Option<serde_json::Value>,
}

/// Global engine settings
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalSettings {
    pub auto_recovery_enabled: bool,
    pub auto_recovery_severities: BTreeSet<Severity>,
    pub min_recovery_confidence: f64,
    pub max_concurrent_recoveries: usize,
    pub recovery_cooldown: Duration,
    pub dedup_window: Duration,
    pub impact_max_depth: usize,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            auto_recovery_enabled: true,
            auto_recovery_severities: [Severity::High, Severity::Critical].into_iter().collect(),
            min_recovery_confidence: 0.5,
            max_concurrent_recoveries: 2,
            recovery_cooldown: Duration::from_secs(300),
            dedup_window: Duration::from_secs(30),
            impact_max_depth: 10,
        }
    }
}

/// Longest accepted `recovery_cooldown`
pub const MAX_RECOVERY_COOLDOWN: Duration = Duration::from_secs(7 * 24 * 3600);

/// Longest accepted `dedup_window`
pub const MAX_DEDUP_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// Longest accepted action `timeout`, `grace_period` or `verify_timeout`
pub const MAX_ACTION_DURATION: Duration = Duration::from_secs(24 * 3600);

// ---------------------------------------------------------------------------
// Document model
// ---------------------------------------------------------------------------

/// Top-level pattern document
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatternDocument {
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub global_settings: GlobalSettingsDef,

    #[serde(default)]
    pub error_patterns: Vec<ErrorPatternDef>,

    #[serde(default)]
    pub recovery_actions: BTreeMap<String, RecoveryActionDef>,
}

/// Raw `error_patterns[]` entry
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorPatternDef {
    pub name: String,

    /// Parsed into [`MatchSpecDef`] during validation so errors can name the pattern
    pub error_pattern: serde_yaml::Value,

    pub recovery_action: String,

    #[serde(default = "default_severity")]
    pub severity: String,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub description: Option<String>,
}

fn default_severity() -> String {
    "warning".to_string()
}

fn default_max_retries() -> u32 {
    3
}

/// `error_pattern` value: a bare message substring, one clause or a list of clauses
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MatchSpecDef {
    Substring(String),
    Clause(ClauseDef),
    Clauses(Vec<ClauseDef>),
}

/// Tagged clause in the document
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClauseDef {
    Substring {
        #[serde(default)]
        field: EventField,
        value: String,
    },
    Regex {
        #[serde(default)]
        field: EventField,
        pattern: String,
    },
    FieldEquals {
        field: EventField,
        value: String,
    },
}

/// Raw `recovery_actions.<name>` entry
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecoveryActionDef {
    pub steps: Vec<String>,

    #[serde(default)]
    pub timeout: Option<DurationDef>,

    #[serde(default)]
    pub grace_period: Option<DurationDef>,

    #[serde(default)]
    pub verify_timeout: Option<DurationDef>,

    #[serde(default)]
    pub propagation: Propagation,

    #[serde(default)]
    pub spec_patch: Option<serde_json::Value>,
}

/// Raw `global_settings` block; every field optional
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettingsDef {
    #[serde(default)]
    pub auto_recovery_enabled: Option<bool>,

    #[serde(default)]
    pub auto_recovery_severities: Option<Vec<String>>,

    #[serde(default)]
    pub min_recovery_confidence: Option<f64>,

    #[serde(default)]
    pub max_concurrent_recoveries: Option<usize>,

    #[serde(default)]
    pub recovery_cooldown: Option<DurationDef>,

    #[serde(default)]
    pub dedup_window: Option<DurationDef>,

    #[serde(default)]
    pub impact_max_depth: Option<usize>,
}

/// Duration as a bare number of seconds or a "30s"/"5m"/"1h" string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DurationDef {
    Seconds(u64),
    Text(String),
}

impl DurationDef {
    pub fn to_duration(&self) -> Result<Duration, String> {
        match self {
            DurationDef::Seconds(secs) => Ok(Duration::from_secs(*secs)),
            DurationDef::Text(text) => crate::config::parse_duration(text),
        }
    }
}
