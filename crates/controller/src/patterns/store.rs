//! Pattern store: loads and validates the versioned rule set.
//!
//! Loading is fail-closed. A document with a dangling action reference, an
//! uncompilable expression or an unknown severity is rejected as a whole so a
//! malformed configuration can never silently shrink detection coverage.

use super::types::{
    Clause, ClauseDef, ErrorPattern, EventField, GlobalSettings, GlobalSettingsDef, MatchSpecDef,
    PatternDocument, RecoveryAction, RecoveryActionDef, Severity, Step, MAX_ACTION_DURATION,
    MAX_DEDUP_WINDOW, MAX_RECOVERY_COOLDOWN,
};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Default ConfigMap key holding the pattern document
pub const DEFAULT_CONFIGMAP_KEY: &str = "patterns.yaml";

/// Errors raised while loading a pattern document
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("failed to read pattern source {source_name}: {details}")]
    Source {
        source_name: String,
        details: String,
    },

    #[error("failed to parse pattern document: {details}")]
    Parse { details: String },

    #[error("pattern '{name}' is declared more than once")]
    DuplicatePattern { name: String },

    #[error("pattern '{pattern}' references unknown recovery action '{action}'")]
    UnknownRecoveryAction { pattern: String, action: String },

    #[error("pattern '{pattern}' has an invalid match expression: {details}")]
    InvalidExpression { pattern: String, details: String },

    #[error("invalid severity in {location}: {details}")]
    InvalidSeverity { location: String, details: String },

    #[error("recovery action '{action}' is invalid: {details}")]
    InvalidAction { action: String, details: String },

    #[error("global setting '{setting}' is invalid: {details}")]
    InvalidSetting { setting: String, details: String },
}

/// Where a pattern document comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternSource {
    File(PathBuf),
    Inline(String),
    ConfigMap {
        namespace: String,
        name: String,
        key: String,
    },
}

impl FromStr for PatternSource {
    type Err = String;

    /// `configmap:<namespace>/<name>[:<key>]` or a file path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(rest) = s.strip_prefix("configmap:") else {
            return Ok(PatternSource::File(PathBuf::from(s)));
        };

        let (location, key) = match rest.split_once(':') {
            Some((location, key)) => (location, key.to_string()),
            None => (rest, DEFAULT_CONFIGMAP_KEY.to_string()),
        };
        let (namespace, name) = location
            .split_once('/')
            .ok_or_else(|| format!("expected configmap:<namespace>/<name>[:<key>], got '{s}'"))?;
        if namespace.is_empty() || name.is_empty() || key.is_empty() {
            return Err(format!("incomplete ConfigMap reference '{s}'"));
        }
        Ok(PatternSource::ConfigMap {
            namespace: namespace.to_string(),
            name: name.to_string(),
            key,
        })
    }
}

impl fmt::Display for PatternSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternSource::File(path) => write!(f, "{}", path.display()),
            PatternSource::Inline(_) => f.write_str("<inline>"),
            PatternSource::ConfigMap {
                namespace,
                name,
                key,
            } => write!(f, "configmap:{namespace}/{name}:{key}"),
        }
    }
}

/// Validated, immutable rule set
#[derive(Debug, Clone)]
pub struct PatternStore {
    version: String,
    patterns: Vec<ErrorPattern>,
    actions: BTreeMap<String, RecoveryAction>,
    settings: GlobalSettings,
    loaded_at: DateTime<Utc>,
}

impl PatternStore {
    /// Load from any source. A client is only needed for ConfigMap sources.
    pub async fn load(source: &PatternSource, client: Option<&Client>) -> Result<Self, LoadError> {
        let store = match source {
            PatternSource::File(path) => Self::from_file(path)?,
            PatternSource::Inline(text) => Self::from_yaml_str(text)?,
            PatternSource::ConfigMap {
                namespace,
                name,
                key,
            } => {
                let client = client.ok_or_else(|| LoadError::Source {
                    source_name: source.to_string(),
                    details: "no cluster client available".to_string(),
                })?;
                let text = read_configmap_key(client, namespace, name, key)
                    .await
                    .map_err(|details| LoadError::Source {
                        source_name: source.to_string(),
                        details,
                    })?;
                Self::from_yaml_str(&text)?
            }
        };

        info!(
            source = %source,
            version = %store.version,
            patterns = store.patterns.len(),
            actions = store.actions.len(),
            "Loaded pattern store"
        );
        Ok(store)
    }

    /// Load from a mounted file.
    pub fn from_file(path: &Path) -> Result<Self, LoadError> {
        let text = std::fs::read_to_string(path).map_err(|e| LoadError::Source {
            source_name: path.display().to_string(),
            details: e.to_string(),
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(text: &str) -> Result<Self, LoadError> {
        let document: PatternDocument =
            serde_yaml::from_str(text).map_err(|e| LoadError::Parse {
                details: e.to_string(),
            })?;
        Self::from_document(document)
    }

    /// Validate a parsed document.
    pub fn from_document(document: PatternDocument) -> Result<Self, LoadError> {
        let settings = validate_settings(&document.global_settings)?;

        let mut actions = BTreeMap::new();
        for (name, def) in &document.recovery_actions {
            actions.insert(name.clone(), validate_action(name, def)?);
        }

        let mut seen = HashSet::new();
        let mut patterns = Vec::with_capacity(document.error_patterns.len());
        for def in &document.error_patterns {
            if !seen.insert(def.name.clone()) {
                return Err(LoadError::DuplicatePattern {
                    name: def.name.clone(),
                });
            }

            if !actions.contains_key(&def.recovery_action) {
                return Err(LoadError::UnknownRecoveryAction {
                    pattern: def.name.clone(),
                    action: def.recovery_action.clone(),
                });
            }

            let severity =
                def.severity
                    .parse::<Severity>()
                    .map_err(|details| LoadError::InvalidSeverity {
                        location: format!("pattern '{}'", def.name),
                        details,
                    })?;

            let clauses = compile_expression(&def.name, &def.error_pattern)?;
            debug!(pattern = %def.name, clauses = clauses.len(), "Compiled error pattern");

            patterns.push(ErrorPattern {
                name: def.name.clone(),
                description: def.description.clone(),
                clauses,
                recovery_action: def.recovery_action.clone(),
                severity,
                max_retries: def.max_retries,
            });
        }

        Ok(Self {
            version: document.version.unwrap_or_else(|| "unversioned".to_string()),
            patterns,
            actions,
            settings,
            loaded_at: Utc::now(),
        })
    }

    /// Look up a pattern by name.
    #[must_use]
    pub fn resolve(&self, pattern_name: &str) -> Option<&ErrorPattern> {
        self.patterns.iter().find(|p| p.name == pattern_name)
    }

    /// Look up a recovery action by name.
    #[must_use]
    pub fn action(&self, action_name: &str) -> Option<&RecoveryAction> {
        self.actions.get(action_name)
    }

    /// Patterns in declaration order.
    #[must_use]
    pub fn patterns(&self) -> &[ErrorPattern] {
        &self.patterns
    }

    #[must_use]
    pub fn actions(&self) -> &BTreeMap<String, RecoveryAction> {
        &self.actions
    }

    #[must_use]
    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

async fn read_configmap_key(
    client: &Client,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<String, String> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let cm = api.get(name).await.map_err(|e| e.to_string())?;
    let data = cm.data.ok_or_else(|| "ConfigMap has no data".to_string())?;
    data.get(key)
        .cloned()
        .ok_or_else(|| format!("ConfigMap missing key {key}"))
}

fn compile_expression(pattern: &str, raw: &serde_yaml::Value) -> Result<Vec<Clause>, LoadError> {
    let invalid = |details: String| LoadError::InvalidExpression {
        pattern: pattern.to_string(),
        details,
    };

    let spec: MatchSpecDef = serde_yaml::from_value(raw.clone()).map_err(|e| {
        invalid(format!(
            "expected a string, a clause or a list of clauses ({e})"
        ))
    })?;

    let defs = match spec {
        MatchSpecDef::Substring(value) => vec![ClauseDef::Substring {
            field: EventField::Message,
            value,
        }],
        MatchSpecDef::Clause(clause) => vec![clause],
        MatchSpecDef::Clauses(clauses) => clauses,
    };

    if defs.is_empty() {
        return Err(invalid("expression has no clauses".to_string()));
    }

    defs.into_iter()
        .map(|def| match def {
            ClauseDef::Substring { field, value } => {
                if value.is_empty() {
                    Err(invalid("substring value is empty".to_string()))
                } else {
                    Ok(Clause::Substring { field, value })
                }
            }
            ClauseDef::Regex { field, pattern } => Regex::new(&pattern)
                .map(|regex| Clause::Regex { field, regex })
                .map_err(|e| invalid(format!("regex does not compile: {e}"))),
            ClauseDef::FieldEquals { field, value } => Ok(Clause::FieldEquals { field, value }),
        })
        .collect()
}

fn validate_action(name: &str, def: &RecoveryActionDef) -> Result<RecoveryAction, LoadError> {
    let invalid = |details: String| LoadError::InvalidAction {
        action: name.to_string(),
        details,
    };

    if def.steps.is_empty() {
        return Err(invalid("no steps declared".to_string()));
    }

    let steps = def
        .steps
        .iter()
        .map(|s| s.parse::<Step>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(invalid)?;

    let timeout = match &def.timeout {
        Some(d) => d.to_duration().map_err(invalid)?,
        None => Duration::from_secs(600),
    };
    if timeout.is_zero() {
        return Err(invalid("timeout must be greater than zero".to_string()));
    }
    let grace_period = match &def.grace_period {
        Some(d) => d.to_duration().map_err(invalid)?,
        None => Duration::from_secs(30),
    };
    let verify_timeout = match &def.verify_timeout {
        Some(d) => d.to_duration().map_err(invalid)?,
        None => timeout,
    };

    for (field, value) in [
        ("timeout", timeout),
        ("grace_period", grace_period),
        ("verify_timeout", verify_timeout),
    ] {
        if value > MAX_ACTION_DURATION {
            return Err(invalid(format!(
                "{field} {}s exceeds the {}s limit",
                value.as_secs(),
                MAX_ACTION_DURATION.as_secs()
            )));
        }
    }

    if let Some(patch) = &def.spec_patch {
        if !patch.is_object() {
            return Err(invalid("spec_patch must be a mapping".to_string()));
        }
    }

    Ok(RecoveryAction {
        name: name.to_string(),
        steps,
        timeout,
        grace_period,
        verify_timeout,
        propagation: def.propagation,
        spec_patch: def.spec_patch.clone(),
    })
}

fn validate_settings(def: &GlobalSettingsDef) -> Result<GlobalSettings, LoadError> {
    let invalid = |setting: &str, details: String| LoadError::InvalidSetting {
        setting: setting.to_string(),
        details,
    };
    let mut settings = GlobalSettings::default();

    if let Some(enabled) = def.auto_recovery_enabled {
        settings.auto_recovery_enabled = enabled;
    }

    if let Some(severities) = &def.auto_recovery_severities {
        settings.auto_recovery_severities = severities
            .iter()
            .map(|s| s.parse::<Severity>())
            .collect::<Result<_, _>>()
            .map_err(|details| LoadError::InvalidSeverity {
                location: "global_settings.auto_recovery_severities".to_string(),
                details,
            })?;
    }

    if let Some(confidence) = def.min_recovery_confidence {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(invalid(
                "min_recovery_confidence",
                format!("{confidence} is outside [0, 1]"),
            ));
        }
        settings.min_recovery_confidence = confidence;
    }

    if let Some(max) = def.max_concurrent_recoveries {
        if max == 0 {
            return Err(invalid(
                "max_concurrent_recoveries",
                "must be at least 1".to_string(),
            ));
        }
        settings.max_concurrent_recoveries = max;
    }

    if let Some(cooldown) = &def.recovery_cooldown {
        settings.recovery_cooldown = cooldown
            .to_duration()
            .map_err(|e| invalid("recovery_cooldown", e))?;
        if settings.recovery_cooldown > MAX_RECOVERY_COOLDOWN {
            return Err(invalid(
                "recovery_cooldown",
                format!("must not exceed {}s", MAX_RECOVERY_COOLDOWN.as_secs()),
            ));
        }
    }

    if let Some(window) = &def.dedup_window {
        settings.dedup_window = window
            .to_duration()
            .map_err(|e| invalid("dedup_window", e))?;
        if settings.dedup_window > MAX_DEDUP_WINDOW {
            return Err(invalid(
                "dedup_window",
                format!("must not exceed {}s", MAX_DEDUP_WINDOW.as_secs()),
            ));
        }
    }

    if let Some(depth) = def.impact_max_depth {
        if depth == 0 {
            return Err(invalid("impact_max_depth", "must be at least 1".to_string()));
        }
        settings.impact_max_depth = depth;
    }

    Ok(settings)
}
