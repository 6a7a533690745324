//! Runtime configuration for the controller process.
//!
//! The rule set itself (patterns, actions, global settings) lives in the
//! pattern document loaded by [`crate::patterns::PatternStore`]. This module
//! carries the process-level knobs: where to read that document from, where
//! backups go, timers and pool sizing.

use crate::patterns::PatternSource;
use std::path::PathBuf;
use std::time::Duration;

/// Hard ceiling on recovery workers regardless of `max_concurrent_recoveries`.
pub const WORKER_HARD_CEILING: usize = 8;

/// Kinds scanned for pre-existing terminal states after every (re)list.
pub const DEFAULT_RESYNC_KINDS: &[&str] = &[
    "Deployment",
    "StatefulSet",
    "DaemonSet",
    "Kustomization",
    "HelmRelease",
];

/// Process-level configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Where the pattern document is loaded from (and reloaded from)
    pub patterns: PatternSource,

    /// Root directory for backup snapshots
    pub backup_dir: PathBuf,

    /// HTTP listen address for health/status/reload
    pub listen_addr: String,

    /// Restrict the event watch to one namespace (cluster-wide when `None`)
    pub watch_namespace: Option<String>,

    /// Upper bound on concurrent recovery workers
    pub worker_ceiling: usize,

    /// Keep-alive tick of the watch loop
    pub keepalive_interval: Duration,

    /// Kinds scanned for terminal states on resync
    pub resync_kinds: Vec<String>,

    /// Events replayed by a re-list that are older than this are not matched
    pub stale_event_age: Duration,

    /// How often the live dependency analysis is refreshed
    pub analysis_interval: Duration,

    /// Minimum transitive dependents for a single point of failure
    pub spof_threshold: usize,

    /// Polling used while waiting for deletion and verification
    pub poll: PollConfig,
}

/// Exponential backoff used by wait loops in the executor.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub initial: Duration,
    pub max: Duration,
    pub factor: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(30),
            factor: 2,
        }
    }
}

impl PollConfig {
    /// Next delay after `current`, capped at `max`.
    #[must_use]
    pub fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(self.factor).min(self.max)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            patterns: PatternSource::File(PathBuf::from("/config/patterns.yaml")),
            backup_dir: PathBuf::from("/var/lib/recovery-controller/backups"),
            listen_addr: "0.0.0.0:8080".to_string(),
            watch_namespace: None,
            worker_ceiling: WORKER_HARD_CEILING,
            keepalive_interval: Duration::from_secs(30),
            resync_kinds: DEFAULT_RESYNC_KINDS.iter().map(ToString::to_string).collect(),
            stale_event_age: Duration::from_secs(15 * 60),
            analysis_interval: Duration::from_secs(10 * 60),
            spof_threshold: 3,
            poll: PollConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Worker pool size: the lesser of the configured concurrency and the ceiling.
    #[must_use]
    pub fn worker_count(&self, max_concurrent_recoveries: usize) -> usize {
        max_concurrent_recoveries
            .min(self.worker_ceiling)
            .min(WORKER_HARD_CEILING)
            .max(1)
    }
}

/// Parse a duration string like "30s", "5m", "1h" or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let (digits, multiplier) = if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1)
    } else {
        (s.as_str(), 1)
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration '{s}'"))?;
    value
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{s}' is out of range"))
}
