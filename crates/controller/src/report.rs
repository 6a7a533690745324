//! Status, analysis and dry-run reports.
//!
//! Every report serializes to JSON for `GET /status` and `--format json`,
//! and renders as colored text for the CLI.

use crate::controller::ProcessedEvent;
use crate::graph::{DependencyGraph, ImpactReport, RecoveryPlan, SinglePointOfFailure};
use crate::patterns::{PatternStore, Severity};
use crate::resource::ResourceKey;
use crate::state::{RecoveryState, RecoveryStatus};
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::{Deserialize, Serialize};

const RULE_WIDTH: usize = 70;

fn section(lines: &mut Vec<String>, title: &str) {
    lines.push(String::new());
    lines.push("═".repeat(RULE_WIDTH).bright_black().to_string());
    lines.push(title.cyan().bold().to_string());
    lines.push("═".repeat(RULE_WIDTH).bright_black().to_string());
}

fn severity_label(severity: Severity) -> String {
    match severity {
        Severity::Critical => severity.as_str().red().bold().to_string(),
        Severity::High => severity.as_str().red().to_string(),
        Severity::Warning => severity.as_str().yellow().to_string(),
        Severity::Low => severity.as_str().bright_black().to_string(),
    }
}

fn status_label(status: RecoveryStatus) -> String {
    match status {
        RecoveryStatus::Failed => format!("{} {}", "✗".red().bold(), status.as_str().red()),
        RecoveryStatus::InProgress => format!("{} {}", "▶".cyan(), status.as_str().cyan()),
        RecoveryStatus::CoolingDown => format!("{} {}", "⚠".yellow(), status.as_str().yellow()),
        RecoveryStatus::Idle => format!("{} {}", "✓".green(), status.as_str().green()),
    }
}

fn status_rank(status: RecoveryStatus) -> u8 {
    match status {
        RecoveryStatus::Failed => 0,
        RecoveryStatus::InProgress => 1,
        RecoveryStatus::CoolingDown => 2,
        RecoveryStatus::Idle => 3,
    }
}

fn render_cycle(path: &[ResourceKey]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// One loaded pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSummary {
    pub name: String,
    pub severity: Severity,
    pub recovery_action: String,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Global settings as reported
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsSummary {
    pub auto_recovery_enabled: bool,
    pub auto_recovery_severities: Vec<Severity>,
    pub min_recovery_confidence: f64,
    pub max_concurrent_recoveries: usize,
    pub recovery_cooldown_secs: u64,
    pub dedup_window_secs: u64,
    pub impact_max_depth: usize,
}

/// Dependency analysis snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub generated_at: DateTime<Utc>,
    pub nodes: usize,
    pub edges: usize,
    pub cycles: Vec<Vec<ResourceKey>>,
    /// Cycle members and their transitive dependents
    pub blocked: Vec<ResourceKey>,
    /// Plan over the acyclic portion
    pub plan: RecoveryPlan,
    pub single_points_of_failure: Vec<SinglePointOfFailure>,
}

impl AnalysisSummary {
    #[must_use]
    pub fn from_graph(graph: &DependencyGraph, spof_threshold: usize) -> Self {
        let analysis = graph.analyze();
        Self {
            generated_at: Utc::now(),
            nodes: graph.len(),
            edges: graph.edge_count(),
            cycles: analysis.cycles,
            blocked: analysis.blocked.into_iter().collect(),
            plan: analysis.plan,
            single_points_of_failure: graph.single_points_of_failure(spof_threshold),
        }
    }

    #[must_use]
    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }

    #[must_use]
    pub fn render_text(&self) -> String {
        let mut lines = Vec::new();
        self.push_lines(&mut lines);
        lines.join("\n")
    }

    fn push_lines(&self, lines: &mut Vec<String>) {
        section(lines, "Dependency Analysis");
        lines.push(format!(
            "{} {} resources, {} edges (generated {})",
            "ℹ".blue().bold(),
            self.nodes,
            self.edges,
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));

        if self.cycles.is_empty() {
            lines.push(format!("{} {}", "✓".green().bold(), "No dependency cycles".green()));
        } else {
            lines.push(format!(
                "{} {}",
                "✗".red().bold(),
                format!("{} dependency cycle(s)", self.cycles.len()).red()
            ));
            for cycle in &self.cycles {
                lines.push(format!("  {} {}", "→".cyan(), render_cycle(cycle)));
            }
            lines.push(format!(
                "{} {}",
                "⚠".yellow().bold(),
                format!("{} resource(s) blocked behind cycles", self.blocked.len()).yellow()
            ));
        }

        for (index, batch) in self.plan.recreation_batches.iter().enumerate() {
            let names: Vec<String> = batch.iter().map(ToString::to_string).collect();
            lines.push(format!(
                "  {} {}",
                format!("[batch {index}]").bright_black(),
                names.join(", ")
            ));
        }

        if !self.single_points_of_failure.is_empty() {
            lines.push(format!("{}", "Single points of failure:".bold()));
            for spof in &self.single_points_of_failure {
                lines.push(format!(
                    "  {} {} ({} dependents)",
                    "⚠".yellow(),
                    spof.key,
                    spof.dependents
                ));
            }
        }
    }
}

/// Controller status: rule set, recovery records and last analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub controller_version: String,
    pub pattern_version: String,
    pub patterns_loaded_at: DateTime<Utc>,
    pub settings: SettingsSummary,
    pub patterns: Vec<PatternSummary>,
    pub in_flight: usize,
    /// Failed first, then in progress, cooling down, idle
    pub recoveries: Vec<RecoveryState>,
    #[serde(default)]
    pub analysis: Option<AnalysisSummary>,
}

impl StatusReport {
    #[must_use]
    pub fn new(
        store: &PatternStore,
        mut recoveries: Vec<RecoveryState>,
        analysis: Option<AnalysisSummary>,
    ) -> Self {
        recoveries.sort_by(|a, b| {
            status_rank(a.status)
                .cmp(&status_rank(b.status))
                .then_with(|| a.key.cmp(&b.key))
        });
        let in_flight = recoveries
            .iter()
            .filter(|s| s.status == RecoveryStatus::InProgress)
            .count();

        let settings = store.settings();
        Self {
            generated_at: Utc::now(),
            controller_version: env!("CARGO_PKG_VERSION").to_string(),
            pattern_version: store.version().to_string(),
            patterns_loaded_at: store.loaded_at(),
            settings: SettingsSummary {
                auto_recovery_enabled: settings.auto_recovery_enabled,
                auto_recovery_severities: settings.auto_recovery_severities.iter().copied().collect(),
                min_recovery_confidence: settings.min_recovery_confidence,
                max_concurrent_recoveries: settings.max_concurrent_recoveries,
                recovery_cooldown_secs: settings.recovery_cooldown.as_secs(),
                dedup_window_secs: settings.dedup_window.as_secs(),
                impact_max_depth: settings.impact_max_depth,
            },
            patterns: store
                .patterns()
                .iter()
                .map(|p| PatternSummary {
                    name: p.name.clone(),
                    severity: p.severity,
                    recovery_action: p.recovery_action.clone(),
                    max_retries: p.max_retries,
                    description: p.description.clone(),
                })
                .collect(),
            in_flight,
            recoveries,
            analysis,
        }
    }

    /// Records in the `failed` state, which need a manual clear.
    pub fn failed(&self) -> impl Iterator<Item = &RecoveryState> {
        self.recoveries
            .iter()
            .filter(|s| s.status == RecoveryStatus::Failed)
    }

    #[must_use]
    pub fn render_text(&self) -> String {
        let mut lines = Vec::new();

        section(&mut lines, "Recovery Controller Status");
        lines.push(format!(
            "{} controller {} / patterns {} (loaded {})",
            "ℹ".blue().bold(),
            self.controller_version,
            self.pattern_version,
            self.patterns_loaded_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        let auto = if self.settings.auto_recovery_enabled {
            "enabled".green().to_string()
        } else {
            "disabled".yellow().to_string()
        };
        let severities: Vec<&str> = self
            .settings
            .auto_recovery_severities
            .iter()
            .map(|s| s.as_str())
            .collect();
        lines.push(format!(
            "  auto-recovery {auto} for [{}], {} in flight (max {}), cooldown {}s",
            severities.join(", "),
            self.in_flight,
            self.settings.max_concurrent_recoveries,
            self.settings.recovery_cooldown_secs
        ));

        section(&mut lines, "Patterns");
        for pattern in &self.patterns {
            lines.push(format!(
                "  {} {} [{}] → {} (max retries {})",
                "•".cyan(),
                pattern.name.bold(),
                severity_label(pattern.severity),
                pattern.recovery_action,
                pattern.max_retries
            ));
        }

        section(&mut lines, "Recoveries");
        if self.recoveries.is_empty() {
            lines.push(format!("  {}", "No recoveries recorded".bright_black()));
        }
        for state in &self.recoveries {
            let mut line = format!(
                "  {} {} retries {}/{}",
                status_label(state.status),
                state.key.to_string().bold(),
                state.retry_count,
                state.max_retries
            );
            if let Some(pattern) = &state.last_pattern {
                line.push_str(&format!(" pattern={pattern}"));
            }
            if let Some(until) = state.cooldown_until.filter(|_| state.status == RecoveryStatus::CoolingDown) {
                line.push_str(&format!(" until {}", until.format("%H:%M:%S")));
            }
            lines.push(line);
            if let Some(outcome) = &state.last_outcome {
                lines.push(format!("      {}", outcome.bright_black()));
            }
        }

        match &self.analysis {
            Some(analysis) => analysis.push_lines(&mut lines),
            None => {
                section(&mut lines, "Dependency Analysis");
                lines.push(format!("  {}", "No analysis has run yet".bright_black()));
            }
        }

        lines.join("\n")
    }
}

/// Render an impact report as text.
#[must_use]
pub fn render_impact(report: &ImpactReport) -> String {
    let mut lines = Vec::new();
    section(&mut lines, &format!("Impact of {}", report.target));

    lines.push(format!("{} {} direct dependent(s)", "ℹ".blue().bold(), report.direct.len()));
    for key in &report.direct {
        lines.push(format!("  {} {key}", "→".cyan()));
    }

    lines.push(format!(
        "{} {} cascading dependent(s) within {} hop(s)",
        "ℹ".blue().bold(),
        report.cascading.len(),
        report.max_depth
    ));
    for (key, hops) in &report.depth {
        if *hops > 1 {
            lines.push(format!("  {} {key} {}", "→".cyan(), format!("(depth {hops})").bright_black()));
        }
    }
    if report.truncated {
        lines.push(format!(
            "{} {}",
            "⚠".yellow().bold(),
            "Dependents exist beyond the depth cap".yellow()
        ));
    }
    lines.join("\n")
}

/// Outcome of replaying events against an in-memory cluster
#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub pattern_version: String,
    pub events: Vec<ProcessedEvent>,
    /// Cluster mutations in the order they were issued
    pub operations: Vec<String>,
}

impl DryRunReport {
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut lines = Vec::new();
        section(&mut lines, &format!("Dry Run (patterns {})", self.pattern_version));

        for processed in &self.events {
            lines.push(format!(
                "{} {} {}",
                "▶".cyan(),
                processed.key.to_string().bold(),
                format!("reason={}", processed.reason).bright_black()
            ));
            lines.push(format!("    decision: {}", processed.decision));
            match &processed.outcome {
                Some(outcome) if outcome.is_success() => {
                    lines.push(format!("    {} {}", "✓".green().bold(), outcome.summary().green()));
                }
                Some(outcome) => {
                    lines.push(format!("    {} {}", "✗".red().bold(), outcome.summary().red()));
                }
                None => {}
            }
        }

        if !self.operations.is_empty() {
            lines.push(format!("{}", "Cluster operations:".bold()));
            for (index, op) in self.operations.iter().enumerate() {
                lines.push(format!("  {} {op}", format!("[{}]", index + 1).bright_black()));
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeKind;

    const PATTERNS: &str = r"
version: '2025.03'
error_patterns:
  - name: immutable-selector
    error_pattern: 'field is immutable'
    recovery_action: recreate
    severity: critical
    max_retries: 3
recovery_actions:
  recreate:
    steps: [backup_resource_spec, delete_resource_gracefully, recreate_resource]
    timeout: 5m
";

    fn state(name: &str, status: RecoveryStatus) -> RecoveryState {
        RecoveryState {
            key: ResourceKey::new("Deployment", "apps", name),
            status,
            active_since: None,
            cooldown_until: None,
            retry_count: 0,
            max_retries: 3,
            last_pattern: Some("immutable-selector".to_string()),
            last_outcome: None,
        }
    }

    #[test]
    fn failed_recoveries_come_first() {
        let store = PatternStore::from_yaml_str(PATTERNS).unwrap();
        let report = StatusReport::new(
            &store,
            vec![
                state("a-idle", RecoveryStatus::Idle),
                state("z-failed", RecoveryStatus::Failed),
                state("m-running", RecoveryStatus::InProgress),
            ],
            None,
        );

        let order: Vec<&str> = report.recoveries.iter().map(|s| s.key.name.as_str()).collect();
        assert_eq!(order, vec!["z-failed", "m-running", "a-idle"]);
        assert_eq!(report.in_flight, 1);
        assert_eq!(report.failed().count(), 1);
        assert_eq!(report.pattern_version, "2025.03");
        assert_eq!(report.patterns[0].recovery_action, "recreate");
    }

    #[test]
    fn status_report_round_trips_as_json() {
        let store = PatternStore::from_yaml_str(PATTERNS).unwrap();
        let report = StatusReport::new(&store, vec![state("web", RecoveryStatus::Failed)], None);
        let json = serde_json::to_string(&report).unwrap();
        let parsed: StatusReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
        assert!(json.contains("\"status\":\"failed\""));
    }

    #[test]
    fn analysis_summary_reports_cycles_and_spofs() {
        let key = |name: &str| ResourceKey::new("Kustomization", "flux-system", name);
        let graph = DependencyGraph::from_pairs(
            &[
                (key("a"), key("b")),
                (key("b"), key("a")),
                (key("apps"), key("infra")),
                (key("monitoring"), key("infra")),
                (key("ingress"), key("infra")),
            ],
            EdgeKind::Orchestration,
        );
        let summary = AnalysisSummary::from_graph(&graph, 3);
        assert!(summary.has_cycles());
        assert_eq!(summary.blocked, vec![key("a"), key("b")]);
        assert_eq!(summary.single_points_of_failure.len(), 1);
        assert_eq!(summary.single_points_of_failure[0].key, key("infra"));

        let text = summary.render_text();
        assert!(text.contains("Kustomization/flux-system/a -> Kustomization/flux-system/b"));
        assert!(text.contains("Kustomization/flux-system/infra (3 dependents)"));
    }

    #[test]
    fn text_report_mentions_every_section() {
        let store = PatternStore::from_yaml_str(PATTERNS).unwrap();
        let report = StatusReport::new(&store, vec![], None);
        let text = report.render_text();
        assert!(text.contains("Patterns"));
        assert!(text.contains("immutable-selector"));
        assert!(text.contains("No recoveries recorded"));
        assert!(text.contains("No analysis has run yet"));
    }
}
