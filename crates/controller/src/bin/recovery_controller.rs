/*
 * 5D Labs Platform - Cluster Recovery Controller
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Recovery Controller - error-pattern detection and ordered recovery
//!
//! - `start`: watch events, match patterns, run recoveries, serve status
//! - `reload` / `status` / `clear`: talk to a running controller
//! - `dry-run`: replay events against manifests in an in-memory cluster
//! - `validate` / `analyze` / `impact`: offline checks

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use recovery_controller::cluster::{InMemoryCluster, KubeCluster};
use recovery_controller::config::{parse_duration, RuntimeConfig, DEFAULT_RESYNC_KINDS, WORKER_HARD_CEILING};
use recovery_controller::error::exit_code;
use recovery_controller::events::{synthesize_terminal_events, ClusterEvent, EventWatcher};
use recovery_controller::executor::{FileBackupSink, MemoryBackupSink};
use recovery_controller::graph::{DependencyGraph, GraphBuilder};
use recovery_controller::patterns::{PatternSource, PatternStore};
use recovery_controller::report::{render_impact, AnalysisSummary, DryRunReport, StatusReport};
use recovery_controller::server::{self, ClearRequest, ClearResponse};
use recovery_controller::{ClusterApi, ClusterError, Error, RecoveryController, ResourceKey};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Depth of the channel between the event watcher and the dispatcher
const EVENT_QUEUE_DEPTH: usize = 256;

/// Error-pattern detection and dependency-aware recovery for GitOps clusters
#[derive(Parser)]
#[command(name = "recovery-controller")]
#[command(about = "Error-pattern detection and dependency-aware recovery for GitOps clusters")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Pattern document: a file path or configmap:<namespace>/<name>[:<key>]
    #[arg(long, env = "RECOVERY_CONFIG", default_value = "/config/patterns.yaml", global = true)]
    config: String,

    /// Report format (json or text)
    #[arg(long, value_enum, default_value = "text", global = true)]
    format: OutputFormat,

    /// Log format (json or text)
    #[arg(long, value_enum, env = "RECOVERY_LOG_FORMAT", default_value = "text", global = true)]
    log_format: OutputFormat,

    /// Base URL of a running controller
    #[arg(long, env = "RECOVERY_ENDPOINT", default_value = "http://127.0.0.1:8080", global = true)]
    endpoint: String,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller: event watch, recovery workers and status server
    Start {
        /// Directory for backup snapshots
        #[arg(long, env = "RECOVERY_BACKUP_DIR", default_value = "/var/lib/recovery-controller/backups")]
        backup_dir: PathBuf,

        /// Status server address
        #[arg(long, env = "RECOVERY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
        listen_addr: String,

        /// Only watch one namespace
        #[arg(long, env = "RECOVERY_WATCH_NAMESPACE")]
        namespace: Option<String>,

        /// Upper bound on recovery workers
        #[arg(long, env = "RECOVERY_WORKERS", default_value_t = WORKER_HARD_CEILING)]
        workers: usize,

        /// Watch loop keep-alive tick (e.g. 30s)
        #[arg(long, default_value = "30s", value_parser = parse_duration)]
        keepalive: Duration,

        /// Dependency analysis refresh interval (e.g. 10m)
        #[arg(long, default_value = "10m", value_parser = parse_duration)]
        analysis_interval: Duration,
    },
    /// Ask a running controller to reload its pattern document
    Reload,
    /// Show patterns, recovery states and the last dependency analysis
    Status,
    /// Replay events against manifests in an in-memory cluster
    DryRun {
        /// Directory of YAML manifests seeding the cluster
        #[arg(long)]
        manifests: PathBuf,

        /// YAML list of events; defaults to terminal states found in the manifests
        #[arg(long)]
        events: Option<PathBuf>,
    },
    /// Load and validate the pattern document
    Validate,
    /// Build the dependency graph and report cycles and ordering
    Analyze {
        /// Read manifests instead of the live cluster
        #[arg(long)]
        manifests: Option<PathBuf>,

        /// Restrict the live scan to these namespaces
        #[arg(long = "namespace")]
        namespaces: Vec<String>,

        /// Minimum dependents for a single point of failure
        #[arg(long, default_value_t = 3)]
        spof_threshold: usize,
    },
    /// Show what depends on a resource (Kind/namespace/name)
    Impact {
        key: String,

        /// Read manifests instead of the live cluster
        #[arg(long)]
        manifests: Option<PathBuf>,

        /// Maximum hops to follow
        #[arg(long, default_value_t = 10)]
        depth: usize,
    },
    /// Clear the recovery state of a resource on a running controller
    Clear { key: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match run(cli).await {
        Ok(code) => exit(code),
        Err(e) => {
            let code = classify(&e);
            let message = format!("{e:#}");
            error!(error = %message, exit_code = code, "Command failed");
            eprintln!("{} {message}", "✗".red().bold());
            exit(code)
        }
    }
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn init_tracing(format: OutputFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        OutputFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        OutputFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

/// Map an error chain onto the reserved exit codes.
fn classify(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| {
            if let Some(e) = cause.downcast_ref::<Error>() {
                Some(e.exit_code())
            } else if cause.downcast_ref::<recovery_controller::patterns::LoadError>().is_some() {
                Some(exit_code::CONFIGURATION)
            } else {
                cause
                    .downcast_ref::<ClusterError>()
                    .filter(|e| e.is_connectivity())
                    .map(|_| exit_code::CONNECTIVITY)
            }
        })
        .unwrap_or(exit_code::GENERIC)
}

async fn run(cli: Cli) -> Result<i32> {
    let source: PatternSource = cli
        .config
        .parse()
        .map_err(|e: String| Error::Other(e))
        .context("invalid --config")?;

    match cli.command {
        Commands::Start {
            backup_dir,
            listen_addr,
            namespace,
            workers,
            keepalive,
            analysis_interval,
        } => {
            let config = RuntimeConfig {
                patterns: source,
                backup_dir,
                listen_addr,
                watch_namespace: namespace,
                worker_ceiling: workers,
                keepalive_interval: keepalive,
                analysis_interval,
                ..RuntimeConfig::default()
            };
            start(config).await
        }
        Commands::Reload => reload(&cli.endpoint, cli.format).await,
        Commands::Status => status(&cli.endpoint, cli.format).await,
        Commands::Clear { key } => clear(&cli.endpoint, &key, cli.format).await,
        Commands::Validate => validate(&source, cli.format).await,
        Commands::DryRun { manifests, events } => {
            dry_run(&source, &manifests, events.as_deref(), cli.format).await
        }
        Commands::Analyze {
            manifests,
            namespaces,
            spof_threshold,
        } => {
            let graph = load_graph(manifests.as_deref(), &namespaces).await?;
            let summary = AnalysisSummary::from_graph(&graph, spof_threshold);
            print_report(cli.format, &summary, AnalysisSummary::render_text)?;
            Ok(if summary.has_cycles() {
                exit_code::CYCLE
            } else {
                exit_code::OK
            })
        }
        Commands::Impact {
            key,
            manifests,
            depth,
        } => {
            let key = parse_key(&key)?;
            let graph = load_graph(manifests.as_deref(), &[]).await?;
            if !graph.contains(&key) {
                warn!(resource = %key, "Resource is not part of the dependency graph");
            }
            let report = graph.impact(&key, depth);
            print_report(cli.format, &report, render_impact)?;
            Ok(exit_code::OK)
        }
    }
}

fn parse_key(key: &str) -> Result<ResourceKey> {
    ResourceKey::parse(key)
        .ok_or_else(|| Error::Other(format!("expected Kind/namespace/name or Kind/name, got '{key}'")))
        .map_err(Into::into)
}

fn print_report<T: Serialize>(
    format: OutputFormat,
    report: &T,
    render: impl Fn(&T) -> String,
) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Text => println!("{}", render(report)),
    }
    Ok(())
}

async fn connect() -> Result<kube::Client> {
    let client = kube::Client::try_default()
        .await
        .map_err(|e| Error::Cluster(ClusterError::from(e)))
        .context("failed to create Kubernetes client")?;
    Ok(client)
}

async fn load_store(source: &PatternSource, client: Option<&kube::Client>) -> Result<PatternStore> {
    let store = PatternStore::load(source, client)
        .await
        .map_err(Error::from)
        .with_context(|| format!("failed to load patterns from {source}"))?;
    Ok(store)
}

async fn load_graph(manifests: Option<&Path>, namespaces: &[String]) -> Result<DependencyGraph> {
    let builder = match manifests {
        Some(dir) => GraphBuilder::from_manifest_dir(dir)?,
        None => {
            let cluster = KubeCluster::new(connect().await?);
            GraphBuilder::from_cluster(&cluster, namespaces)
                .await
                .map_err(Error::from)
                .context("failed to read cluster objects")?
        }
    };
    Ok(builder.build())
}

async fn start(config: RuntimeConfig) -> Result<i32> {
    info!(
        patterns = %config.patterns,
        backup_dir = %config.backup_dir.display(),
        listen_addr = %config.listen_addr,
        "Starting recovery controller"
    );

    let client = connect().await?;
    let store = load_store(&config.patterns, Some(&client)).await?;
    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeCluster::new(client.clone()));
    let backups = Arc::new(FileBackupSink::new(config.backup_dir.clone()));

    let controller = Arc::new(
        RecoveryController::new(config.clone(), store, Arc::clone(&cluster), backups)
            .with_client(client.clone()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel::<ClusterEvent>(EVENT_QUEUE_DEPTH);

    let watcher = EventWatcher::new(client, cluster, &config);
    let watch_task = tokio::spawn(watcher.run(event_tx, controller.dedup_window(), shutdown_rx.clone()));
    let dispatch_task = tokio::spawn(Arc::clone(&controller).run(event_rx, shutdown_rx.clone()));
    tokio::spawn(Arc::clone(&controller).run_analysis(shutdown_rx.clone()));
    tokio::spawn(reload_on_hangup(Arc::clone(&controller), shutdown_rx));

    server::serve(Arc::clone(&controller), &config.listen_addr, shutdown_signal())
        .await
        .context("status server failed")?;

    info!("Stopping event watch and draining recoveries");
    shutdown_tx.send_replace(true);
    if let Err(e) = watch_task.await {
        warn!(error = %e, "Event watch task ended abnormally");
    }
    if let Err(e) = dispatch_task.await {
        warn!(error = %e, "Dispatcher task ended abnormally");
    }
    info!("Recovery controller stopped");
    Ok(exit_code::OK)
}

async fn validate(source: &PatternSource, format: OutputFormat) -> Result<i32> {
    let client = match source {
        PatternSource::ConfigMap { .. } => Some(connect().await?),
        _ => None,
    };
    let store = load_store(source, client.as_ref()).await?;
    let report = StatusReport::new(&store, Vec::new(), None);
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => println!(
            "{} {} (version {}, {} patterns, {} actions)",
            "✓".green().bold(),
            format!("{source} is valid").green(),
            store.version(),
            store.patterns().len(),
            store.actions().len()
        ),
    }
    Ok(exit_code::OK)
}

async fn dry_run(
    source: &PatternSource,
    manifests: &Path,
    events: Option<&Path>,
    format: OutputFormat,
) -> Result<i32> {
    let store = load_store(source, None).await?;
    let objects: Vec<_> = GraphBuilder::from_manifest_dir(manifests)?
        .objects()
        .cloned()
        .collect();

    let cluster = Arc::new(InMemoryCluster::with_objects(objects));
    let events = match events {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read events from {}", path.display()))?;
            serde_yaml::from_str::<Vec<ClusterEvent>>(&text)
                .with_context(|| format!("failed to parse events in {}", path.display()))?
        }
        None => {
            let kinds: Vec<String> = DEFAULT_RESYNC_KINDS.iter().map(ToString::to_string).collect();
            synthesize_terminal_events(cluster.as_ref(), &kinds, None).await
        }
    };
    // Recreated objects report ready so verification completes
    cluster.set_auto_ready(true);

    let mut config = RuntimeConfig {
        patterns: source.clone(),
        ..RuntimeConfig::default()
    };
    config.poll.initial = Duration::from_millis(10);
    config.poll.max = Duration::from_millis(100);

    let version = store.version().to_string();
    let cluster_api: Arc<dyn ClusterApi> = cluster.clone();
    let controller = RecoveryController::new(config, store, cluster_api, Arc::new(MemoryBackupSink::new()));

    let mut processed = Vec::with_capacity(events.len());
    for event in &events {
        processed.push(controller.process(event).await);
    }

    let report = DryRunReport {
        pattern_version: version,
        events: processed,
        operations: cluster.journal().iter().map(ToString::to_string).collect(),
    };
    print_report(format, &report, DryRunReport::render_text)?;
    Ok(exit_code::OK)
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")
}

async fn reload(endpoint: &str, format: OutputFormat) -> Result<i32> {
    let response = http_client()?
        .post(format!("{endpoint}/reload"))
        .send()
        .await
        .with_context(|| format!("failed to reach controller at {endpoint}"))?;

    let ok = response.status().is_success();
    let body: serde_json::Value = response.json().await.context("invalid reload response")?;
    match (format, ok) {
        (OutputFormat::Json, _) => println!("{}", serde_json::to_string_pretty(&body)?),
        (OutputFormat::Text, true) => println!(
            "{} {}",
            "✓".green().bold(),
            format!("Reloaded patterns version {}", body["version"].as_str().unwrap_or("?")).green()
        ),
        (OutputFormat::Text, false) => println!(
            "{} {} (still running {})",
            "✗".red().bold(),
            body["error"].as_str().unwrap_or("reload failed").red(),
            body["active_version"].as_str().unwrap_or("?")
        ),
    }
    Ok(if ok {
        exit_code::OK
    } else {
        exit_code::CONFIGURATION
    })
}

async fn status(endpoint: &str, format: OutputFormat) -> Result<i32> {
    let report: StatusReport = http_client()?
        .get(format!("{endpoint}/status"))
        .send()
        .await
        .with_context(|| format!("failed to reach controller at {endpoint}"))?
        .error_for_status()?
        .json()
        .await
        .context("invalid status response")?;
    print_report(format, &report, StatusReport::render_text)?;
    Ok(exit_code::OK)
}

async fn clear(endpoint: &str, key: &str, format: OutputFormat) -> Result<i32> {
    let key = parse_key(key)?;
    let response: ClearResponse = http_client()?
        .post(format!("{endpoint}/clear"))
        .json(&ClearRequest { key: key.to_string() })
        .send()
        .await
        .with_context(|| format!("failed to reach controller at {endpoint}"))?
        .error_for_status()?
        .json()
        .await
        .context("invalid clear response")?;

    match (format, response.cleared) {
        (OutputFormat::Json, _) => println!("{}", serde_json::to_string_pretty(&response)?),
        (OutputFormat::Text, true) => {
            println!("{} {}", "✓".green().bold(), format!("Cleared {}", response.key).green());
        }
        (OutputFormat::Text, false) => println!(
            "{} {}",
            "⚠".yellow().bold(),
            format!("Nothing cleared for {} (unknown or in progress)", response.key).yellow()
        ),
    }
    Ok(exit_code::OK)
}

async fn reload_on_hangup(controller: Arc<RecoveryController>, mut shutdown: watch::Receiver<bool>) {
    #[cfg(unix)]
    {
        let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Cannot install SIGHUP handler, reload via HTTP only");
                return;
            }
        };
        loop {
            tokio::select! {
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("Received SIGHUP, reloading patterns");
                    if let Err(e) = controller.reload().await {
                        warn!(error = %e, "SIGHUP reload rejected");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (controller, shutdown.changed().await);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
