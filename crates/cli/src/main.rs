use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rollwatch_core::{
    ResourceFieldChange, ResourceIdentity, ResourceSnapshot, SemanticChangeRecord, StartupError, StructuralChange,
    SubEntityLayout, WatchConfig,
};
use rollwatch_dispatch::{Dispatcher, DispatchReport, WriterHandle, WriterSink};
use rollwatch_kubehub::{eventlog, parse_gvk_key, EventSource, KubeEventSource, ScriptedSource};
use rollwatch_store::LocalCache;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "rollwatchctl", version, about = "Watch container image rollouts")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List then watch a GVK and report tracked field changes
    Watch {
        /// GVK key, e.g. "apps/v1/Deployment" or "v1/Pod"
        gvk: String,
        /// Namespace to watch (default: all)
        #[arg(long = "ns", env = "ROLLWATCH_NAMESPACE")]
        namespace: Option<String>,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Replay a JSON Lines event log through the same pipeline
    Replay {
        #[arg(long = "file")]
        file: PathBuf,
        /// GVK key used to pick the sub-entity preset
        #[arg(long = "gvk", default_value = "apps/v1/Deployment")]
        gvk: String,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Compare two manifests (YAML or JSON) without a cluster
    Diff {
        old: PathBuf,
        new: PathBuf,
        /// GVK key used to pick the sub-entity preset
        #[arg(long = "gvk", default_value = "apps/v1/Deployment")]
        gvk: String,
        /// Tracked sub-entity field (repeatable)
        #[arg(long = "track")]
        track: Vec<String>,
        /// Tracked resource-level field (repeatable; Pod default: status.phase)
        #[arg(long = "track-resource")]
        track_resource: Vec<String>,
        /// Dotted path to the sub-entity array; overrides the kind preset
        #[arg(long = "sub-entities")]
        sub_entities: Option<String>,
    },
}

#[derive(Args, Debug, Clone)]
struct SessionArgs {
    /// Re-list period in seconds; 0 disables
    #[arg(long = "resync-secs", env = "ROLLWATCH_RESYNC_SECS", default_value_t = 10)]
    resync_secs: u64,
    /// Give up if the cache has not synced within this many seconds
    #[arg(long = "sync-timeout-secs", env = "ROLLWATCH_SYNC_TIMEOUT_SECS", default_value_t = 30)]
    sync_timeout_secs: u64,
    /// Tracked sub-entity field (repeatable; default: image)
    #[arg(long = "track")]
    track: Vec<String>,
    /// Tracked resource-level field (repeatable; Pod default: status.phase)
    #[arg(long = "track-resource")]
    track_resource: Vec<String>,
    /// Dotted path to the sub-entity array; overrides the kind preset
    #[arg(long = "sub-entities")]
    sub_entities: Option<String>,
    #[arg(long = "workers", env = "ROLLWATCH_WORKERS", default_value_t = 4)]
    workers: usize,
    #[arg(long = "queue-cap", env = "ROLLWATCH_QUEUE_CAP", default_value_t = 2048)]
    queue_cap: usize,
}

fn init_tracing() {
    let env = std::env::var("ROLLWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ROLLWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid ROLLWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

fn layout_for(
    gvk: &str,
    track: Vec<String>,
    track_resource: Vec<String>,
    sub_entities: Option<String>,
) -> Result<SubEntityLayout> {
    let gvk = parse_gvk_key(gvk)?;
    let layout = match sub_entities {
        Some(path) => SubEntityLayout::new(path, track),
        None => SubEntityLayout::for_kind(&gvk.group, &gvk.version, &gvk.kind, track),
    };
    Ok(layout.with_resource_fields(track_resource))
}

impl SessionArgs {
    fn config(self, gvk: &str, namespace: Option<String>) -> Result<WatchConfig> {
        Ok(WatchConfig {
            resource_scope: namespace,
            resync_period: (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs)),
            sync_timeout: Duration::from_secs(self.sync_timeout_secs),
            layout: layout_for(gvk, self.track, self.track_resource, self.sub_entities)?,
            workers: self.workers,
            queue_capacity: self.queue_cap,
        })
    }
}

fn render_record(identity: &ResourceIdentity, r: &SemanticChangeRecord) -> String {
    format!(
        "{} {}.{}: {} -> {}",
        identity,
        r.sub_entity,
        r.field,
        r.old_value.as_deref().unwrap_or("<absent>"),
        r.new_value.as_deref().unwrap_or("<absent>")
    )
}

fn render_field(identity: &ResourceIdentity, c: &ResourceFieldChange) -> String {
    format!(
        "{} {}: {} -> {}",
        identity,
        c.field,
        c.old_value.as_deref().unwrap_or("<absent>"),
        c.new_value.as_deref().unwrap_or("<absent>")
    )
}

fn render_structural(c: &StructuralChange) -> String {
    match c {
        StructuralChange::Added(name) => format!("+{name}"),
        StructuralChange::Removed(name) => format!("-{name}"),
    }
}

/// Stdout sink fed through a bounded queue; a stuck terminal drops
/// notices instead of stalling the workers.
fn sink_for(output: Output, capacity: usize) -> Result<(WriterSink, WriterHandle)> {
    let sink = match output {
        Output::Human => WriterSink::human(std::io::stdout(), capacity),
        Output::Json => WriterSink::json_lines(std::io::stdout(), capacity),
    };
    sink.context("starting stdout writer")
}

async fn run_session(
    source: Arc<dyn EventSource>,
    cache: Arc<LocalCache>,
    cfg: &WatchConfig,
    output: Output,
) -> Result<Result<DispatchReport, StartupError>> {
    let (sink, writer) = sink_for(output, cfg.queue_capacity())?;
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received; shutting down");
                cancel.cancel();
            }
        }
    });
    let dispatcher = Dispatcher::with_sink(source, Arc::new(sink), cache, cfg);
    let outcome = dispatcher.run(cancel).await;
    drop(dispatcher);
    if !writer.flushed(Duration::from_secs(2)).await {
        warn!("stdout writer did not drain in time; trailing notices may be lost");
    }
    Ok(outcome)
}

fn finish(outcome: Result<DispatchReport, StartupError>) {
    match outcome {
        Ok(report) => info!(?report, "session finished"),
        Err(e) => {
            error!(error = %e, "startup failed");
            eprintln!("rollwatchctl: {e}");
            std::process::exit(1);
        }
    }
}

fn read_manifest(path: &Path, layout: &SubEntityLayout) -> Result<ResourceSnapshot> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let raw: serde_json::Value = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(layout.build_snapshot(&raw)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Watch { gvk, namespace, session } => {
            let cfg = session.config(&gvk, namespace)?;
            info!(gvk = %gvk, ns = ?cfg.resource_scope, workers = cfg.workers(), "watch invoked");
            let cache = LocalCache::new();
            let source = Arc::new(KubeEventSource::new(gvk, cache.clone(), &cfg));
            finish(run_session(source, cache, &cfg, cli.output).await?);
        }
        Commands::Replay { file, gvk, session } => {
            let cfg = session.config(&gvk, None)?;
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let script = eventlog::parse(&text, &cfg.layout)?;
            info!(file = %file.display(), listed = script.initial.len(), live = script.live.len(), "replay invoked");
            let cache = LocalCache::new();
            let source = ScriptedSource::new(cache.clone())
                .with_initial(script.initial)
                .with_live(script.live)
                .close_when_done(true);
            finish(run_session(Arc::new(source), cache, &cfg, cli.output).await?);
        }
        Commands::Diff { old, new, gvk, track, track_resource, sub_entities } => {
            let layout = layout_for(&gvk, track, track_resource, sub_entities)?;
            let before = read_manifest(&old, &layout)?;
            let after = read_manifest(&new, &layout)?;
            let detection = rollwatch_detect::detect(&after.identity, &before, &after, &layout.tracked_fields);
            match cli.output {
                Output::Human => {
                    if detection.is_empty() {
                        println!("no tracked changes");
                    }
                    for r in &detection.records {
                        println!("~ {}", render_record(&after.identity, r));
                    }
                    for c in &detection.resource {
                        println!("~ {}", render_field(&after.identity, c));
                    }
                    for c in &detection.structural {
                        println!("  {} {}", after.identity, render_structural(c));
                    }
                    for (side, e) in &detection.malformed {
                        println!("! {side:?}: {e}");
                    }
                }
                Output::Json => {
                    let body = serde_json::json!({
                        "identity": after.identity,
                        "records": detection.records,
                        "resource": detection.resource,
                        "structural": detection.structural,
                        "summary": detection.summary(),
                    });
                    println!("{}", serde_json::to_string_pretty(&body)?);
                }
            }
        }
    }
    Ok(())
}
