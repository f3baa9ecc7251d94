//! codap-stacker - Main Entry Point
//!
//! Runs the attribute stacker against a host speaking JSON lines on stdin and
//! stdout, or against an in-memory host for a self-contained demo. Logs go to
//! stderr since stdout carries the protocol.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use codap_stacker::{
    bridge::{EventReceiver, HostChannel},
    config::{default_config_path, AppConfig},
    host::InMemoryHost,
    reshape::{AttributeSchema, CollectionSchema, DataSetSchema, LayoutRow},
    FailurePolicy, LayoutSpec, MigrationReport, StackerPlugin, StreamChannel,
};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "codap-stacker",
    version,
    about = "Stack attributes of a data set into a long layout"
)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Host reply timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// What to do with a partial data set when stacking halts
    #[arg(long, global = true)]
    failure_policy: Option<FailurePolicy>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the data sets open in the host document
    List,
    /// Stack a data set using a layout file
    Stack {
        /// Name of the source data set
        #[arg(long)]
        source: String,
        /// JSON layout file
        #[arg(long)]
        layout: PathBuf,
    },
    /// Stay connected to the host until it disconnects
    Serve,
    /// Stack a built-in sample data set through an in-memory host
    Demo,
    /// Print the effective configuration
    Config {
        /// Also write it to the config path
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_or_default(cli.config.as_deref());
    if let Some(timeout_ms) = cli.timeout_ms {
        config.bridge.request_timeout_ms = timeout_ms;
    }
    if let Some(policy) = cli.failure_policy {
        config.stacking.failure_policy = policy;
    }

    let (writer, _guard) = tracing_appender::non_blocking(std::io::stderr());
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&config.logging.filter))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(writer))
        .init();

    tracing::info!("Starting codap-stacker {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::List => list(config).await,
        Command::Stack { source, layout } => stack(config, &source, &layout).await,
        Command::Serve => serve(config).await,
        Command::Demo => demo(config).await,
        Command::Config { write } => show_config(&config, cli.config.as_deref(), write),
    }
}

fn stdio_plugin(config: AppConfig) -> (Arc<StreamChannel>, StackerPlugin, EventReceiver) {
    let channel = Arc::new(StreamChannel::stdio(config.bridge.request_timeout()));
    let host: Arc<dyn HostChannel> = channel.clone();
    let (plugin, events) = StackerPlugin::new(host, config);
    (channel, plugin, events)
}

async fn list(config: AppConfig) -> anyhow::Result<()> {
    let (_channel, mut plugin, events) = stdio_plugin(config);
    plugin.initialize().await?;

    let data_sets = plugin.list_data_sets().await?;
    tracing::info!("{} data sets open", data_sets.len());
    for data_set in &data_sets {
        tracing::info!("  {} ({})", data_set.display_name(), data_set.name);
    }

    log_events(&events);
    plugin.close();
    Ok(())
}

async fn stack(config: AppConfig, source: &str, layout_path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(layout_path)
        .with_context(|| format!("Failed to read layout file {:?}", layout_path))?;
    let spec: LayoutSpec = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse layout file {:?}", layout_path))?;

    let (_channel, mut plugin, events) = stdio_plugin(config);
    plugin.initialize().await?;
    plugin.select_source(source).await?;

    let source_schema = plugin
        .source()
        .cloned()
        .context("Source data set was not loaded")?;
    plugin.set_layout(spec.build(&source_schema)?)?;
    plugin.persist_state().await?;

    let report = plugin.submit().await?;
    log_events(&events);
    log_report(&report);
    plugin.close();

    if !report.is_complete() {
        bail!("stacking into '{}' did not complete", report.target);
    }
    Ok(())
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let (channel, mut plugin, events) = stdio_plugin(config);
    let restored = plugin.initialize().await?;
    if restored {
        if let Some(source) = plugin.source() {
            tracing::info!("Resuming with source '{}'", source.name);
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    while !channel.is_closed() {
        ticker.tick().await;
        log_events(&events);

        if plugin.take_document_changed() {
            match plugin.list_data_sets().await {
                Ok(data_sets) => tracing::info!(
                    "Document changed, {} data sets open",
                    data_sets.len()
                ),
                Err(e) => tracing::warn!("Could not refresh data sets: {}", e),
            }
        }
    }

    tracing::info!("Host disconnected");
    plugin.close();
    log_events(&events);
    Ok(())
}

async fn demo(config: AppConfig) -> anyhow::Result<()> {
    let host = Arc::new(InMemoryHost::new());
    seed_sample(&host)?;

    let channel: Arc<dyn HostChannel> = host.clone();
    let (mut plugin, events) = StackerPlugin::new(channel, config);
    plugin.initialize().await?;
    plugin.select_source("census").await?;

    let spec = LayoutSpec {
        category: "year".to_string(),
        columns: vec!["population".to_string()],
        rows: vec![
            LayoutRow {
                value: "2000".to_string(),
                cells: vec![Some("pop2000".to_string())],
            },
            LayoutRow {
                value: "2010".to_string(),
                cells: vec![Some("pop2010".to_string())],
            },
        ],
    };
    let source = plugin
        .source()
        .cloned()
        .context("Sample data set was not loaded")?;
    plugin.set_layout(spec.build(&source)?)?;

    let report = plugin.submit().await?;
    log_events(&events);
    log_report(&report);

    for parent in host.cases(&report.target, "states") {
        println!("{}", serde_json::Value::Object(parent.values.clone()));
        for child in host
            .cases(&report.target, "years")
            .iter()
            .filter(|c| c.parent == Some(parent.id))
        {
            println!("    {}", serde_json::Value::Object(child.values.clone()));
        }
    }
    Ok(())
}

fn seed_sample(host: &InMemoryHost) -> anyhow::Result<()> {
    let mut states = CollectionSchema::new("states");
    states.attrs = ["state", "region", "pop2000", "pop2010"]
        .into_iter()
        .map(AttributeSchema::named)
        .collect();
    let mut census = DataSetSchema::new("census");
    census.title = Some("Census".to_string());
    census.collections.push(states);
    host.add_data_set(census);

    let rows = [
        ("Alaska", "West", 626_932, 710_231),
        ("Iowa", "Midwest", 2_926_324, 3_046_355),
        ("Maine", "Northeast", 1_274_923, 1_328_361),
        ("Texas", "South", 20_851_820, 25_145_561),
    ];
    for (state, region, pop2000, pop2010) in rows {
        host.add_case(
            "census",
            "states",
            None,
            json!({ "state": state, "region": region, "pop2000": pop2000, "pop2010": pop2010 }),
        )?;
    }
    Ok(())
}

fn show_config(config: &AppConfig, path: Option<&Path>, write: bool) -> anyhow::Result<()> {
    println!("{}", toml::to_string_pretty(config)?);
    if write {
        let path = path
            .map(Path::to_path_buf)
            .or_else(default_config_path)
            .context("No config directory on this platform")?;
        config.save(&path)?;
        tracing::info!("Wrote config to {:?}", path);
    }
    Ok(())
}

fn log_events(events: &EventReceiver) {
    for event in events.drain() {
        if event.is_error() {
            tracing::warn!("{}", event);
        } else {
            tracing::debug!("{}", event);
        }
    }
    let dropped = events.dropped_count();
    if dropped > 0 {
        tracing::debug!("{} status events were dropped", dropped);
    }
}

fn log_report(report: &MigrationReport) {
    tracing::info!(
        "'{}': {}/{} rows, {} child cases",
        report.target,
        report.rows_migrated,
        report.rows_total,
        report.children_created
    );
    for (row, reason) in &report.child_failures {
        tracing::warn!("Row {}: children not created: {}", row, reason);
    }
    if let Some(halt) = &report.halted {
        tracing::error!("Halted at row {}: {}", halt.row, halt.reason);
    }
    match report.rolled_back {
        Some(true) => tracing::info!("Partial data set removed"),
        Some(false) => tracing::warn!("Partial data set could not be removed"),
        None => {}
    }
}
