//! `dqmflow` entry point.
//!
//! Operator CLI for the monitoring-histogram pipeline:
//!
//! - `dqmflow scan`: discover new monitoring files
//! - `dqmflow process`: recover stranded files and drive the backlog
//! - `dqmflow status`: per-state file counts
//! - `dqmflow dataset`: build an ML dataset for a run/lumi range

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dqmflow_core::cache::ResultCache;
use dqmflow_core::{
    Config, Coordinator, DatasetBuilder, FileDiscovery, IndexStore, LocalWorkerPool,
    TransformRegistry,
};
use dqmflow_protocol::{DatasetFormat, DatasetQuery};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "dqmflow", about = "nanoDQMIO ingestion and dataset preparation")]
struct Cli {
    /// TOML configuration file. When omitted, --source-root and --db
    /// are required and all other knobs use their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root directory scanned for monitoring files.
    #[arg(long = "source-root", global = true)]
    source_root: Option<PathBuf>,

    /// Path of the SQLite index database.
    #[arg(long = "db", global = true)]
    index_db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Discover new monitoring files under the source root.
    Scan,
    /// Recover stranded files, then drive every pending file to a
    /// terminal state.
    Process,
    /// Show per-state file counts.
    Status(StatusArgs),
    /// Build a dataset and write it as JSON.
    Dataset(DatasetArgs),
}

#[derive(Debug, Parser)]
struct StatusArgs {
    /// Output as JSON.
    #[arg(long, short = 'j')]
    json: bool,
}

#[derive(Debug, Parser)]
struct DatasetArgs {
    #[arg(long = "run-start")]
    run_start: u32,

    #[arg(long = "run-end")]
    run_end: u32,

    #[arg(long = "lumi-start")]
    lumi_start: Option<u32>,

    #[arg(long = "lumi-end")]
    lumi_end: Option<u32>,

    /// Detector component filter; repeatable. Empty means every
    /// component with indexed data.
    #[arg(long = "component", short = 'c')]
    components: Vec<String>,

    /// Feature transform: raw, normalized or zscore.
    #[arg(long, default_value = "raw")]
    transform: String,

    /// Output file; stdout when omitted.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let store = IndexStore::open(&config.index_db_path, config.db_pool_size)
        .with_context(|| format!("open index at {}", config.index_db_path.display()))?;

    match cli.command {
        Command::Scan => scan(&store, &config).await,
        Command::Process => process(&store, &config).await,
        Command::Status(args) => status(&store, &args).await,
        Command::Dataset(args) => dataset(&store, &config, &args).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    if let Some(path) = &cli.config {
        let mut config =
            Config::load(path).with_context(|| format!("load config {}", path.display()))?;
        // Explicit flags override the file.
        if let Some(root) = &cli.source_root {
            config.source_root = root.clone();
        }
        if let Some(db) = &cli.index_db {
            config.index_db_path = db.clone();
        }
        return Ok(config);
    }
    match (&cli.source_root, &cli.index_db) {
        (Some(root), Some(db)) => Ok(Config::with_paths(root.clone(), db.clone())),
        _ => anyhow::bail!("either --config or both --source-root and --db are required"),
    }
}

async fn scan(store: &IndexStore, config: &Config) -> anyhow::Result<()> {
    let discovery = FileDiscovery::new(store.clone(), config);
    let files = discovery.scan_async().await?;
    for file in &files {
        println!("{}\trun {}\t{} bytes", file.path, file.run_number, file.size_bytes);
    }
    eprintln!("{} new file(s)", files.len());
    Ok(())
}

async fn process(store: &IndexStore, config: &Config) -> anyhow::Result<()> {
    let discovery = FileDiscovery::new(store.clone(), config);
    let new_files = discovery.scan_async().await?;
    tracing::info!(new = new_files.len(), "scan before processing");

    let pool = Arc::new(LocalWorkerPool::new(
        store.clone(),
        config.worker_concurrency,
    ));
    let coordinator = Coordinator::new(store.clone(), pool, config);

    let recovered = coordinator.recover().await?;
    let report = coordinator.run_pending().await?;
    eprintln!(
        "indexed {}, failed {}, retries {}, recovered-pass indexed {}",
        report.indexed, report.failed, report.retries, recovered.indexed
    );
    Ok(())
}

async fn status(store: &IndexStore, args: &StatusArgs) -> anyhow::Result<()> {
    let counts = store.status_counts_async().await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
    } else {
        println!("discovered  {}", counts.discovered);
        println!("queued      {}", counts.queued);
        println!("processing  {}", counts.processing);
        println!("indexed     {}", counts.indexed);
        println!("failed      {}", counts.failed);
    }
    Ok(())
}

async fn dataset(store: &IndexStore, config: &Config, args: &DatasetArgs) -> anyhow::Result<()> {
    let query = DatasetQuery {
        run_start: args.run_start,
        run_end: args.run_end,
        lumi_start: args.lumi_start,
        lumi_end: args.lumi_end,
        components: args.components.clone(),
        transform: args.transform.clone(),
        format: DatasetFormat::Long,
    };

    let builder = DatasetBuilder::new(store.clone(), Arc::new(TransformRegistry::default()));
    let cache = ResultCache::new(
        store.clone(),
        builder,
        config.cache_max_bytes,
        config.cache_max_entries,
        Duration::from_secs(config.cache_staleness_secs),
    );

    let token = CancellationToken::new();
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling build");
            ctrl_c_token.cancel();
        }
    });

    let dataset = cache.get_or_build(&query, &token).await?;
    let json = serde_json::to_string_pretty(dataset.as_ref())?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("write dataset to {}", path.display()))?;
            eprintln!(
                "{} rows ({} gaps) -> {}",
                dataset.rows.len(),
                dataset.rows.iter().filter(|r| r.gap).count(),
                path.display()
            );
        }
        None => println!("{json}"),
    }
    Ok(())
}
