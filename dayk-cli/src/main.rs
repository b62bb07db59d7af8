//! dayk CLI: fetch, status and config commands.
//!
//! Commands:
//! - `fetch`: discover the universe (or resume the checkpoint) and download
//!   every symbol that is pending or failed
//! - `status`: per-status counts and failed symbols of the persisted checkpoint
//! - `config`: print the effective market configuration as TOML

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dayk_core::{
    CheckpointStore, DailyCachedUniverse, FetchProgress, JsonUniverse, ListFileUniverse,
    MarketConfig, Outcome, Pipeline, RunReport, RunStats, Status, TomlUniverse, UniverseSource,
    YahooProvider,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "dayk",
    about = "dayk: resumable daily price history downloader"
)]
struct Cli {
    /// Debug-level logging (overridden by RUST_LOG).
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command that needs a market config.
#[derive(clap::Args)]
struct MarketArgs {
    /// Built-in market preset: tw or us.
    #[arg(long, default_value = "tw")]
    market: String,

    /// TOML file whose keys override the preset.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Checkpoint table path (overrides config).
    #[arg(long)]
    checkpoint: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download daily history for every pending or failed symbol.
    Fetch {
        #[command(flatten)]
        market: MarketArgs,

        /// Universe listing: .toml, .json, or a `SYMBOL&Name` list file.
        /// Without it the run resumes from the checkpoint.
        #[arg(long)]
        universe: Option<PathBuf>,

        /// Worker pool size (overrides config).
        #[arg(long)]
        workers: Option<usize>,

        /// Artifact directory (overrides config).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Write the run report as JSON to this path.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Show the persisted checkpoint.
    Status {
        #[command(flatten)]
        market: MarketArgs,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[command(flatten)]
        market: MarketArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Fetch {
            market,
            universe,
            workers,
            data_dir,
            report,
        } => run_fetch(&market, universe.as_deref(), workers, data_dir, report.as_deref()),
        Commands::Status { market } => run_status(&market),
        Commands::Config { market } => {
            let config = load_config(&market)?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Preset, then `--config` file, then command-line overrides.
fn load_config(args: &MarketArgs) -> Result<MarketConfig> {
    let preset = MarketConfig::preset(&args.market)?;
    let mut config = match &args.config {
        Some(path) => MarketConfig::from_file_over(&preset, path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => preset,
    };
    if let Some(path) = &args.checkpoint {
        config.checkpoint_path = path.clone();
    }
    Ok(config)
}

/// Pick a universe source by file extension, behind the daily cache when the
/// market config has one.
fn universe_source(path: &Path, config: &MarketConfig) -> Box<dyn UniverseSource> {
    let source: Box<dyn UniverseSource> = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Box::new(TomlUniverse::new(path)),
        Some("json") => Box::new(JsonUniverse::new(path)),
        _ => Box::new(ListFileUniverse::new(path)),
    };
    match &config.universe_cache {
        Some(cache) => Box::new(DailyCachedUniverse::new(
            source,
            cache,
            config.freshness.utc_offset_hours,
        )),
        None => source,
    }
}

fn run_fetch(
    args: &MarketArgs,
    universe: Option<&Path>,
    workers: Option<usize>,
    data_dir: Option<PathBuf>,
    report_path: Option<&Path>,
) -> Result<()> {
    let mut config = load_config(args)?;
    if let Some(n) = workers {
        config.schedule.concurrency = n;
    }
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }

    let provider = YahooProvider::new(config.provider.timeout()).context("building HTTP client")?;
    let source = universe.map(|path| universe_source(path, &config));
    let pipeline = Pipeline::new(config, Arc::new(provider))?;

    let run = pipeline.run(source.as_deref(), &StdoutProgress)?;
    let (report, flushed) = run.finish();

    if let Some(path) = report_path {
        write_report(path, &report)?;
        info!(path = %path.display(), "run report written");
    }

    flushed.context("final checkpoint flush failed; the on-disk table may be behind")?;
    Ok(())
}

fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json).with_context(|| format!("writing report {}", path.display()))?;
    Ok(())
}

fn run_status(args: &MarketArgs) -> Result<()> {
    let config = load_config(args)?;
    let store = CheckpointStore::new(&config.checkpoint_path);

    if !store.exists() {
        println!("No checkpoint at {}", store.path().display());
        return Ok(());
    }

    let set = store.load();
    let counts = set.counts();
    println!("Checkpoint: {}", store.path().display());
    println!("Market:     {}", config.market);
    println!("Symbols:    {}", counts.total());
    println!(
        "  pending {}  success {}  skipped {}  failed {}",
        counts.pending, counts.success, counts.skipped, counts.failed
    );

    let failures = set.failures();
    if !failures.is_empty() {
        println!();
        println!("{:<12} {:<24} Last error", "Symbol", "Name");
        println!("{}", "-".repeat(72));
        for record in &failures {
            println!(
                "{:<12} {:<24} {}",
                record.symbol_id, record.display_name, record.last_error
            );
        }
    }

    Ok(())
}

/// Prints one line per completed symbol.
struct StdoutProgress;

impl FetchProgress for StdoutProgress {
    fn on_start(&self, total: usize) {
        if total == 0 {
            println!("Nothing to fetch: every symbol is up to date.");
        } else {
            println!("Fetching {total} symbols...");
        }
    }

    fn on_outcome(&self, outcome: &Outcome, done: usize, total: usize) {
        match outcome.status {
            Status::Failed => println!(
                "[{done}/{total}] {} FAILED: {}",
                outcome.symbol_id, outcome.error_detail
            ),
            status => println!("[{done}/{total}] {} {status}", outcome.symbol_id),
        }
    }

    fn on_finish(&self, stats: &RunStats) {
        println!();
        println!(
            "Done: {} total, {} ok ({} downloaded, {} skipped), {} failed in {:.1}s",
            stats.total, stats.success, stats.downloaded, stats.skipped, stats.fail, stats.elapsed_secs
        );
        if stats.persist_failures > 0 {
            eprintln!(
                "Warning: {} checkpoint flush(es) failed; see log",
                stats.persist_failures
            );
        }
    }
}
