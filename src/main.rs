use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn, LevelFilter};
use simple_logger::SimpleLogger;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use time::macros::format_description;

mod cabinet;
mod config;
mod events;
mod lookup;
mod merge;
mod model;
mod orchestrator;
mod reconcile;
mod store;

use cabinet::load_cabinet_dir;
use config::RunConfig;
use events::LogSink;
use lookup::{CategoryLookup, ReferenceTable, SearchApiLookup};
use merge::{run_merge, MergeInputs, MergeSummary};
use orchestrator::{load_inputs, run_cabinet, run_lookup, Policy, RunSummary};
use store::SheetRef;

#[derive(Parser)]
#[command(name = "WB/YM Category Reconciler")]
#[command(about = "Maps YM categories onto the WB category tree and writes YM_id back into the workbook.")]
#[command(version = "1.1.0")]
struct Cli {
    #[arg(long, help = "Path to the run configuration YAML file")]
    config: Option<PathBuf>,
    #[arg(short, long, help = "Workbook (.xlsx, .csv or a directory of CSV sheets) holding the WB and YM sheets")]
    workbook: Option<PathBuf>,
    #[arg(short, long, default_value = "INFO", help = "Logging level (DEBUG, INFO, WARN, ERROR)")]
    log_level: String,
    #[arg(short, long, help = "Targets resolved between checkpoints")]
    batch_size: Option<usize>,
    #[arg(long, help = "Maintain YM_name next to YM_id (true/false)")]
    mirror_names: Option<bool>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve YM category names through the marketplace search API.
    Lookup {
        #[arg(short, long, value_enum, default_value = "batched", help = "Execution policy")]
        mode: Mode,
        #[arg(long, help = "Search endpoint; {query} is replaced by the category name")]
        endpoint: Option<String>,
        #[arg(long, help = "Concurrent lookups per batch (defaults to the batch size)")]
        max_in_flight: Option<usize>,
    },
    /// Resolve YM category names against a local name -> subject_id table.
    Reference {
        #[arg(short, long, value_enum, default_value = "batched", help = "Execution policy")]
        mode: Mode,
        #[arg(long, help = "File holding the reference table (defaults to the workbook)")]
        reference: Option<PathBuf>,
        #[arg(long, help = "Sheet holding the reference table")]
        reference_sheet: Option<String>,
    },
    /// Assign YM_id by matching subject/parent names against cabinet exports.
    Cabinet {
        #[arg(long, help = "Directory of cabinet export files")]
        dir: Option<PathBuf>,
    },
    /// Join the WB sheet with the products and cabinet item files into one CSV report.
    Merge {
        #[arg(long, help = "Products CSV (subjectID, vendorCode)")]
        products: Option<PathBuf>,
        #[arg(long, help = "Cabinet items CSV (Артикул; Категория_YMid)")]
        items: Option<PathBuf>,
        #[arg(short, long, help = "Report output path")]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Serial,
    Batched,
    Concurrent,
}

impl Mode {
    fn policy(self, batch_size: usize, max_in_flight: Option<usize>) -> Policy {
        match self {
            Mode::Serial => Policy::Serial,
            Mode::Batched => Policy::Batched { batch_size },
            Mode::Concurrent => Policy::Concurrent { batch_size, max_in_flight: max_in_flight.unwrap_or(batch_size) },
        }
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    let millis = elapsed.subsec_millis();
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}.{:03}s", seconds, millis)
    }
}

fn get_current_timestamp_str() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn init_logging(level: &str) -> Result<()> {
    let log_level = match level.to_uppercase().as_str() {
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        _ => {
            eprintln!("Invalid log level '{}', defaulting to INFO.", level);
            LevelFilter::Info
        }
    };
    SimpleLogger::new()
        .with_level(log_level)
        .with_timestamp_format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .init()?;
    Ok(())
}

/// Config file values first, then any flag given on the command line.
fn resolve_config(cli: &Cli) -> Result<RunConfig> {
    let mut config = match &cli.config {
        Some(path) => RunConfig::load(path)?,
        None => {
            info!("No run configuration file given, using defaults.");
            RunConfig::default()
        }
    };
    if let Some(workbook) = &cli.workbook {
        config.workbook = workbook.clone();
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    if cli.mirror_names.is_some() {
        config.mirror_names = cli.mirror_names;
    }
    match &cli.command {
        Command::Lookup { endpoint, max_in_flight, .. } => {
            if let Some(endpoint) = endpoint {
                config.lookup.endpoint = endpoint.clone();
            }
            if max_in_flight.is_some() {
                config.max_in_flight = *max_in_flight;
            }
        }
        Command::Reference { reference, reference_sheet, .. } => {
            if reference.is_some() {
                config.reference.path = reference.clone();
            }
            if let Some(sheet) = reference_sheet {
                config.reference.sheet = sheet.clone();
            }
        }
        Command::Cabinet { dir } => {
            if let Some(dir) = dir {
                config.cabinets_dir = dir.clone();
            }
        }
        Command::Merge { products, items, output } => {
            if let Some(products) = products {
                config.merge.products = products.clone();
            }
            if let Some(items) = items {
                config.merge.items = items.clone();
            }
            if let Some(output) = output {
                config.merge.output = output.clone();
            }
        }
    }
    config.validate()?;
    Ok(config)
}

fn sheet_ref(config: &RunConfig, sheet: &str) -> SheetRef {
    SheetRef::new(config.workbook.clone(), sheet).with_delimiter(config.delimiter_byte())
}

fn progress_bar(len: u64) -> ProgressBar {
    let progress_bar = ProgressBar::new(len);
    progress_bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta} @ {per_sec}) {msg}")
            .expect("Failed to create progress bar template")
            .progress_chars("=> "),
    );
    progress_bar
}

fn load_reference(config: &RunConfig) -> Result<ReferenceTable> {
    let sheet = SheetRef::new(config.reference_path(), config.reference.sheet.clone())
        .with_delimiter(config.delimiter_byte());
    let grid = store::read_sheet(&sheet)
        .with_context(|| format!("Failed to read reference sheet {}", sheet.describe()))?;
    let table = ReferenceTable::from_grid(&grid, &config.reference.id_column, &config.reference.name_column)
        .with_context(|| {
            format!(
                "Reference sheet {} needs columns '{}' and '{}' (available: {})",
                sheet.describe(),
                config.reference.id_column,
                config.reference.name_column,
                grid.headers.join(", ")
            )
        })?;
    info!("Reference table loaded from {}: {} entries.", sheet.describe(), table.len());
    if table.is_empty() {
        warn!("Reference table is empty; every target will be unresolved.");
    }
    Ok(table)
}

async fn reconcile_with(config: &RunConfig, mode: Mode, lookup: &dyn CategoryLookup) -> Result<RunSummary> {
    let primary = sheet_ref(config, &config.primary_sheet);
    let target = sheet_ref(config, &config.target_sheet);
    let (mut table, targets) = load_inputs(&primary, &target, config.mirror_names.unwrap_or(true))?;
    let policy = mode.policy(config.batch_size, config.max_in_flight);

    let progress = progress_bar(targets.len() as u64);
    progress.set_message("Starting reconciliation...");
    let mut sink = LogSink::new();
    let summary = run_lookup(policy, &primary, &mut table, &targets, lookup, &mut sink, &progress).await;
    progress.finish_with_message(format!(
        "Reconciliation finished. {} resolved, {} unresolved.",
        summary.resolved, summary.unresolved
    ));
    Ok(summary)
}

fn reconcile_by_cabinet(config: &RunConfig) -> Result<RunSummary> {
    let primary = sheet_ref(config, &config.primary_sheet);
    info!("Loading cabinet mappings from: {}", config.cabinets_dir.display());
    let mapping = load_cabinet_dir(&config.cabinets_dir)?;
    let mut table = store::load_primary(&primary, config.mirror_names.unwrap_or(false))
        .with_context(|| format!("Failed to load primary sheet {}", primary.describe()))?;
    let mut sink = LogSink::new();
    Ok(run_cabinet(&primary, &mut table, &mapping, &mut sink))
}

fn log_run_summary(summary: &RunSummary, start_time: Instant, run_timestamp: &str) {
    info!("-------------------- FINAL SUMMARY --------------------");
    info!("Run started: {}, finished: {}", run_timestamp, get_current_timestamp_str());
    info!("Total execution time: {}", format_elapsed(start_time.elapsed()));
    info!("Reconciliation time: {}", format_elapsed(summary.elapsed));
    if summary.targets > 0 {
        info!("Targets processed: {}", summary.targets);
        info!("Targets resolved: {}", summary.resolved);
        info!("Targets unresolved: {}", summary.unresolved);
    }
    if summary.lookup_failures > 0 {
        warn!("Lookup failures (counted as unresolved): {}", summary.lookup_failures);
    }
    if summary.identifier_misses > 0 {
        warn!("Resolved ids absent from the primary sheet: {}", summary.identifier_misses);
    }
    if summary.targets > 0 {
        info!("Targets applied to rows: {}", summary.targets_applied);
    }
    if summary.rows_matched_by_name > 0 {
        info!("Rows matched by name: {}", summary.rows_matched_by_name);
    }
    info!("Rows updated: {}", summary.rows_updated);
    if summary.rows_unmatched > 0 {
        warn!("Rows left without a name mapping: {}", summary.rows_unmatched);
    }
    info!("Checkpoints written: {}", summary.flushes_ok);
    if summary.flushes_failed > 0 {
        warn!("Checkpoints failed: {}", summary.flushes_failed);
    }
    match summary.last_flush_ok {
        Some(true) => info!("Final state persisted."),
        Some(false) => error!("Last checkpoint failed; the backing file does not hold the final state."),
        None => warn!("No checkpoint was attempted."),
    }
    info!("-------------------------------------------------------");
}

fn log_merge_summary(summary: &MergeSummary, output: &std::path::Path, start_time: Instant) {
    info!("-------------------- FINAL SUMMARY --------------------");
    info!("Total execution time: {}", format_elapsed(start_time.elapsed()));
    info!("Category rows: {}", summary.category_rows);
    info!("Product rows: {}", summary.product_rows);
    info!("Cabinet item rows: {}", summary.item_rows);
    info!("Rows after joining products: {}", summary.joined_with_products);
    info!("Rows in report: {}", summary.final_rows);
    info!("Report: {}", output.display());
    info!("-------------------------------------------------------");
}

#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    info!("Starting WB/YM Category Reconciler");
    let timestamp_str = get_current_timestamp_str();
    info!("Run Timestamp: {}", timestamp_str);

    let config = resolve_config(&cli)?;
    if let Some(description) = &config.description {
        info!("Run: {}", description);
    }
    info!("Workbook: {}", config.workbook.display());

    let summary = match cli.command {
        Command::Lookup { mode, .. } => {
            let lookup =
                SearchApiLookup::new(&config.lookup.endpoint, config.lookup.timeout(), &config.lookup.user_agent)
                    .context("Failed to build the search API client")?;
            info!("Search endpoint: {}", config.lookup.endpoint);
            reconcile_with(&config, mode, &lookup).await?
        }
        Command::Reference { mode, .. } => {
            let reference = load_reference(&config)?;
            reconcile_with(&config, mode, &reference).await?
        }
        Command::Cabinet { .. } => reconcile_by_cabinet(&config)?,
        Command::Merge { .. } => {
            let inputs = MergeInputs {
                workbook: sheet_ref(&config, &config.primary_sheet),
                products: config.merge.products.clone(),
                items: config.merge.items.clone(),
                output: config.merge.output.clone(),
            };
            let merged = run_merge(&inputs)?;
            log_merge_summary(&merged, &inputs.output, start_time);
            return Ok(());
        }
    };

    log_run_summary(&summary, start_time, &timestamp_str);
    if !summary.persisted() {
        std::process::exit(1);
    }
    Ok(())
}
