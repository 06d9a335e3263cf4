//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use boxoffice_core::backlog::{select_backlog, stale_cutoff};
use boxoffice_core::candidates::refresh_candidates;
use boxoffice_core::enrichment::{EnrichmentProgress, EntityState, enrich_backlog};
use boxoffice_core::loader::{load_incremental, pending_rows};
use boxoffice_metadata::OmdbClient;
use boxoffice_shared::{
    AppConfig, EnrichConfig, LoadConfig, MetadataConfig, StoreConfig, TableName, init_config,
    load_config, load_config_from,
};
use boxoffice_storage::Storage;
use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// boxoffice: daily revenue ingestion and movie metadata enrichment.
#[derive(Parser)]
#[command(
    name = "boxoffice",
    version,
    about = "Load daily box-office revenue and enrich titles with movie metadata.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.boxoffice/boxoffice.toml).
    #[arg(long, env = "BOXOFFICE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Database file, overriding `[database].path`.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Append feed rows newer than the watermark into the raw table.
    Load {
        /// Feed table to read (defaults to `[loader].source_table`).
        #[arg(long)]
        source: Option<String>,

        /// Raw table to append to (defaults to `[loader].target_table`).
        #[arg(long)]
        target: Option<String>,
    },

    /// Refresh enrichment candidates from the raw table's titles.
    Candidates {
        /// Raw table to read titles from (defaults to `[loader].target_table`).
        #[arg(long)]
        raw_table: Option<String>,
    },

    /// Fetch metadata for the current backlog.
    Enrich {
        /// Maximum concurrent API requests.
        #[arg(long)]
        concurrency: Option<u32>,

        /// Days before a past attempt is retried.
        #[arg(long)]
        stale_days: Option<u32>,
    },

    /// Show watermark, pending rows, backlog, and today's API usage.
    Status,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "boxoffice=info",
        1 => "boxoffice=debug",
        _ => "boxoffice=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    if let Command::Config { action: ConfigAction::Init } = cli.command {
        return cmd_config_init();
    }

    let config = resolve_config(&cli)?;
    match cli.command {
        Command::Load { source, target } => {
            cmd_load(&config, source.as_deref(), target.as_deref()).await
        }
        Command::Candidates { raw_table } => cmd_candidates(&config, raw_table.as_deref()).await,
        Command::Enrich {
            concurrency,
            stale_days,
        } => cmd_enrich(config, concurrency, stale_days).await,
        Command::Status => cmd_status(&config).await,
        Command::Config { .. } => cmd_config_show(&config),
    }
}

/// Load the config file and apply global overrides.
fn resolve_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    if let Some(db) = &cli.db {
        config.database.path = db.to_string_lossy().into_owned();
    }
    Ok(config)
}

async fn open_storage(config: &AppConfig) -> Result<Storage> {
    let store = StoreConfig::from(config);
    Storage::open(&store)
        .await
        .wrap_err_with(|| format!("failed to open database at {}", store.path.display()))
}

fn table_or(name: Option<&str>, default: &TableName) -> Result<TableName> {
    match name {
        Some(name) => Ok(name.parse()?),
        None => Ok(default.clone()),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_load(config: &AppConfig, source: Option<&str>, target: Option<&str>) -> Result<()> {
    let defaults = LoadConfig::try_from(config)?;
    let source = table_or(source, &defaults.source_table)?;
    let target = table_or(target, &defaults.target_table)?;

    let storage = open_storage(config).await?;
    let report = load_incremental(&storage, &source, &target).await?;

    println!();
    println!("  {source} -> {target}");
    println!("  Inserted:  {}", report.records_processed());
    if report.malformed_rows > 0 {
        println!("  Malformed: {}", report.malformed_rows);
    }
    println!("  Watermark: {}", report.watermark.format("%Y-%m-%d %H:%M:%S"));
    println!();

    Ok(())
}

async fn cmd_candidates(config: &AppConfig, raw_table: Option<&str>) -> Result<()> {
    let defaults = LoadConfig::try_from(config)?;
    let raw_table = table_or(raw_table, &defaults.target_table)?;

    let storage = open_storage(config).await?;
    let written = refresh_candidates(&storage, &raw_table).await?;

    println!("Refreshed {written} enrichment candidates from {raw_table}");
    Ok(())
}

async fn cmd_enrich(
    mut config: AppConfig,
    concurrency: Option<u32>,
    stale_days: Option<u32>,
) -> Result<()> {
    if let Some(concurrency) = concurrency {
        config.enrichment.concurrency = concurrency;
    }
    if let Some(days) = stale_days {
        config.enrichment.stale_after_days = days;
    }

    let metadata = MetadataConfig::from_app(&config)?;
    let enrich = EnrichConfig::from(&config);
    let storage = Arc::new(open_storage(&config).await?);
    let client = Arc::new(OmdbClient::new(&metadata)?);
    let today = Utc::now().date_naive();

    info!(
        concurrency = enrich.concurrency,
        stale_after_days = enrich.stale_after_days,
        "enriching backlog"
    );

    let progress = CliProgress::new();
    let report = enrich_backlog(storage, client, &enrich, today, &progress).await;
    progress.finish();
    let report = report?;

    println!();
    println!("  Attempted:      {}", report.attempted);
    println!("  Succeeded:      {}", report.succeeded);
    println!("  Failed:         {}", report.failed);
    println!("  Quota skipped:  {}", report.quota_skipped);
    println!("  API requests:   {}", report.total_requests);
    if report.quota_exhausted {
        println!("  API request limit reached; remaining titles stay queued.");
    }
    println!();

    Ok(())
}

async fn cmd_status(config: &AppConfig) -> Result<()> {
    let load = LoadConfig::try_from(config)?;
    let enrich = EnrichConfig::from(config);
    let store = StoreConfig::from(config);
    if !store.path.exists() {
        return Err(eyre!(
            "no database at {}; run `boxoffice load` first",
            store.path.display()
        ));
    }
    let storage = Storage::open_readonly(&store).await?;
    let today = Utc::now().date_naive();

    let log = storage.ingestion_log(load.source_table.as_str()).await?;
    let pending = pending_rows(&storage, &load.source_table)
        .await
        .wrap_err_with(|| format!("cannot read source table {}", load.source_table))?;
    let backlog = select_backlog(&storage, stale_cutoff(today, enrich.stale_after_days)).await?;
    let records = storage.count_enrichment_records().await?;
    let usage = storage.api_usage_entry(today).await?;

    println!();
    println!("  Source:        {}", load.source_table);
    match log {
        Some(entry) => println!(
            "  Watermark:     {} ({} rows last run)",
            entry.last_ingested_at.format("%Y-%m-%d %H:%M:%S"),
            entry.record_count
        ),
        None => println!("  Watermark:     never loaded"),
    }
    println!("  Pending rows:  {pending}");
    println!("  Backlog:       {}", backlog.len());
    println!("  Enriched:      {records}");
    match usage {
        Some(entry) => println!(
            "  API usage:     {} requests today ({})",
            entry.request_count, entry.date
        ),
        None => println!("  API usage:     no requests today ({today})"),
    }
    println!();

    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Enrichment progress bar using indicatif.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{pos}/{len}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl EnrichmentProgress for CliProgress {
    fn started(&self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_message("Fetching metadata");
    }

    fn completed(&self, key: &str, state: EntityState) {
        self.bar.inc(1);
        let mark = match state {
            EntityState::Succeeded => "ok",
            EntityState::Failed => "failed",
            EntityState::Skipped => "skipped",
        };
        self.bar.set_message(format!("{key} ({mark})"));
    }

    fn quota_exhausted(&self) {
        self.bar.set_message("API request limit reached, finishing in-flight requests");
    }
}
