//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use archivist_archive::InternetArchive;
use archivist_core::{
    ArchivePipelineConfig, ProgressReporter, RetryPolicy, StageCache, StageId,
    build_archive_graph, render_standard_topology, run_query,
};
use archivist_judge::ChatJudge;
use archivist_shared::{
    AppConfig, PipelineState, config_file_path, expand_home, init_config, load_config,
    validate_api_key,
};
use archivist_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Archivist: find and download Internet Archive documents for a query.
#[derive(Parser)]
#[command(
    name = "archivist",
    version,
    about = "Search the Internet Archive, let an LLM judge the hits, and download the right files.",
    long_about = None,
)]
pub(crate) struct Cli {
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
    /// Run the pipeline for a query and download what it finds.
    Find {
        /// Free-text search query.
        query: String,

        /// Cache key to use instead of the query.
        #[arg(long)]
        cache_key: Option<String>,

        /// Directory to download into (overrides config).
        #[arg(long)]
        download_dir: Option<String>,

        /// Snapshot cache directory (overrides config).
        #[arg(long)]
        cache_dir: Option<String>,

        /// Print the final state as JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },

    /// List recorded runs, newest first.
    History {
        /// Maximum number of runs to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Print the final state of a recorded run.
    Show {
        /// Run ID from `archivist history`.
        run_id: String,
    },

    /// Inspect or clear cached snapshots.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Print the stage graph.
    Graph,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Cache subcommands.
#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Show where the snapshot for a query lives and what it holds.
    Show {
        /// Query (or explicit cache key).
        key: String,

        /// Snapshot cache directory (overrides config).
        #[arg(long)]
        cache_dir: Option<String>,
    },
    /// Delete the snapshot for a query.
    Clear {
        /// Query (or explicit cache key).
        key: String,

        /// Snapshot cache directory (overrides config).
        #[arg(long)]
        cache_dir: Option<String>,
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
        0 => "archivist=info",
        1 => "archivist=debug",
        _ => "archivist=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Find {
            query,
            cache_key,
            download_dir,
            cache_dir,
            json,
        } => {
            cmd_find(
                &query,
                cache_key.as_deref(),
                download_dir.as_deref(),
                cache_dir.as_deref(),
                json,
            )
            .await
        }
        Command::History { limit } => cmd_history(limit).await,
        Command::Show { run_id } => cmd_show(&run_id).await,
        Command::Cache { action } => match action {
            CacheAction::Show { key, cache_dir } => cmd_cache_show(&key, cache_dir.as_deref()).await,
            CacheAction::Clear { key, cache_dir } => {
                cmd_cache_clear(&key, cache_dir.as_deref()).await
            }
        },
        Command::Graph => cmd_graph().await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn stage_cache(config: &AppConfig, override_dir: Option<&str>) -> Result<StageCache> {
    let dir = expand_home(override_dir.unwrap_or(&config.defaults.cache_dir))?;
    Ok(StageCache::with_default_file(dir))
}

/// Build the collaborators the standard graph needs from config.
fn pipeline_config(
    config: &AppConfig,
    cache: StageCache,
    download_dir: PathBuf,
) -> Result<ArchivePipelineConfig> {
    Ok(ArchivePipelineConfig {
        archive: Arc::new(InternetArchive::new(&config.archive)?),
        judge: Arc::new(ChatJudge::new(&config.judge)?),
        cache: Arc::new(cache),
        download_dir,
        max_results: config.archive.max_results,
        retry: RetryPolicy::from(&config.retry),
    })
}

fn print_summary(state: &PipelineState, run_id: Option<&str>, download_dir: &Path) {
    println!();
    println!("  Query:     {}", state.query);
    println!("  Cached:    {}", if state.is_cached() { "yes" } else { "no" });
    println!("  Results:   {}", state.results().len());
    println!("  Filtered:  {}", state.filtered_results().len());
    println!("  Relevant:  {}", state.entries_to_consider().len());

    match &state.pdfs_to_download {
        Some(pdfs) if pdfs.values().any(|files| !files.is_empty()) => {
            println!("  Files:     {}", download_dir.display());
            for (identifier, files) in pdfs {
                for file in files {
                    println!("    {identifier}/{file}");
                }
            }
        }
        _ => println!("  Files:     none"),
    }

    if !state.errors.is_empty() {
        println!("  Problems:");
        for error in &state.errors {
            println!("    - {error}");
        }
    }
    if let Some(id) = run_id {
        println!("  Run ID:    {id}");
    }
    println!();
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_find(
    query: &str,
    cache_key: Option<&str>,
    download_dir: Option<&str>,
    cache_dir: Option<&str>,
    json: bool,
) -> Result<()> {
    let config = load_config()?;
    validate_api_key(&config)?;

    let download_dir = expand_home(download_dir.unwrap_or(&config.defaults.download_dir))?;
    std::fs::create_dir_all(&download_dir)
        .map_err(|e| eyre!("cannot create download directory {}: {e}", download_dir.display()))?;

    let cache = stage_cache(&config, cache_dir)?;
    let pipeline = pipeline_config(&config, cache, download_dir.clone())?;
    let graph = build_archive_graph(&pipeline)?;

    info!(query, cache_key, "running pipeline");

    let reporter = CliProgress::new(json);
    let state = run_query(&graph, query, cache_key, &reporter).await;

    // Recording history must never change the outcome of the run.
    let database_path = expand_home(&config.defaults.database_path)?;
    let run_id = match Storage::open(&database_path).await {
        Ok(storage) => match storage.record_run(&state).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "failed to record run");
                None
            }
        },
        Err(e) => {
            warn!(error = %e, path = %database_path.display(), "run history unavailable");
            None
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        print_summary(&state, run_id.as_deref(), &download_dir);
    }

    Ok(())
}

async fn cmd_history(limit: u32) -> Result<()> {
    let config = load_config()?;
    let database_path = expand_home(&config.defaults.database_path)?;
    if !database_path.exists() {
        println!("No runs recorded yet.");
        return Ok(());
    }

    let storage = Storage::open_readonly(&database_path).await?;
    let runs = storage.list_runs(limit).await?;
    if runs.is_empty() {
        println!("No runs recorded yet.");
        return Ok(());
    }

    for run in runs {
        println!(
            "{}  {}  {:<6} results={:<3} filtered={:<3} relevant={:<3} errors={:<2} {}",
            run.id,
            run.finished_at.format("%Y-%m-%d %H:%M"),
            if run.cached { "cached" } else { "fresh" },
            run.result_count,
            run.filtered_count,
            run.entry_count,
            run.error_count,
            run.query,
        );
    }
    Ok(())
}

async fn cmd_show(run_id: &str) -> Result<()> {
    let config = load_config()?;
    let database_path = expand_home(&config.defaults.database_path)?;
    let storage = Storage::open_readonly(&database_path).await?;

    let state = storage
        .get_run(run_id)
        .await?
        .ok_or_else(|| eyre!("no run with id '{run_id}'"))?;
    println!("{}", serde_json::to_string_pretty(&state)?);

    let downloads = storage.downloads_for_run(run_id).await?;
    if !downloads.is_empty() {
        eprintln!("{} file(s) selected for download", downloads.len());
    }
    Ok(())
}

async fn cmd_cache_show(key: &str, cache_dir: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let cache = stage_cache(&config, cache_dir)?;
    let path = cache.snapshot_path(key);

    match cache.lookup(key).await {
        Some(state) => {
            println!("{}", path.display());
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        None => println!("No snapshot for '{key}' (would live at {})", path.display()),
    }
    Ok(())
}

async fn cmd_cache_clear(key: &str, cache_dir: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let cache = stage_cache(&config, cache_dir)?;

    if cache.evict(key).await? {
        println!("Removed snapshot for '{key}'");
    } else {
        println!("No snapshot for '{key}'");
    }
    Ok(())
}

async fn cmd_graph() -> Result<()> {
    print!("{}", render_standard_topology());
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("# {}", config_file_path()?.display());
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new(hidden: bool) -> Self {
        let spinner = if hidden {
            ProgressBar::hidden()
        } else {
            ProgressBar::new_spinner()
        };
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn stage_started(&self, stage: StageId) {
        self.spinner.set_message(format!("Running {stage}"));
    }

    fn stage_finished(&self, stage: StageId, state: &PipelineState, elapsed: Duration) {
        self.spinner.println(format!(
            "  {stage:<12} {:>6.1}s  errors={}",
            elapsed.as_secs_f64(),
            state.errors.len()
        ));
    }

    fn done(&self, _state: &PipelineState) {
        self.spinner.finish_and_clear();
    }
}
