//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use newsdigest_core::pipeline::{Pipeline, PipelineStage, ProgressReporter, RunOutcome, RunReport};
use newsdigest_core::{ScoringEngine, TextCache, TfIdfKMeans, summarizer};
use newsdigest_crawler::NewsFetcher;
use newsdigest_shared::{
    AppConfig, ArchivedItem, IntegrityReport, Validator, init_config, load_config,
    load_config_from,
};
use newsdigest_storage::{ArchiveStore, StagingStore};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// newsdigest: a ranked digest of the day's marketing news.
#[derive(Parser)]
#[command(
    name = "newsdigest",
    version,
    about = "Collect, summarize, cluster and rank marketing news into a top-N digest.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file to use instead of ~/.newsdigest/newsdigest.toml.
    #[arg(long, global = true, env = "NEWSDIGEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
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
    /// Execute one full digest run.
    Run {
        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show archive statistics.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// List the most recently posted items.
    Latest {
        /// Number of items to list.
        #[arg(short, long, default_value_t = 15)]
        limit: usize,

        /// Only items of this cluster.
        #[arg(long)]
        cluster: Option<i64>,

        #[arg(long)]
        json: bool,
    },

    /// List items selected between two dates, posted or archived.
    History {
        /// First day, inclusive (YYYY-MM-DD). Defaults to a week ago.
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Last day, inclusive (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        to: Option<NaiveDate>,

        #[arg(short, long, default_value_t = 100)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Search titles and summaries of every archived item.
    Search {
        /// Text to look for.
        term: String,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Show one posted item.
    Show {
        /// Archive id of the item.
        id: i64,
    },

    /// Run the store integrity check without starting a run.
    Check,

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
        0 => "newsdigest=info",
        1 => "newsdigest=debug",
        _ => "newsdigest=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

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
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run { json } => cmd_run(config_path, json).await,
        Command::Status { json } => cmd_status(config_path, json).await,
        Command::Latest {
            limit,
            cluster,
            json,
        } => cmd_latest(config_path, limit, cluster, json).await,
        Command::History {
            from,
            to,
            limit,
            json,
        } => cmd_history(config_path, from, to, limit, json).await,
        Command::Search { term, limit, json } => cmd_search(config_path, &term, limit, json).await,
        Command::Show { id } => cmd_show(config_path, id).await,
        Command::Check => cmd_check(config_path).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    };
    Ok(config)
}

fn validator(config: &AppConfig) -> Validator {
    Validator::new(config.validation.clone(), config.pipeline.cluster_count)
}

async fn open_archive_readonly(config: &AppConfig) -> Result<ArchiveStore> {
    let path = Path::new(&config.storage.archive_path);
    ArchiveStore::open_readonly(path, validator(config))
        .await
        .map_err(|e| eyre!("{e} (has `newsdigest run` been executed yet?)"))
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = resolve_config(config_path)?;
    let validator = validator(&config);

    let staging = StagingStore::open(Path::new(&config.storage.staging_path), validator.clone())
        .await?
        .with_purge_retry(
            config.storage.purge_retries,
            Duration::from_millis(config.storage.purge_retry_delay_ms),
        );
    let archive = ArchiveStore::open(Path::new(&config.storage.archive_path), validator).await?;

    let fetcher = NewsFetcher::new(&config.http, &config.sources)?;
    let clusterer = TfIdfKMeans::from_config(&config.pipeline);
    let scoring = ScoringEngine::new(&config.scoring)?;
    let cache = TextCache::new();
    let mut summarizer = summarizer::from_config(&config.summarizer)?;

    info!(
        sources = fetcher.registry().len(),
        top_n = config.pipeline.top_n,
        summarizer = summarizer.name(),
        "starting run"
    );

    let pipeline = Pipeline {
        config: &config,
        staging: &staging,
        archive: &archive,
        cache: &cache,
        collector: &fetcher,
        extractor: &fetcher,
        clusterer: &clusterer,
        scoring: &scoring,
    };

    let progress = CliProgress::new();
    let report = pipeline.run(summarizer.as_mut(), &progress).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_run_report(&report, &config);
    }

    match report.outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Aborted { stage, reason } => Err(eyre!("run aborted at {stage}: {reason}")),
    }
}

fn print_run_report(report: &RunReport, config: &AppConfig) {
    println!();
    match &report.outcome {
        RunOutcome::Completed => println!("  Run completed."),
        RunOutcome::Aborted { stage, .. } => println!("  Run aborted during {stage}."),
    }
    println!("  Run:        {}", report.run_id);
    println!("  Collected:  {} ({} staged)", report.collected, report.staged);
    println!("  Extracted:  {}", report.extracted);
    println!(
        "  Summarized: {} ({} failed)",
        report.summarized, report.summary_failures
    );
    println!("  Clustered:  {}", report.clustered);
    for (&cluster, &size) in &report.cluster_sizes {
        let relevance = report
            .cluster_relevance
            .get(&cluster)
            .map(|m| format!(", mean relevance {m:.1}"))
            .unwrap_or_default();
        println!(
            "    {:<8} {size} items{relevance}",
            config.pipeline.cluster_label(cluster)
        );
    }
    if let Some(promotion) = &report.promotion {
        println!(
            "  Selected:   {} ({} new, {} re-selected, {} demoted, {} failed)",
            report.selected,
            promotion.new,
            promotion.reselected,
            promotion.demoted,
            promotion.failed
        );
    }
    if let Some(stats) = &report.archive {
        println!("  Archive:    {} total, {} posted", stats.total, stats.posted);
    }
    println!(
        "  Issues:     {} errors, {} warnings",
        report.errors.errors, report.errors.warnings
    );
    println!("  Time:       {:.1}s", report.elapsed.as_secs_f64());
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .expect("static progress template")
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

fn stage_message(stage: PipelineStage) -> &'static str {
    match stage {
        PipelineStage::PreflightCheck => "Checking stores",
        PipelineStage::Collecting => "Collecting headlines",
        PipelineStage::Extracting => "Extracting articles",
        PipelineStage::Summarizing => "Summarizing",
        PipelineStage::Clustering => "Clustering topics",
        PipelineStage::Selecting => "Selecting top stories",
        PipelineStage::Cleanup => "Cleaning up",
        PipelineStage::Done => "Done",
    }
}

impl ProgressReporter for CliProgress {
    fn stage(&self, stage: PipelineStage) {
        self.spinner.set_message(stage_message(stage));
    }

    fn item_done(&self, stage: PipelineStage, current: usize, total: usize) {
        self.spinner
            .set_message(format!("{} [{current}/{total}]", stage_message(stage)));
    }

    fn done(&self, _report: &RunReport) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// Read-only commands
// ---------------------------------------------------------------------------

async fn cmd_status(config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = resolve_config(config_path)?;
    let archive = open_archive_readonly(&config).await?;
    let stats = archive.stats().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!();
    println!("  Archive:      {}", config.storage.archive_path);
    println!("  Total:        {}", stats.total);
    println!("  Posted:       {}", stats.posted);
    println!("  Archived:     {}", stats.archived);
    println!("  Last 7 days:  {}", stats.selected_last_7_days);
    println!("  Last 30 days: {}", stats.selected_last_30_days);
    if !stats.by_cluster.is_empty() {
        println!("  By cluster:");
        for (&cluster, count) in &stats.by_cluster {
            println!("    {:<8} {count}", config.pipeline.cluster_label(cluster));
        }
    }
    println!();
    Ok(())
}

async fn cmd_latest(
    config_path: Option<&Path>,
    limit: usize,
    cluster: Option<i64>,
    json: bool,
) -> Result<()> {
    let config = resolve_config(config_path)?;
    let archive = open_archive_readonly(&config).await?;
    let items = match cluster {
        Some(cluster) => archive.posted_by_cluster(cluster, limit).await?,
        None => archive.latest_posted(limit).await?,
    };

    print_list(&items, json, "No posted items yet.")
}

async fn cmd_history(
    config_path: Option<&Path>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    limit: usize,
    json: bool,
) -> Result<()> {
    let config = resolve_config(config_path)?;
    let archive = open_archive_readonly(&config).await?;

    let today = Utc::now().date_naive();
    let to = to.unwrap_or(today);
    let from = from.unwrap_or(to - TimeDelta::days(7));
    if from > to {
        return Err(eyre!("--from {from} is after --to {to}"));
    }

    // whole days, both ends inclusive
    let start = from.and_time(NaiveTime::MIN).and_utc();
    let end = to.and_time(NaiveTime::MIN).and_utc() + TimeDelta::days(1)
        - TimeDelta::microseconds(1);
    let items = archive.selected_between(start, end, limit).await?;

    print_list(&items, json, &format!("Nothing selected between {from} and {to}."))
}

async fn cmd_search(config_path: Option<&Path>, term: &str, limit: usize, json: bool) -> Result<()> {
    let config = resolve_config(config_path)?;
    let archive = open_archive_readonly(&config).await?;
    let items = archive.search(term, limit).await?;

    print_list(&items, json, &format!("No items match '{term}'."))
}

fn print_list(items: &[ArchivedItem], json: bool, empty: &str) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("{empty}");
        return Ok(());
    }
    for item in items {
        let score = item.score.map(|s| format!("{s:>3.0}")).unwrap_or_else(|| "  -".into());
        println!(
            "{:>5}  {score}  {:<8}  {}  {:<18}  {}",
            item.id,
            item.status.as_str(),
            item.selected_at.format("%Y-%m-%d"),
            item.source,
            item.title
        );
    }
    Ok(())
}

async fn cmd_show(config_path: Option<&Path>, id: i64) -> Result<()> {
    let config = resolve_config(config_path)?;
    let archive = open_archive_readonly(&config).await?;
    let item = archive
        .get_posted(id)
        .await?
        .ok_or_else(|| eyre!("no posted item with id {id}"))?;

    print_item(&item, &config);
    Ok(())
}

fn print_item(item: &ArchivedItem, config: &AppConfig) {
    println!();
    println!("  {}", item.title);
    println!();
    println!("  Source:   {}", item.source);
    println!("  Link:     {}", item.link);
    if let Some(image) = &item.image {
        println!("  Image:    {image}");
    }
    println!("  Topic:    {}", config.pipeline.cluster_label(item.cluster));
    if let Some(score) = item.score {
        println!("  Score:    {score:.0}");
    }
    println!("  Selected: {}", item.selected_at.format("%Y-%m-%d %H:%M UTC"));
    println!();
    println!("  {}", item.summary);
    println!();
}

async fn cmd_check(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let validator = validator(&config);
    let mut report = IntegrityReport::default();

    let staging_path = Path::new(&config.storage.staging_path);
    if staging_path.exists() {
        let staging = StagingStore::open(staging_path, validator.clone()).await?;
        report.merge(staging.integrity_check().await);
    } else {
        report
            .warnings
            .push(format!("staging database {} does not exist yet", staging_path.display()));
    }

    let archive_path = Path::new(&config.storage.archive_path);
    if archive_path.exists() {
        let archive = ArchiveStore::open_readonly(archive_path, validator).await?;
        report.merge(archive.integrity_check().await);
    } else {
        report
            .warnings
            .push(format!("archive database {} does not exist yet", archive_path.display()));
    }

    for warning in &report.warnings {
        println!("  warning: {warning}");
    }
    for error in &report.errors {
        println!("  error:   {error}");
    }

    if report.is_ok() {
        println!("Integrity check passed.");
        Ok(())
    } else {
        Err(eyre!("integrity check found {} problem(s)", report.errors.len()))
    }
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
