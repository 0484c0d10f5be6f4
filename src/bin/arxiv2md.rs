//! CLI binary for arxiv2md.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `PipelineConfig` and prints results.

use anyhow::{bail, Context, Result};
use arxiv2md::{
    ArtifactStore, BatchReport, CacheKey, CacheStore, CancelHandle, ItemFailure, ItemIdentifier,
    ItemOutcome, ItemStage, MethodPreference, Orchestrator, PipelineConfig,
    PipelineProgressCallback, ProgressCallback, SearchQuery, SortBy, SortOrder,
};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar for the batch plus a log line per
/// finished paper. Items finish out of order, so start times are kept per id.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<String, Instant>>,
}

impl CliProgressCallback {
    /// Spinner until `on_batch_start` reports the total.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} papers  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Converting");
        self.bar.reset_eta();
    }

    fn elapsed(&self, item: &str) -> f64 {
        self.start_times
            .lock()
            .map(|mut m| m.remove(item))
            .ok()
            .flatten()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_items: usize) {
        self.activate_bar(total_items);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Converting {total_items} papers…"))
        ));
    }

    fn on_item_start(&self, item: &str) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(item.to_string(), Instant::now());
        }
        self.bar.set_message(item.to_string());
    }

    fn on_item_stage(&self, item: &str, stage: ItemStage) {
        self.bar.set_message(format!("{item} {}", dim(&stage.to_string())));
    }

    fn on_item_complete(&self, item: &str, from_cache: bool, quality: f64) {
        let secs = self.elapsed(item);
        self.bar.println(format!(
            "  {} {:<20} {}  {}{}",
            green("✓"),
            item,
            dim(&format!("quality {quality:.2}")),
            dim(&format!("{secs:.1}s")),
            if from_cache { dim("  (cached)") } else { String::new() },
        ));
        self.bar.inc(1);
    }

    fn on_item_error(&self, item: &str, failure: &ItemFailure) {
        let secs = self.elapsed(item);
        let msg = truncate(&failure.message, 80);
        self.bar.println(format!(
            "  {} {:<20} {}  {}",
            red("✗"),
            item,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total_items: usize, success_count: usize) {
        let failed = total_items.saturating_sub(success_count);
        self.bar.finish_and_clear();
        if failed == 0 {
            eprintln!(
                "{} {} papers converted successfully",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} papers converted  ({} not converted)",
                if success_count == 0 { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total_items,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # One paper to stdout
  arxiv2md convert 2301.00001

  # Several papers, four at a time, artifacts under ./papers
  arxiv2md convert --concurrency 4 --output-root papers 2301.00001 2301.00002 hep-th/9901001

  # Built-in converter only (deterministic, no pandoc)
  arxiv2md convert --method builtin 2301.00001

  # Search and print JSON
  arxiv2md search "diffusion models" --category cs.LG --max-results 20 --json

  # Housekeeping
  arxiv2md cache purge --older-than-days 30
  arxiv2md cache invalidate 2301.00001
  arxiv2md clean --older-than-days 90

EXTERNAL TOOLS:
  pandoc      LaTeX → Markdown (preferred when installed)
  pdftotext   PDF → text, for papers without source (poppler-utils)

  Both are optional: the built-in converter takes over when they are
  missing or fail.

ENVIRONMENT VARIABLES:
  Every flag can be set through ARXIV2MD_<FLAG>, e.g. ARXIV2MD_CONCURRENCY=4.
  RUST_LOG overrides the log filter.
"#;

/// Fetch arXiv papers and convert them to Markdown.
#[derive(Parser, Debug)]
#[command(
    name = "arxiv2md",
    version,
    about = "Fetch arXiv papers and convert them to Markdown",
    long_about = "Fetch arXiv papers by identifier, extract their LaTeX source (or the rendered \
PDF when no source is published) and convert them to Markdown with pandoc or the built-in \
converter. Results are cached and scored for conversion quality.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Cache directory.
    #[arg(long, global = true, env = "ARXIV2MD_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Root directory for source/markdown/metadata artifacts.
    #[arg(long, global = true, env = "ARXIV2MD_OUTPUT_ROOT")]
    output_root: Option<PathBuf>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "ARXIV2MD_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "ARXIV2MD_QUIET")]
    quiet: bool,

    /// Disable progress bar.
    #[arg(long, global = true, env = "ARXIV2MD_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert one or more papers.
    Convert(ConvertArgs),
    /// Search arXiv metadata.
    Search(SearchArgs),
    /// Inspect or prune the conversion cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Remove artifacts older than the given age.
    Clean {
        #[arg(long, env = "ARXIV2MD_OLDER_THAN_DAYS")]
        older_than_days: u64,
    },
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// arXiv identifiers or abs/pdf URLs.
    #[arg(required = true)]
    ids: Vec<String>,

    /// Papers converted at once.
    #[arg(short, long, env = "ARXIV2MD_CONCURRENCY", default_value_t = 3)]
    concurrency: usize,

    /// Conversion method: auto, tool, builtin.
    #[arg(long, env = "ARXIV2MD_METHOD", value_enum, default_value = "auto")]
    method: MethodArg,

    /// Skip the cache for reads and writes.
    #[arg(long, env = "ARXIV2MD_NO_CACHE")]
    no_cache: bool,

    /// Do not write source/markdown/metadata artifacts.
    #[arg(long, env = "ARXIV2MD_NO_ARTIFACTS")]
    no_artifacts: bool,

    /// Fetch title/authors/abstract from the arXiv API before converting.
    #[arg(long, env = "ARXIV2MD_LOOKUP_METADATA")]
    lookup_metadata: bool,

    /// Output structured JSON instead of Markdown / a summary table.
    #[arg(long, env = "ARXIV2MD_JSON")]
    json: bool,

    /// Write Markdown to stdout even for batches (input order).
    #[arg(long, env = "ARXIV2MD_STDOUT")]
    stdout: bool,

    /// Requests per second towards arXiv.
    #[arg(long, env = "ARXIV2MD_RPS", default_value_t = 2.0)]
    rps: f64,

    /// Retries per HTTP request on 5xx / timeouts.
    #[arg(long, env = "ARXIV2MD_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Timeout per external tool run, in seconds.
    #[arg(long, env = "ARXIV2MD_TOOL_TIMEOUT", default_value_t = 60)]
    tool_timeout: u64,

    /// Path to pandoc (default: search PATH).
    #[arg(long, env = "ARXIV2MD_PANDOC")]
    pandoc: Option<PathBuf>,

    /// Path to pdftotext (default: search PATH).
    #[arg(long, env = "ARXIV2MD_PDFTOTEXT")]
    pdftotext: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SearchArgs {
    /// Free text matched against titles and abstracts.
    #[arg(default_value = "")]
    query: String,

    /// Restrict to a category (repeatable), e.g. cs.LG.
    #[arg(long = "category", env = "ARXIV2MD_CATEGORY", value_delimiter = ',')]
    categories: Vec<String>,

    /// Restrict to an author (repeatable).
    #[arg(long = "author", env = "ARXIV2MD_AUTHOR", value_delimiter = ',')]
    authors: Vec<String>,

    /// Submitted on or after (YYYY-MM-DD).
    #[arg(long, env = "ARXIV2MD_FROM")]
    from: Option<NaiveDate>,

    /// Submitted on or before (YYYY-MM-DD).
    #[arg(long, env = "ARXIV2MD_TO")]
    to: Option<NaiveDate>,

    #[arg(long, env = "ARXIV2MD_MAX_RESULTS", default_value_t = 10)]
    max_results: usize,

    #[arg(long, env = "ARXIV2MD_SORT", value_enum, default_value = "relevance")]
    sort: SortArg,

    #[arg(long, env = "ARXIV2MD_ORDER", value_enum, default_value = "descending")]
    order: OrderArg,

    #[arg(long, env = "ARXIV2MD_JSON")]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Remove entries older than the given age.
    Purge {
        #[arg(long, env = "ARXIV2MD_OLDER_THAN_DAYS")]
        older_than_days: u64,
    },
    /// Remove the entries of one paper (all methods).
    Invalidate { id: String },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum MethodArg {
    Auto,
    Tool,
    Builtin,
}

impl From<MethodArg> for MethodPreference {
    fn from(v: MethodArg) -> Self {
        match v {
            MethodArg::Auto => MethodPreference::Auto,
            MethodArg::Tool => MethodPreference::ToolOnly,
            MethodArg::Builtin => MethodPreference::BuiltinOnly,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum SortArg {
    Relevance,
    Updated,
    Submitted,
}

impl From<SortArg> for SortBy {
    fn from(v: SortArg) -> Self {
        match v {
            SortArg::Relevance => SortBy::Relevance,
            SortArg::Updated => SortBy::LastUpdatedDate,
            SortArg::Submitted => SortBy::SubmittedDate,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum OrderArg {
    Ascending,
    Descending,
}

impl From<OrderArg> for SortOrder {
    fn from(v: OrderArg) -> Self {
        match v {
            OrderArg::Ascending => SortOrder::Ascending,
            OrderArg::Descending => SortOrder::Descending,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // INFO-level library logs are suppressed while the progress bar is shown.
    let json = match &cli.command {
        Command::Convert(a) => a.json,
        Command::Search(a) => a.json,
        _ => false,
    };
    let show_progress = !cli.quiet && !cli.no_progress && !json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match &cli.command {
        Command::Convert(args) => run_convert(&cli, args, show_progress).await,
        Command::Search(args) => run_search(&cli, args).await,
        Command::Cache { action } => run_cache(&cli, action).await,
        Command::Clean { older_than_days } => {
            let store = ArtifactStore::new(output_root(&cli));
            let removed = store
                .cleanup_older_than(days(*older_than_days))
                .await
                .context("Artifact cleanup failed")?;
            if !cli.quiet {
                eprintln!(
                    "{} removed {} artifact entries under {}",
                    green("✔"),
                    bold(&removed.to_string()),
                    store.root().display()
                );
            }
            Ok(())
        }
    }
}

async fn run_convert(cli: &Cli, args: &ConvertArgs, show_progress: bool) -> Result<()> {
    let progress = show_progress.then(CliProgressCallback::new_dynamic);
    let config = build_config(
        cli,
        args,
        progress.clone().map(|cb| cb as ProgressCallback),
    )?;
    let orchestrator = Orchestrator::new(config)
        .await
        .context("Failed to initialise pipeline")?;

    // ── Single paper ─────────────────────────────────────────────────────
    if let [input] = args.ids.as_slice() {
        let id = ItemIdentifier::parse(input).context("Invalid identifier")?;
        let outcome = orchestrator.process_item(&id, None).await;
        if let Some(ref cb) = progress {
            cb.finish();
        }
        let processed = outcome.with_context(|| format!("Conversion of {id} failed"))?;
        let result = &processed.result;

        if args.json {
            println!(
                "{}",
                serde_json::to_string_pretty(result).context("Failed to serialise result")?
            );
        } else {
            write_markdown(&result.markdown)?;
        }

        if !cli.quiet {
            eprintln!(
                "{}  {}  quality {:.2}  via {}{}",
                green("✔"),
                bold(id.as_str()),
                result.score(),
                result.tool.as_deref().unwrap_or("builtin"),
                if processed.from_cache {
                    dim("  (cached)")
                } else {
                    String::new()
                },
            );
            for attempt in &result.fallbacks {
                eprintln!(
                    "   {} {} {}",
                    yellow("↳"),
                    attempt.strategy,
                    dim(&attempt.detail)
                );
            }
            if let Some(artifacts) = orchestrator.artifacts() {
                if !processed.from_cache {
                    let paths = artifacts.paths(&id);
                    eprintln!("   {}", dim(&paths.markdown.display().to_string()));
                }
            }
        }
        return Ok(());
    }

    // ── Batch ────────────────────────────────────────────────────────────
    let cancel = CancelHandle::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{}", yellow("Interrupted: finishing without new papers…"));
                cancel.cancel();
            }
        });
    }

    let report = orchestrator
        .process_batch_with_cancel(args.ids.as_slice(), args.concurrency, &cancel)
        .await;
    if let Some(ref cb) = progress {
        cb.finish();
    }

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
    } else {
        if args.stdout {
            for outcome in &report.outcomes {
                if let Some(result) = outcome.outcome.result() {
                    write_markdown(&result.markdown)?;
                }
            }
        }
        if !cli.quiet {
            print_summary(&report);
        }
    }

    if report.stats.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_search(cli: &Cli, args: &SearchArgs) -> Result<()> {
    let config = PipelineConfig::builder()
        .cache_enabled(false)
        .save_artifacts(false)
        .build()
        .context("Invalid configuration")?;
    let orchestrator = Orchestrator::new(config)
        .await
        .context("Failed to initialise pipeline")?;

    let mut query = SearchQuery::new(args.query.clone())
        .submitted_between(args.from, args.to)
        .max_results(args.max_results)
        .sort(args.sort.into(), args.order.into());
    for c in &args.categories {
        query = query.category(c.clone());
    }
    for a in &args.authors {
        query = query.author(a.clone());
    }

    let response = orchestrator.search(&query).await.context("Search failed")?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&response).context("Failed to serialise results")?
        );
        return Ok(());
    }

    for record in &response.records {
        println!("{}  {}", cyan(&record.id), bold(&record.title));
        let mut authors = record.authors.iter().take(4).cloned().collect::<Vec<_>>().join(", ");
        if record.authors.len() > 4 {
            authors.push_str(", et al.");
        }
        println!(
            "    {}  {}  {}",
            authors,
            dim(record.primary_category.as_deref().unwrap_or("")),
            dim(record.published.as_deref().map(|p| p.get(..10).unwrap_or(p)).unwrap_or("")),
        );
    }
    if !cli.quiet {
        eprintln!(
            "{}",
            dim(&format!(
                "{} of {} results",
                response.records.len(),
                response.total_results
            ))
        );
    }
    Ok(())
}

async fn run_cache(cli: &Cli, action: &CacheAction) -> Result<()> {
    let dir = cache_dir(cli);
    let cache = CacheStore::open(&dir)
        .await
        .with_context(|| format!("Failed to open cache at {}", dir.display()))?;

    match action {
        CacheAction::Purge { older_than_days } => {
            let removed = cache
                .purge_older_than(days(*older_than_days))
                .await
                .context("Cache purge failed")?;
            if !cli.quiet {
                eprintln!(
                    "{} purged {} entries, {} remain",
                    green("✔"),
                    bold(&removed.to_string()),
                    cache.len()
                );
            }
        }
        CacheAction::Invalidate { id } => {
            let id = ItemIdentifier::parse(id).context("Invalid identifier")?;
            let mut removed = 0;
            for method in [
                MethodPreference::Auto,
                MethodPreference::ToolOnly,
                MethodPreference::BuiltinOnly,
            ] {
                if cache
                    .invalidate(&CacheKey::for_method(&id, method))
                    .await
                    .context("Cache invalidation failed")?
                {
                    removed += 1;
                }
            }
            if removed == 0 {
                bail!("no cache entry for {id}");
            }
            if !cli.quiet {
                eprintln!("{} invalidated {} entries for {}", green("✔"), removed, bold(id.as_str()));
            }
        }
    }
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(
    cli: &Cli,
    args: &ConvertArgs,
    progress: Option<ProgressCallback>,
) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .concurrency(args.concurrency)
        .method(args.method.into())
        .cache_enabled(!args.no_cache)
        .save_artifacts(!args.no_artifacts)
        .lookup_metadata(args.lookup_metadata)
        .requests_per_second(args.rps)
        .max_retries(args.max_retries)
        .tool_timeout_secs(args.tool_timeout)
        .cache_dir(cache_dir(cli))
        .output_root(output_root(cli));

    if let Some(ref p) = args.pandoc {
        builder = builder.pandoc_path(p);
    }
    if let Some(ref p) = args.pdftotext {
        builder = builder.pdftotext_path(p);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

fn cache_dir(cli: &Cli) -> PathBuf {
    cli.cache_dir
        .clone()
        .unwrap_or_else(|| PipelineConfig::default().cache_dir)
}

fn output_root(cli: &Cli) -> PathBuf {
    cli.output_root
        .clone()
        .unwrap_or_else(|| PipelineConfig::default().output_root)
}

fn days(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(24 * 60 * 60))
}

fn write_markdown(markdown: &str) -> Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    handle
        .write_all(markdown.as_bytes())
        .context("Failed to write to stdout")?;
    if !markdown.ends_with('\n') {
        handle.write_all(b"\n").ok();
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max - 1).collect();
        format!("{cut}\u{2026}")
    } else {
        s.to_string()
    }
}

fn print_summary(report: &BatchReport) {
    eprintln!();
    // Bold adds 8 invisible bytes per header cell.
    eprintln!(
        "  {:>11}  {:<32} {:<18} {:>15}  {}",
        bold("#"),
        bold("paper"),
        bold("status"),
        bold("quality"),
        bold("detail")
    );
    for o in &report.outcomes {
        let (status, quality, detail) = match &o.outcome {
            ItemOutcome::Converted { result, from_cache } => (
                green(if *from_cache { "cached" } else { "converted" }),
                format!("{:.2}", result.score()),
                result.tool.clone().unwrap_or_else(|| result.method.to_string()),
            ),
            ItemOutcome::Failed(f) => (red("failed"), "-".into(), truncate(&f.message, 60)),
            ItemOutcome::Skipped { reason } => (yellow("skipped"), "-".into(), reason.clone()),
            ItemOutcome::Cancelled => (dim("cancelled"), "-".into(), String::new()),
        };
        // Colour codes add 9 bytes; pad the visible width.
        eprintln!(
            "  {:>3}  {:<24} {:<19} {:>7}  {}",
            o.index,
            truncate(&o.input, 24),
            status,
            quality,
            dim(&detail)
        );
    }
    let s = &report.stats;
    eprintln!(
        "\n  {} converted ({} cached), {} failed, {} skipped, {} cancelled  {}",
        s.converted,
        s.from_cache,
        s.failed,
        s.skipped,
        s.cancelled,
        dim(&format!("{}ms", s.duration_ms))
    );
}
