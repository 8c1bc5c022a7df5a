//! CLI binary for pagewise.
//!
//! A thin shim over [`pagewise::JobManager`]: each subcommand maps to one
//! manager operation. `convert` and `retry` stay in the foreground until the
//! run finishes, since a background task does not outlive the process.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use pagewise::pipeline::input::fetch_document;
use pagewise::{
    JobId, JobManager, JobSnapshot, JobStatus, NewJob, PageRange, RetryPlan, Settings,
    SettingsOverride, StartedJob,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
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

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert a local file, Markdown to stdout
  pagewise convert scan.pdf

  # Pages 3 to 10 only, written to a file
  pagewise convert --first-page 3 --last-page 10 report.pdf -o report.md

  # Convert from URL with Gemini
  pagewise --backend gemini convert https://arxiv.org/pdf/1706.03762

  # Re-run only the failed pages of a finished job
  pagewise retry 5f0c6a3e-...

  # Job history, filtered by filename
  pagewise list invoice

  # Persist a backend override for later runs
  pagewise settings set --backend gemini --gemini-model gemini-2.5-pro

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  GEMINI_API_KEY          Google Gemini API key
  VISION_BACKEND          Default backend: openai | gemini
  OPENAI_VISION_MODEL     Model for the openai backend (default gpt-4o-mini)
  GEMINI_VISION_MODEL     Model for the gemini backend (default gemini-2.0-flash)
  VISION_MAX_WORKERS      Concurrent page calls per job (default 4)
  MAX_PDF_PAGES           Page ceiling per job (default 100)
  MAX_PDF_SIZE_MB         Upload limit in MB (default 50)
  PAGEWISE_DATA_DIR       Job records, uploads and outputs (default ./pagewise-data)
  PDFIUM_LIB_PATH         Path to libpdfium; otherwise ./ then the system library
"#;

/// Page-level PDF-to-Markdown transcription jobs using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "pagewise",
    version,
    about = "Page-level PDF-to-Markdown transcription jobs using Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Directory holding job records, uploads and outputs.
    #[arg(long, global = true, env = "PAGEWISE_DATA_DIR", default_value = "./pagewise-data")]
    data_dir: PathBuf,

    /// Vision backend: openai or gemini.
    #[arg(long, global = true, env = "VISION_BACKEND", default_value = "openai")]
    backend: String,

    /// Model used by the openai backend.
    #[arg(long, global = true, env = "OPENAI_VISION_MODEL", default_value = pagewise::config::DEFAULT_OPENAI_MODEL)]
    openai_model: String,

    /// Model used by the gemini backend.
    #[arg(long, global = true, env = "GEMINI_VISION_MODEL", default_value = pagewise::config::DEFAULT_GEMINI_MODEL)]
    gemini_model: String,

    /// Concurrent page transcriptions per job.
    #[arg(short, long, global = true, env = "VISION_MAX_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Page ceiling per job.
    #[arg(long, global = true, env = "MAX_PDF_PAGES", default_value_t = 100)]
    max_pages: usize,

    /// Upload limit in megabytes.
    #[arg(long, global = true, env = "MAX_PDF_SIZE_MB", default_value_t = 50)]
    max_size_mb: usize,

    /// Per-call timeout in seconds (no timeout when unset).
    #[arg(long, global = true, env = "PAGEWISE_CALL_TIMEOUT")]
    call_timeout: Option<u64>,

    /// Provider retries per page call.
    #[arg(long, global = true, env = "PAGEWISE_MAX_RETRIES", default_value_t = 0)]
    max_retries: u32,

    /// Clean up model output (code fences, blank lines, invisible characters).
    #[arg(long, global = true, env = "PAGEWISE_CLEAN_MARKDOWN")]
    clean: bool,

    /// PDF user password for encrypted documents.
    #[arg(long, global = true, env = "PAGEWISE_PDF_PASSWORD")]
    password: Option<String>,

    /// Path to the pdfium shared library.
    #[arg(long, global = true, env = "PDFIUM_LIB_PATH")]
    pdfium_lib: Option<PathBuf>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a local PDF or URL and wait for the result.
    Convert(ConvertArgs),
    /// Show a job's status.
    Status {
        id: JobId,
        /// Print the full job record as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Retry a finished job (failed pages only when possible) and wait.
    Retry {
        id: JobId,
        /// Write the Markdown here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        no_progress: bool,
    },
    /// List jobs, newest first.
    List {
        /// Case-insensitive filename filter.
        query: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Delete jobs and their files.
    Delete {
        #[arg(required = true)]
        ids: Vec<JobId>,
    },
    /// Delete jobs older than N days.
    Cleanup {
        #[arg(long, default_value_t = 30)]
        days: u32,
        #[arg(long)]
        dry_run: bool,
    },
    /// Mark jobs stuck in `pending` or `processing` as failed so they can be retried.
    ResetStuck {
        /// Job ids; all unfinished jobs when omitted.
        ids: Vec<JobId>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Save a job's Markdown (or its source PDF).
    Download {
        id: JobId,
        /// Download the original PDF instead of the Markdown.
        #[arg(long)]
        source: bool,
        /// Output path; defaults to the stored filename.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show or change the persisted settings override.
    #[command(subcommand)]
    Settings(SettingsCommand),
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Write Markdown to this file instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Transcription prompt.
    #[arg(long, conflicts_with = "prompt_file")]
    prompt: Option<String>,

    /// Read the transcription prompt from a file.
    #[arg(long)]
    prompt_file: Option<PathBuf>,

    /// First page (1-based).
    #[arg(long, default_value_t = 1)]
    first_page: usize,

    /// Last page (0 = last page of the document).
    #[arg(long, default_value_t = 0)]
    last_page: usize,

    /// HTTP download timeout in seconds.
    #[arg(long, default_value_t = 120)]
    download_timeout: u64,

    /// Disable progress bar.
    #[arg(long)]
    no_progress: bool,
}

#[derive(Subcommand, Debug)]
enum SettingsCommand {
    /// Print static, override and effective settings.
    Show,
    /// Update the override; omitted fields keep their stored value.
    Set {
        #[arg(long)]
        backend: Option<String>,
        #[arg(long)]
        openai_model: Option<String>,
        #[arg(long)]
        gemini_model: Option<String>,
    },
    /// Remove every override field.
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let g = &cli.global;

    // ── Logging setup ────────────────────────────────────────────────────
    // Library INFO logs would fight the progress bar, so only errors show
    // unless --verbose is given.
    let filter = if g.verbose {
        "debug"
    } else if g.quiet || follows_progress(&cli.command) {
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

    let settings = build_settings(g)?;
    let manager = JobManager::open(settings, &g.data_dir)
        .with_context(|| format!("Failed to open data directory {}", g.data_dir.display()))?;

    match &cli.command {
        Command::Convert(args) => convert(&manager, g, args).await,
        Command::Status { id, json } => {
            if *json {
                let job = manager.job(*id).await?;
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                print_snapshot(&manager.status(*id).await?);
            }
            Ok(())
        }
        Command::Retry {
            id,
            output,
            no_progress,
        } => {
            let outcome = manager.retry(*id).await.context("Retry failed")?;
            if !g.quiet {
                match outcome.plan {
                    RetryPlan::FailedPagesOnly => {
                        eprintln!("{} Retrying failed pages of {}", cyan("◆"), id)
                    }
                    RetryPlan::NewJob => eprintln!(
                        "{} Started new job {} from {}",
                        cyan("◆"),
                        bold(&outcome.job.id.to_string()),
                        id
                    ),
                }
            }
            let show = !g.quiet && !*no_progress;
            let snapshot = follow(&manager, outcome.job, show).await?;
            finish(&manager, &snapshot, output.as_ref(), g.quiet).await
        }
        Command::List { query, json } => {
            let jobs = manager.list_jobs(query.as_deref()).await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
                return Ok(());
            }
            for job in &jobs {
                let pages = job
                    .page_count
                    .map(|n| format!("{}/{}", job.pages_processed, n))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {:<16}  {:>7}  {}  {}",
                    job.id,
                    status_label(job.status),
                    pages,
                    dim(&job.created_at.format("%Y-%m-%d %H:%M").to_string()),
                    job.original_filename
                );
            }
            if !g.quiet {
                eprintln!("{} job(s)", jobs.len());
            }
            Ok(())
        }
        Command::Delete { ids } => {
            let removed = manager.delete_jobs(ids).await?;
            for id in ids.iter().filter(|id| !removed.contains(id)) {
                eprintln!("{} {} not found", red("✗"), id);
            }
            eprintln!("{} Deleted {} job(s)", green("✔"), removed.len());
            Ok(())
        }
        Command::Cleanup { days, dry_run } => {
            let jobs = manager.cleanup_older_than(*days, *dry_run).await?;
            for job in &jobs {
                println!("{}  {}  {}", job.id, job.created_at.format("%Y-%m-%d"), job.original_filename);
            }
            let verb = if *dry_run { "Would delete" } else { "Deleted" };
            eprintln!("{verb} {} job(s) older than {} day(s)", jobs.len(), days);
            Ok(())
        }
        Command::ResetStuck { ids, dry_run } => {
            let report = manager.reset_stuck(ids, *dry_run).await?;
            for id in &report.not_found {
                eprintln!("{} {} not found", red("✗"), id);
            }
            for id in &report.not_stuck {
                eprintln!("{} {} already finished", dim("·"), id);
            }
            let verb = if *dry_run { "Would reset" } else { "Reset" };
            for id in &report.reset {
                println!("{verb} {id}");
            }
            eprintln!("{verb} {} job(s)", report.reset.len());
            Ok(())
        }
        Command::Download { id, source, output } => {
            let artifact = if *source {
                manager.source_document(*id).await?
            } else {
                manager.markdown(*id).await?
            };
            let path = output
                .clone()
                .unwrap_or_else(|| PathBuf::from(&artifact.filename));
            tokio::fs::write(&path, &artifact.bytes)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("{} {}", green("✔"), bold(&path.display().to_string()));
            Ok(())
        }
        Command::Settings(cmd) => settings_command(&manager, cmd).await,
    }
}

fn follows_progress(command: &Command) -> bool {
    match command {
        Command::Convert(args) => !args.no_progress,
        Command::Retry { no_progress, .. } => !no_progress,
        _ => false,
    }
}

/// Map global CLI args to `Settings`.
fn build_settings(g: &GlobalArgs) -> Result<Settings> {
    let mut builder = Settings::builder()
        .backend(&g.backend)
        .openai_model(&g.openai_model)
        .gemini_model(&g.gemini_model)
        .max_workers(g.workers)
        .max_pages(g.max_pages)
        .max_upload_bytes(g.max_size_mb.saturating_mul(1024 * 1024))
        .max_retries(g.max_retries)
        .clean_markdown(g.clean);
    if let Some(secs) = g.call_timeout {
        builder = builder.call_timeout_secs(secs);
    }
    if let Some(ref pwd) = g.password {
        builder = builder.password(pwd);
    }
    if let Some(ref lib) = g.pdfium_lib {
        builder = builder.pdfium_library(lib);
    }
    builder.build().context("Invalid configuration")
}

async fn convert(manager: &JobManager, g: &GlobalArgs, args: &ConvertArgs) -> Result<()> {
    let prompt = match (&args.prompt, &args.prompt_file) {
        (Some(p), _) => Some(p.clone()),
        (None, Some(path)) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read prompt from {:?}", path))?,
        ),
        (None, None) => None,
    };

    let doc = fetch_document(&args.input, args.download_timeout)
        .await
        .with_context(|| format!("Cannot read {}", args.input))?;

    let mut job = NewJob::new(doc.filename, doc.bytes)
        .page_range(PageRange::new(args.first_page, args.last_page));
    if let Some(p) = prompt {
        job = job.prompt(p);
    }

    let started = manager.create_job(job).await.context("Failed to create job")?;
    if !g.quiet {
        eprintln!("{} Job {}", cyan("◆"), bold(&started.id.to_string()));
    }

    let snapshot = follow(manager, started, !g.quiet && !args.no_progress).await?;
    finish(manager, &snapshot, args.output.as_ref(), g.quiet).await
}

/// Wait for a run, redrawing a progress bar from the polled status.
async fn follow(manager: &JobManager, started: StartedJob, show_progress: bool) -> Result<JobSnapshot> {
    let id = started.id;
    let mut handle = started.into_handle();
    let bar = show_progress.then(new_bar);
    let mut tick = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            res = &mut handle => {
                res.context("Job run aborted")?;
                break;
            }
            _ = tick.tick() => {
                if let Some(bar) = &bar {
                    update_bar(bar, &manager.status(id).await?);
                }
            }
        }
    }

    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    manager.status(id).await.context("Failed to read job status")
}

fn new_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
    bar.set_style(style);
    bar.set_prefix("Preparing");
    bar.set_message("Rendering pages…");
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

fn update_bar(bar: &ProgressBar, snapshot: &JobSnapshot) {
    let Some(total) = snapshot.total_pages else {
        return;
    };
    if bar.length() != Some(total as u64) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_length(total as u64);
        bar.set_style(style);
        bar.set_prefix("Transcribing");
        bar.reset_eta();
    }
    bar.set_position(snapshot.pages_processed as u64);
}

/// Report the outcome and write the Markdown when there is one.
async fn finish(
    manager: &JobManager,
    snapshot: &JobSnapshot,
    output: Option<&PathBuf>,
    quiet: bool,
) -> Result<()> {
    if snapshot.status == JobStatus::Failed {
        bail!(
            "Job {} failed: {}",
            snapshot.id,
            snapshot.error_message.as_deref().unwrap_or("unknown error")
        );
    }

    let artifact = manager.markdown(snapshot.id).await?;
    match output {
        Some(path) => {
            tokio::fs::write(path, &artifact.bytes)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(&artifact.bytes)
                .context("Failed to write to stdout")?;
            if !artifact.bytes.ends_with(b"\n") {
                handle.write_all(b"\n").ok();
            }
        }
    }

    if !quiet {
        let job = manager.job(snapshot.id).await?;
        let total = job.page_count.unwrap_or(0);
        let failed = job.failed_pages.len();
        eprintln!(
            "{}  {}/{} pages  {:.1}s{}",
            if failed == 0 { green("✔") } else { cyan("⚠") },
            total - failed.min(total),
            total,
            job.processing_time_secs.unwrap_or_default(),
            output
                .map(|p| format!("  →  {}", bold(&p.display().to_string())))
                .unwrap_or_default(),
        );
        for f in &job.failed_pages {
            eprintln!("  {} Page {:>3}  {}", red("✗"), f.page, red(&f.error));
        }
        if failed > 0 {
            eprintln!("  {}", dim(&format!("pagewise retry {}", job.id)));
        }
    }
    Ok(())
}

fn status_label(status: JobStatus) -> String {
    let s = format!("{:<16}", status.as_str());
    match status {
        JobStatus::Success => green(&s),
        JobStatus::PartialSuccess => cyan(&s),
        JobStatus::Failed => red(&s),
        JobStatus::Pending | JobStatus::Processing => dim(&s),
    }
}

fn print_snapshot(s: &JobSnapshot) {
    println!("Job:          {}", s.id);
    println!("Status:       {}", status_label(s.status));
    match s.total_pages {
        Some(total) => println!("Pages:        {}/{}", s.pages_processed, total),
        None => println!("Pages:        {}/?", s.pages_processed),
    }
    if let Some(ref e) = s.error_message {
        println!("Error:        {}", red(e));
    }
}

async fn settings_command(manager: &JobManager, cmd: &SettingsCommand) -> Result<()> {
    match cmd {
        SettingsCommand::Show => {
            let s = manager.settings();
            let record = manager.settings_override().await?.unwrap_or_default();
            let effective = manager.effective_config().await?;
            let or_dash = |v: &str| if v.is_empty() { "-".to_string() } else { v.to_string() };

            println!("{}", bold("Static"));
            println!("  backend:       {}", s.backend);
            println!("  openai_model:  {}", s.openai_model);
            println!("  gemini_model:  {}", s.gemini_model);
            println!("  workers:       {}", s.max_workers);
            println!("  max_pages:     {}", s.max_pages);
            println!("{}", bold("Override"));
            println!("  backend:       {}", or_dash(&record.backend));
            println!("  openai_model:  {}", or_dash(&record.openai_model));
            println!("  gemini_model:  {}", or_dash(&record.gemini_model));
            println!("{}", bold("Effective"));
            println!("  backend:       {}", effective.backend_key);
            println!("  model:         {}", effective.model());
            Ok(())
        }
        SettingsCommand::Set {
            backend,
            openai_model,
            gemini_model,
        } => {
            let mut record = manager.settings_override().await?.unwrap_or_default();
            if let Some(b) = backend {
                record.backend = b.trim().to_lowercase();
            }
            if let Some(m) = openai_model {
                record.openai_model = m.trim().to_string();
            }
            if let Some(m) = gemini_model {
                record.gemini_model = m.trim().to_string();
            }
            manager
                .save_settings_override(&record)
                .await
                .context("Failed to save settings")?;
            eprintln!("{} Settings saved", green("✔"));
            Ok(())
        }
        SettingsCommand::Clear => {
            manager
                .save_settings_override(&SettingsOverride::default())
                .await?;
            eprintln!("{} Settings override cleared", green("✔"));
            Ok(())
        }
    }
}
