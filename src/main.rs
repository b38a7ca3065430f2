use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use probe_pool::config::{PoolConfig, RetryConfig, RunConfig};
use probe_pool::dashboard::{report_progress, run_dashboard, DashboardState};
use probe_pool::joblist::JobList;
use probe_pool::shutdown::install_shutdown_handler;
use probe_pool::store::{Job, JobCounts, JobStore, SqliteJobStore};
use probe_pool::worker::{truncate, HttpExecutor, RunSummary, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "probe-pool")]
#[command(version)]
#[command(about = "Run a list of HTTP checks on a pool of workers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Probe every URL in a job list
    Run(RunArgs),

    /// Show jobs stored in a job database
    Status(StatusArgs),

    /// Delete all jobs from a job database
    Clear {
        /// Job database path
        #[arg(long, default_value = "jobs.db")]
        db: PathBuf,
    },
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// JSON job list: {"jobs": [{"url": "..."}]}
    #[arg(long, short = 'j', default_value = "jobs.json")]
    jobs: PathBuf,

    /// Job database path
    #[arg(long, default_value = "jobs.db")]
    db: PathBuf,

    /// Number of concurrent workers
    #[arg(long, short = 'w', default_value = "2")]
    workers: usize,

    /// Per-probe deadline in milliseconds
    #[arg(long, default_value = "10000")]
    timeout_ms: u64,

    /// Pause between claiming a job and probing it, in milliseconds
    #[arg(long, default_value = "0")]
    pace_ms: u64,

    /// Consecutive failed claims before a worker gives up
    #[arg(long, default_value = "5")]
    claim_attempts: u32,

    /// Port for the JSON status dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Progress log interval in milliseconds
    #[arg(long, default_value = "1000")]
    report_interval_ms: u64,

    /// Keep jobs in the database after the run completes
    #[arg(long)]
    keep_jobs: bool,

    /// Continue an interrupted run instead of loading the job list again
    #[arg(long)]
    resume: bool,

    /// Output format for the final report
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Parser, Debug)]
struct StatusArgs {
    /// Job database path
    #[arg(long, default_value = "jobs.db")]
    db: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

impl RunArgs {
    fn into_config(self) -> Result<(RunConfig, OutputFormat), Box<dyn std::error::Error>> {
        let dashboard_addr: Option<SocketAddr> = match self.dashboard_port {
            Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
            None => None,
        };

        let pool = PoolConfig {
            worker_count: self.workers,
            probe_timeout_ms: self.timeout_ms,
            pace_ms: self.pace_ms,
            claim_retry: RetryConfig {
                max_attempts: self.claim_attempts,
                ..RetryConfig::default()
            },
        };

        let config = RunConfig {
            jobs_file: self.jobs,
            db_path: self.db,
            pool,
            dashboard_addr,
            report_interval_ms: self.report_interval_ms,
            keep_jobs: self.keep_jobs,
            resume: self.resume,
        };
        Ok((config, self.output))
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobOutput {
    id: i64,
    url: String,
    status: String,
    result_code: Option<i32>,
    error: Option<String>,
    finished_at: Option<String>,
}

#[derive(Serialize)]
struct ReportOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    run: Option<RunSummary>,
    counts: JobCounts,
    jobs: Vec<JobOutput>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn job_output(job: &Job) -> JobOutput {
    JobOutput {
        id: job.id,
        url: job.target.clone(),
        status: job.status.to_string().to_uppercase(),
        result_code: job.result_code,
        error: job.error.clone(),
        finished_at: job
            .finished_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()),
    }
}

fn print_report(
    summary: Option<&RunSummary>,
    counts: JobCounts,
    jobs: &[Job],
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let rows: Vec<JobOutput> = jobs.iter().map(job_output).collect();

    match output_format {
        OutputFormat::Json => {
            let output = ReportOutput {
                run: summary.cloned(),
                counts,
                jobs: rows,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("No finished jobs.");
            } else {
                println!(
                    "{:<6} {:<40} {:<10} {:<6} FINISHED",
                    "ID", "URL", "STATUS", "CODE"
                );
                println!("{}", "-".repeat(84));
                for row in &rows {
                    let url = if row.url.len() > 40 {
                        truncate(&row.url, 37)
                    } else {
                        row.url.clone()
                    };
                    let code = row
                        .result_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<6} {:<40} {:<10} {:<6} {}",
                        row.id,
                        url,
                        row.status,
                        code,
                        row.finished_at.as_deref().unwrap_or("NA")
                    );
                    if let Some(error) = &row.error {
                        println!("       error: {}", error.lines().next().unwrap_or(""));
                    }
                }
            }
            println!();
            println!(
                "Pending: {}  Processing: {}  Completed: {}  Failed: {}",
                counts.pending, counts.processing, counts.completed, counts.failed
            );
            if let Some(summary) = summary {
                if summary.lanes_failed > 0 {
                    println!("{} worker(s) stopped on store errors.", summary.lanes_failed);
                }
                if !summary.drained(&counts) {
                    println!("Run did not finish; rerun with --resume to continue.");
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn prepare_jobs(
    store: &SqliteJobStore,
    config: &RunConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let existing = store.counts().await?;

    if config.resume && existing.total() > 0 {
        if existing.processing > 0 {
            tracing::warn!(
                processing = existing.processing,
                "Jobs claimed by the interrupted run stay in processing"
            );
        }
        tracing::info!(pending = existing.pending, "Resuming interrupted run");
        return Ok(());
    }

    if existing.total() > 0 {
        tracing::warn!(
            jobs = existing.total(),
            "Discarding jobs left from a previous run"
        );
        store.clear().await?;
    }

    let targets = JobList::from_path(&config.jobs_file)?.targets();
    let ids = store.enqueue(&targets).await?;
    tracing::info!(jobs = ids.len(), file = %config.jobs_file.display(), "Jobs enqueued");
    Ok(())
}

async fn run_jobs(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let (config, output_format) = args.into_config()?;
    config.pool.validate()?;

    let store = Arc::new(SqliteJobStore::open(&config.db_path)?);
    prepare_jobs(&store, &config).await?;

    let executor = Arc::new(HttpExecutor::new()?);
    let pool = WorkerPool::new(config.pool.clone(), store.clone(), executor)?;
    let completion = pool
        .take_completion()
        .ok_or("worker pool completion already taken")?;

    let cancel = install_shutdown_handler();
    let observers = cancel.child_token();
    let state = DashboardState {
        store: store.clone(),
        status: pool.status_feed(),
    };

    if let Some(addr) = config.dashboard_addr {
        let state = state.clone();
        let stop = observers.clone();
        tokio::spawn(async move {
            run_dashboard(addr, state, stop).await;
        });
    }

    let reporter = tokio::spawn(report_progress(
        state,
        config.report_interval(),
        observers.clone(),
    ));

    pool.start(cancel.clone()).await?;
    let summary = completion
        .wait()
        .await
        .ok_or("worker pool stopped without reporting")?;

    observers.cancel();
    if let Err(e) = reporter.await {
        tracing::warn!(error = %e, "Progress reporter failed");
    }

    let jobs = store.list_terminal().await?;
    let counts = store.counts().await?;
    print_report(Some(&summary), counts, &jobs, &output_format)?;

    if !summary.drained(&counts) {
        tracing::warn!(
            pending = counts.pending,
            processing = counts.processing,
            db = %config.db_path.display(),
            "Keeping unfinished jobs for --resume"
        );
    } else if !config.keep_jobs {
        store.clear().await?;
        if matches!(output_format, OutputFormat::Table) {
            println!("All jobs have been executed");
        }
    }

    Ok(())
}

async fn show_status(args: StatusArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = SqliteJobStore::open(&args.db)?;
    let jobs = store.list_terminal().await?;
    let counts = store.counts().await?;
    print_report(None, counts, &jobs, &args.output)
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => run_jobs(run_args).await?,
        Commands::Status(status_args) => show_status(status_args).await?,
        Commands::Clear { db } => {
            let store = SqliteJobStore::open(&db)?;
            store.clear().await?;
            println!("Job database cleared: {}", db.display());
        }
    }

    Ok(())
}
