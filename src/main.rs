//! scatter CLI - distributed test scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use scatter::cluster::process::ProcessExecutor;
use scatter::config::{self, DistributedConfig, JobConfig};
use scatter::report::TestResultLog;
use scatter::resource::ResourceManager;
use scatter::scheduler::{RunError, TestScheduler};

#[derive(Parser)]
#[command(name = "scatter")]
#[command(about = "Distributed test scheduler for container clusters", long_about = None)]
#[command(version)]
struct Cli {
    /// Job file path
    #[arg(short, long, default_value = "scatter.toml")]
    job: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the job
    Run {
        /// Suppress the result-record JSON line
        #[arg(long)]
        no_result_log: bool,
    },

    /// Validate the job file
    Validate,

    /// Initialize a new job file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { no_result_log } => run_job(&cli.job, no_result_log).await,
        Commands::Validate => validate_job(&cli.job),
        Commands::Init => init_job(),
    }
}

async fn run_job(job_path: &Path, no_result_log: bool) -> Result<()> {
    let job = config::load_job(job_path)
        .with_context(|| format!("Failed to load job from {}", job_path.display()))?;
    job.validate()?;

    info!("Loaded job {} from {}", job.name, job_path.display());

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight pods");
            ctrl_c_cancel.cancel();
        }
    });

    let executor = Arc::new(ProcessExecutor::new());
    let mut scheduler = TestScheduler::new(executor);
    if no_result_log {
        scheduler = scheduler.without_result_log();
    }

    // Resources are torn down regardless of how setup or the run ended.
    let resources = ResourceManager::for_job(&job);
    let outcome = run_with_resources(&scheduler, &job, &resources, &cancel).await;
    if let Err(err) = resources.cleanup() {
        warn!("Resource cleanup failed: {}", err);
    }

    match outcome? {
        Ok(report) => {
            info!(
                "Job {} succeeded with {} test(s) in {}s",
                report.job,
                report.details.tests.len(),
                report.elapsed_sec
            );
            Ok(())
        }
        Err(RunError::FailedTests(report)) => {
            let failed = report
                .details
                .tests
                .iter()
                .filter(|t| !t.result.is_success())
                .count();
            eprintln!("{} test(s) failed", failed.max(1));
            std::process::exit(1);
        }
        Err(err) => Err(err).context("Job run failed"),
    }
}

/// Materialize resources, run the scheduler, export artifacts. The caller
/// owns the unconditional cleanup.
async fn run_with_resources(
    scheduler: &TestScheduler<ProcessExecutor>,
    job: &JobConfig,
    resources: &ResourceManager,
    cancel: &CancellationToken,
) -> Result<Result<TestResultLog, RunError>> {
    resources.setup().await.context("Resource setup failed")?;

    let workspace = resources.repository_path_by_name(&job.repo)?;
    info!("Repository {} cloned to {}", job.repo, workspace.display());
    if let Some(rev) = &job.rev {
        verify_revision(&workspace, rev).await?;
    }
    if job.token.as_ref().is_some_and(|t| t.value.is_some()) {
        let token_path = resources.token_path_by_name("default").await?;
        debug!("Token materialized at {}", token_path.display());
    }

    let outcome = scheduler.run(job, cancel).await;

    if !job.export_artifacts.is_empty() {
        match resources.export_artifacts() {
            Ok(exported) => {
                for path in &exported {
                    info!("Exported {}", path.display());
                }
            }
            Err(err) => warn!("Artifact export failed: {}", err),
        }
    }
    Ok(outcome)
}

/// Fail fast when the pinned revision does not exist in the local clone.
async fn verify_revision(workspace: &Path, rev: &str) -> Result<()> {
    let output = tokio::process::Command::new("git")
        .arg("-C")
        .arg(workspace)
        .args(["rev-parse", "--verify", "--quiet"])
        .arg(format!("{}^{{commit}}", rev))
        .output()
        .await
        .context("Failed to run git rev-parse")?;
    if !output.status.success() {
        bail!("Revision {} not found in {}", rev, workspace.display());
    }
    Ok(())
}

fn validate_job(job_path: &Path) -> Result<()> {
    let job = match config::load_job(job_path).and_then(|job| {
        job.validate()?;
        Ok(job)
    }) {
        Ok(job) => job,
        Err(err) => {
            eprintln!("Job error: {:#}", err);
            std::process::exit(1);
        }
    };

    println!("Job file is valid!");
    println!();
    println!("Settings:");
    println!("  Name:      {}", job.name);
    println!("  Namespace: {}", job.namespace);
    println!("  Image:     {}", job.image);
    println!("  Repo:      {}", job.repo);
    match &job.distributed {
        Some(DistributedConfig {
            max_containers_per_pod,
            retest,
            ..
        }) => {
            println!("  Mode:      distributed");
            println!("  Max containers per pod: {}", max_containers_per_pod);
            println!("  Retest:    {}", retest);
        }
        None => println!("  Mode:      single container"),
    }
    if !job.prepare.steps.is_empty() {
        println!("  Prepare steps: {}", job.prepare.steps.len());
    }

    Ok(())
}

fn init_job() -> Result<()> {
    let job = r#"# scatter job file

name = "unit"
namespace = "default"
image = "golang:1.22"
repo = "github.com/example/service"
branch = "main"
# The TEST env var carries the test name into each distributed container.
command = "go test $TEST"

[distributed]
list_command = "go list ./..."
max_containers_per_pod = 8
# pattern = "^github.com/example"
retest = true
retest_delimiter = " "

[[prepare.steps]]
name = "deps"
command = "go mod download"
"#;

    let path = PathBuf::from("scatter.toml");
    if path.exists() {
        eprintln!("scatter.toml already exists. Remove it first or edit manually.");
        std::process::exit(1);
    }

    std::fs::write(&path, job)?;
    println!("Created scatter.toml");
    println!();
    println!("Edit the job as needed, then run:");
    println!("  scatter run");

    Ok(())
}
