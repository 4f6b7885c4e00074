//! cronbox - a cron scheduler for sandboxed WebAssembly jobs.
//!
//! Usage:
//!   cronbox run [CONFIG]         Run the scheduler until Ctrl+C
//!   cronbox validate [CONFIG]    Check the config and compile every module
//!   cronbox list [CONFIG]        List jobs and their next fire times
//!   cronbox trigger JOB          Run one job once and report the result
//!
//! Without CONFIG the path comes from `CRON_CONFIG`, else `config/jobs.yaml`.

use clap::{Parser, Subcommand};
use cronbox::{
    Event, EventHandler, ExecutionRequest, JobId, LoadedConfig, ModuleCache, RunStatus,
    SandboxRuntime, Scheduler, TriggerRegistry, YamlLoader, load_jobs,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How many upcoming fire times `list` shows per job.
const UPCOMING_PREVIEW: usize = 3;

/// cronbox - run WebAssembly jobs on cron schedules
#[derive(Parser)]
#[command(name = "cronbox")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Run {
        /// Path to the job config file
        #[arg(value_name = "CONFIG")]
        config: Option<PathBuf>,

        /// Seconds to wait for running jobs on shutdown (overrides the config)
        #[arg(long)]
        grace: Option<u64>,
    },

    /// Validate the config and compile every module without running anything
    Validate {
        /// Path to the job config file
        #[arg(value_name = "CONFIG")]
        config: Option<PathBuf>,
    },

    /// List all jobs with their upcoming fire times
    List {
        /// Path to the job config file
        #[arg(value_name = "CONFIG")]
        config: Option<PathBuf>,
    },

    /// Run a job once, right now
    Trigger {
        /// Name of the job to run
        #[arg(value_name = "JOB")]
        job: String,

        /// Path to the job config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// Logs run results, with captured guest output tagged by job name.
struct LoggingReporter;

#[async_trait::async_trait]
impl EventHandler for LoggingReporter {
    async fn handle(&self, event: &Event) {
        match event {
            Event::RunStarted { job_id, run_id, .. } => {
                info!("Job '{}' started (run: {})", job_id, run_id);
            }
            Event::RunFinished {
                job_id,
                run_id,
                result,
                ..
            } => {
                match result.status {
                    RunStatus::Succeeded => info!(
                        "Job '{}' succeeded in {:?} (run: {})",
                        job_id, result.duration, run_id
                    ),
                    RunStatus::Skipped => warn!("Job '{}' skipped (run: {})", job_id, run_id),
                    RunStatus::Failed | RunStatus::TimedOut => {
                        let reason = result
                            .error
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_else(|| result.status.to_string());
                        error!(
                            "Job '{}' {} after {:?} (run: {}): {}",
                            job_id, result.status, result.duration, run_id, reason
                        );
                    }
                }
                if let Some(out) = &result.stdout {
                    for line in out.trim().lines() {
                        info!("[{}] stdout: {}", job_id, line);
                    }
                }
                if let Some(err) = &result.stderr {
                    for line in err.trim().lines() {
                        warn!("[{}] stderr: {}", job_id, line);
                    }
                }
                if result.output_truncated {
                    warn!("[{}] output truncated at the capture limit", job_id);
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, grace } => {
            run_scheduler(config, grace).await?;
        }
        Commands::Validate { config } => {
            validate_jobs(config).await?;
        }
        Commands::List { config } => {
            list_jobs(config)?;
        }
        Commands::Trigger { job, config } => {
            trigger_job(config, job).await?;
        }
    }

    Ok(())
}

fn load(config: Option<PathBuf>) -> Result<LoadedConfig, Box<dyn std::error::Error>> {
    let path = YamlLoader::resolve_config_path(config);
    info!("Loading jobs from: {}", path.display());
    Ok(load_jobs(&path)?)
}

/// Run the scheduler until Ctrl+C or SIGTERM.
async fn run_scheduler(
    config: Option<PathBuf>,
    grace: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let LoadedConfig {
        mut scheduler,
        jobs,
        ..
    } = load(config)?;

    if let Some(secs) = grace {
        scheduler = scheduler.with_shutdown_grace(Duration::from_secs(secs));
    }

    let mut scheduler = Scheduler::new(scheduler)?;
    scheduler.add_handler(Arc::new(LoggingReporter)).await;

    let report = scheduler.register_all(jobs)?;
    info!(
        "Registered {} job(s), skipped {}",
        report.registered_count(),
        report.rejected_count()
    );
    for handle in &report.registered {
        match handle.first_fire() {
            Some(next) => info!("  - {} (next: {})", handle.job_id(), next),
            None => info!("  - {} (no upcoming fire time)", handle.job_id()),
        }
    }

    info!("Press Ctrl+C to stop");
    scheduler.run_until(shutdown_signal()).await?;

    info!("Goodbye!");
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Validate the config, every schedule and every module.
async fn validate_jobs(config: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let loaded = load(config)?;

    let runtime = Arc::new(SandboxRuntime::new(loaded.scheduler.sandbox.clone())?);
    let cache = ModuleCache::new(Arc::clone(&runtime));
    let mut registry = TriggerRegistry::new();
    let mut failures = 0;

    for job in loaded.jobs {
        let name = job.name().to_string();
        let path = job.module_path().to_path_buf();
        if let Err(e) = registry.register(job) {
            error!("  - {}: {}", name, e);
            failures += 1;
            continue;
        }
        match cache.get_or_compile(&path).await {
            Ok(module) => info!("  - {}: OK ({})", name, module.fingerprint()),
            Err(e) => {
                error!("  - {}: {}", name, e);
                failures += 1;
            }
        }
    }
    runtime.shutdown();

    if failures > 0 {
        error!("Validation failed: {} job(s) with errors", failures);
        return Err(format!("{} job(s) failed validation", failures).into());
    }

    info!("All {} job(s) are valid", registry.len());
    Ok(())
}

/// List all jobs in the config.
fn list_jobs(config: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let loaded = load(config)?;
    let mut registry = TriggerRegistry::new();

    println!("Jobs in {}:", loaded.path.display());
    println!();

    for job in loaded.jobs {
        println!("Name: {}", job.name());
        println!("  Module: {}", job.module_path().display());
        println!("  Schedule: {} ({})", job.schedule(), job.timezone());
        println!("  Enabled: {}", job.is_enabled());
        if let Some(timeout) = job.timeout() {
            println!("  Timeout: {:?}", timeout);
        }
        println!("  Max concurrent runs: {}", job.concurrency().max_in_flight());

        let id = job.id().clone();
        match registry.register(job) {
            Ok(_) => {
                let upcoming = registry.upcoming(&id, UPCOMING_PREVIEW).unwrap_or_default();
                println!("  Next runs:");
                for time in upcoming {
                    println!("    - {}", time);
                }
            }
            Err(e) => println!("  Error: {}", e),
        }

        println!();
    }

    Ok(())
}

/// Run a single job once and report its result.
async fn trigger_job(
    config: Option<PathBuf>,
    job: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let loaded = load(config)?;
    let job_id = JobId::new(job);

    if !loaded.jobs.iter().any(|j| j.id() == &job_id) {
        error!("Job '{}' not found", job_id);
        error!(
            "Available jobs: {}",
            loaded
                .jobs
                .iter()
                .map(|j| j.name())
                .collect::<Vec<_>>()
                .join(", ")
        );
        return Err(format!("Job '{}' not found", job_id).into());
    }

    let mut scheduler = Scheduler::new(loaded.scheduler)?;
    scheduler.add_handler(Arc::new(LoggingReporter)).await;
    scheduler.register_all(loaded.jobs)?;

    let result = scheduler
        .coordinator()
        .handle(ExecutionRequest::manual(job_id.clone()))
        .await;

    if result.is_success() {
        Ok(())
    } else {
        Err(format!("Job '{}' {}", job_id, result.status).into())
    }
}
