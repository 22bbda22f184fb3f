use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use docpipe::cli::{Cli, Command};
use docpipe::config::PipelineConfig;
use docpipe::gateway::ProviderGateway;
use docpipe::observer::JobObserver;
use docpipe::orchestrator::{Orchestrator, Submission};
use docpipe::stages::StageRegistry;
use docpipe::state_machine::{AuditRecord, JobStatus};
use docpipe::store::{FileJobStore, FsArtifactStore, content_digest};
use docpipe::ui::{self, JobProgress};

fn init_tracing(verbose: bool) {
    let filter = if verbose { "docpipe=debug" } else { "docpipe=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();
}

fn build_orchestrator(config: &PipelineConfig, observer: Option<Arc<dyn JobObserver>>) -> Result<Arc<Orchestrator>> {
    let jobs = FileJobStore::open(config.jobs_dir())
        .with_context(|| format!("cannot open job store in {}", config.jobs_dir().display()))?;
    let artifacts = FsArtifactStore::new(config.artifacts_dir());
    let gateway = ProviderGateway::from_config(&config.gateway, &config.api_key)?;

    let mut orchestrator = Orchestrator::new(
        Arc::new(jobs),
        Arc::new(artifacts),
        Arc::new(gateway),
        StageRegistry::with_defaults(),
        config.orchestrator_settings(),
    )?;
    if let Some(observer) = observer {
        orchestrator = orchestrator.with_observer(observer);
    }
    Ok(Arc::new(orchestrator))
}

async fn submit(config: &PipelineConfig, file: &Path, key: Option<String>, owner: Option<String>, detach: bool) -> Result<()> {
    let content = tokio::fs::read(file)
        .await
        .with_context(|| format!("cannot read {}", file.display()))?;
    let source_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string());
    let idempotency_key = key.unwrap_or_else(|| content_digest(&content));
    let submission = Submission {
        idempotency_key,
        owner,
        source_name: source_name.clone(),
        content,
    };

    if detach {
        let orchestrator = build_orchestrator(config, None)?;
        let job = orchestrator.enqueue(submission).await?;
        println!("{}", job.id);
        return Ok(());
    }

    let progress = Arc::new(JobProgress::start(&source_name));
    let observer: Arc<dyn JobObserver> = progress.clone();
    let orchestrator = build_orchestrator(config, Some(observer))?;

    let job = orchestrator.enqueue(submission).await?;
    let job = if job.is_terminal() {
        info!(job_id = %job.id, "job already finished, not running again");
        job
    } else {
        orchestrator.run_job(&job.id).await?
    };
    progress.finish();

    ui::print_audit(&AuditRecord::from_job(&job));
    if job.status == JobStatus::Failed {
        bail!("job {} failed", job.id);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(max) = cli.max_retries {
        config.retry.max_attempts = max;
    }
    config.validate()?;

    match cli.command {
        Command::Submit {
            file,
            key,
            owner,
            detach,
        } => submit(&config, &file, key, owner, detach).await?,
        Command::Status { job_id } => {
            let orchestrator = build_orchestrator(&config, None)?;
            let job = orchestrator.get_status(&job_id).await?;
            ui::print_job_line(&job);
            ui::print_audit(&AuditRecord::from_job(&job));
        }
        Command::Cancel { job_id } => {
            let orchestrator = build_orchestrator(&config, None)?;
            let job = orchestrator.cancel(&job_id).await?;
            ui::print_job_line(&job);
        }
        Command::Resume => {
            let orchestrator = build_orchestrator(&config, None)?;
            let handles = orchestrator.recover().await?;
            if handles.is_empty() {
                println!("Nothing to resume.");
            }
            for handle in handles {
                match handle.await? {
                    Ok(job) => ui::print_job_line(&job),
                    Err(e) => warn!(error = %e, "resumed job did not finish"),
                }
            }
        }
        Command::List => {
            let orchestrator = build_orchestrator(&config, None)?;
            for job in orchestrator.list_jobs().await? {
                ui::print_job_line(&job);
            }
        }
        Command::Purge { older_than_hours } => {
            let orchestrator = build_orchestrator(&config, None)?;
            let retention = match older_than_hours {
                Some(hours) => chrono::Duration::hours(hours.min(i64::MAX as u64) as i64),
                None => config.retention(),
            };
            let removed = orchestrator.purge_expired(retention).await?;
            println!("Removed {removed} artifact(s).");
        }
        Command::Providers => {
            let gateway = ProviderGateway::from_config(&config.gateway, &config.api_key)?;
            ui::print_providers(&gateway.health());
        }
    }

    Ok(())
}
