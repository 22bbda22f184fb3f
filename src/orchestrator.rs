use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{FailureClass, PipelineError, StageError, StoreError};
use crate::gateway::ProviderGateway;
use crate::observer::{JobObserver, NoopObserver};
use crate::scoring::{QualityReport, ScoringConfig};
use crate::stages::{JobContext, StageRegistry, keys};
use crate::state_machine::{
    AuditRecord, FailureRecord, Job, JobOutcome, NewJob, RetryConfig, Stage, StageAttempt,
    StageSequence, StateMachine, Transition,
};
use crate::store::{ArtifactRef, ArtifactStore, JobStateStore};

/// Stage label the submitted bytes are stored under.
pub const INPUT_STAGE: &str = "input";
/// Artifact name of the submitted bytes.
pub const INPUT_NAME: &str = "source";

/// Runtime settings of an [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub retry: RetryConfig,
    /// Upper bound for one stage execution. Hitting it is a transient failure.
    pub stage_timeout: Duration,
    /// Sequence pinned on every new job.
    pub pipeline: StageSequence,
    pub scoring: ScoringConfig,
    /// Size of the worker pool.
    pub max_concurrent_jobs: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            stage_timeout: Duration::from_secs(300),
            pipeline: StageSequence::default(),
            scoring: ScoringConfig::default(),
            max_concurrent_jobs: 4,
        }
    }
}

/// A conversion request.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Resubmitting with the same key returns the existing job.
    pub idempotency_key: String,
    pub owner: Option<String>,
    pub source_name: String,
    pub content: Vec<u8>,
}

/// Drives jobs through the stage sequence, persisting every transition.
///
/// Each job is driven by at most one runner at a time; the per-job lock is
/// process-local, so one orchestrator process owns a given store.
pub struct Orchestrator {
    jobs: Arc<dyn JobStateStore>,
    artifacts: Arc<dyn ArtifactStore>,
    gateway: Arc<ProviderGateway>,
    registry: StageRegistry,
    settings: OrchestratorSettings,
    observer: Arc<dyn JobObserver>,
    workers: Arc<Semaphore>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        jobs: Arc<dyn JobStateStore>,
        artifacts: Arc<dyn ArtifactStore>,
        gateway: Arc<ProviderGateway>,
        registry: StageRegistry,
        settings: OrchestratorSettings,
    ) -> Result<Self, PipelineError> {
        registry.validate(&settings.pipeline)?;
        if settings.retry.max_attempts == 0 {
            return Err(PipelineError::InvalidPipeline(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        let workers = Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1)));
        Ok(Self {
            jobs,
            artifacts,
            gateway,
            registry,
            settings,
            observer: Arc::new(NoopObserver),
            workers,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn gateway(&self) -> &ProviderGateway {
        &self.gateway
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Persist a new job (or find the one already holding the key) without
    /// running it.
    pub async fn enqueue(&self, submission: Submission) -> Result<Job, PipelineError> {
        let key = submission.idempotency_key.trim();
        if key.is_empty() {
            return Err(PipelineError::InvalidSubmission(
                "idempotency key must not be empty".into(),
            ));
        }
        if submission.source_name.trim().is_empty() {
            return Err(PipelineError::InvalidSubmission(
                "source name must not be empty".into(),
            ));
        }

        if let Some(existing) = self.jobs.find_by_key(key).await? {
            debug!(job_id = %existing.id, key, "idempotency key already known");
            return Ok(existing);
        }

        let job_id = Uuid::new_v4().to_string();
        let input = self
            .artifacts
            .put(&job_id, INPUT_STAGE, INPUT_NAME, submission.content)
            .await?;
        let job = self
            .jobs
            .create_job(NewJob {
                id: job_id.clone(),
                idempotency_key: key.to_string(),
                owner: submission.owner,
                source_name: submission.source_name,
                input,
                pipeline: self.settings.pipeline.clone(),
            })
            .await?;

        if job.id != job_id {
            // Lost a race with a concurrent submission of the same key.
            if let Err(e) = self.artifacts.delete_job(&job_id).await {
                warn!(job_id = %job_id, error = %e, "failed to remove orphaned input");
            }
            return Ok(job);
        }

        info!(job_id = %job.id, source = %job.source_name, "job queued");
        self.observer.on_job_queued(&job);
        Ok(job)
    }

    /// Enqueue and hand the job to the worker pool. Returns immediately with
    /// the persisted job.
    pub async fn submit(self: &Arc<Self>, submission: Submission) -> Result<Job, PipelineError> {
        let job = self.enqueue(submission).await?;
        if !job.is_terminal() {
            drop(self.dispatch(job.id.clone()));
        }
        Ok(job)
    }

    /// Run `job_id` on the worker pool once a permit is free.
    pub fn dispatch(self: &Arc<Self>, job_id: String) -> JoinHandle<Result<Job, PipelineError>> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = Arc::clone(&this.workers)
                .acquire_owned()
                .await
                .map_err(|_| PipelineError::WorkersClosed)?;
            let result = this.run_job(&job_id).await;
            if let Err(e) = &result {
                error!(job_id = %job_id, error = %e, "job run failed");
            }
            result
        })
    }

    /// Resume every non-terminal job found in the store.
    pub async fn recover(
        self: &Arc<Self>,
    ) -> Result<Vec<JoinHandle<Result<Job, PipelineError>>>, PipelineError> {
        let pending = self.jobs.list_non_terminal_jobs().await?;
        if !pending.is_empty() {
            info!(count = pending.len(), "recovering unfinished jobs");
        }
        Ok(pending
            .into_iter()
            .map(|job| {
                debug!(job_id = %job.id, stage = %job.stage, "resuming job");
                self.dispatch(job.id)
            })
            .collect())
    }

    pub async fn get_status(&self, job_id: &str) -> Result<Job, PipelineError> {
        Ok(self.jobs.get_job(job_id).await?)
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>, PipelineError> {
        Ok(self.jobs.list_jobs().await?)
    }

    pub async fn audit(&self, job_id: &str) -> Result<AuditRecord, PipelineError> {
        let job = self.jobs.get_job(job_id).await?;
        Ok(AuditRecord::from_job(&job))
    }

    /// Flag the job for cancellation. Jobs nobody is driving are finished
    /// right away; a running job stops at its next stage boundary.
    pub async fn cancel(&self, job_id: &str) -> Result<Job, PipelineError> {
        let job = self.jobs.request_cancel(job_id).await?;
        if job.is_terminal() {
            return Ok(job);
        }
        match self.try_lock(job_id) {
            Some(guard) => {
                let result = self.cancel_idle(job_id).await;
                self.release(job_id);
                drop(guard);
                result
            }
            None => {
                info!(job_id, "cancellation requested, job stops at next stage boundary");
                Ok(job)
            }
        }
    }

    async fn cancel_idle(&self, job_id: &str) -> Result<Job, PipelineError> {
        let job = self.jobs.get_job(job_id).await?;
        if job.is_terminal() {
            return Ok(job);
        }
        self.finish_cancelled(job).await
    }

    /// Delete the artifacts of terminal jobs last updated before
    /// `now - retention`. Job records are kept. Returns the number of
    /// artifact versions removed.
    pub async fn purge_expired(&self, retention: chrono::Duration) -> Result<usize, PipelineError> {
        let cutoff = Utc::now() - retention;
        let mut removed = 0;
        for job in self.jobs.list_jobs().await? {
            if job.is_terminal() && job.updated_at < cutoff {
                let n = self.artifacts.delete_job(&job.id).await?;
                if n > 0 {
                    debug!(job_id = %job.id, artifacts = n, "purged artifacts");
                }
                removed += n;
            }
        }
        Ok(removed)
    }

    fn try_lock(&self, job_id: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(job_id.to_string()).or_default())
        };
        lock.try_lock_owned().ok()
    }

    /// Forget the lock of `job_id`. Only the guard holder calls this, right
    /// before dropping the guard.
    fn release(&self, job_id: &str) {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
    }

    /// Drive one job to a terminal state in the caller's task. If another
    /// runner already owns the job, returns its persisted state instead.
    pub async fn run_job(&self, job_id: &str) -> Result<Job, PipelineError> {
        let Some(guard) = self.try_lock(job_id) else {
            debug!(job_id, "job is already being driven");
            return Ok(self.jobs.get_job(job_id).await?);
        };
        let result = match self.drive(job_id).await {
            Ok(job) => Ok(job),
            Err(e) => {
                self.abandon(job_id, &e).await;
                Err(e)
            }
        };
        self.release(job_id);
        drop(guard);
        result
    }

    /// Best-effort FAILED for a job whose drive loop errored out. When the
    /// store refuses this too, the job stays non-terminal for recovery.
    async fn abandon(&self, job_id: &str, err: &PipelineError) {
        let job = match self.jobs.get_job(job_id).await {
            Ok(job) if !job.is_terminal() => job,
            Ok(_) => return,
            Err(e) => {
                warn!(job_id, error = %e, "cannot load job after failed run");
                return;
            }
        };
        let class = match err {
            PipelineError::Store(StoreError::Io(_)) | PipelineError::Join(_) => FailureClass::Transient,
            _ => FailureClass::Permanent,
        };
        let record = FailureRecord {
            stage: job.stage,
            class,
            reason: err.to_string(),
            attempts: job.attempts_for(job.stage),
        };
        if let Err(e) = self.fail(job, record).await {
            warn!(job_id, error = %e, "cannot mark job failed, leaving it for recovery");
        }
    }

    async fn drive(&self, job_id: &str) -> Result<Job, PipelineError> {
        let mut job = self.jobs.get_job(job_id).await?;

        loop {
            if job.is_terminal() {
                return Ok(job);
            }
            if job.cancel_requested {
                return self.finish_cancelled(job).await;
            }

            let Some(stage) = job.resume_stage() else {
                // Every stage succeeded but the job was never finalized.
                return self.complete(job, None).await;
            };

            // A failed attempt whose verdict was never applied, e.g. the
            // process died during backoff.
            if let Some(last) = job
                .attempts
                .last()
                .filter(|a| a.stage == stage && !a.is_success())
                .cloned()
            {
                match StateMachine::next(&job, &last, &self.settings.retry) {
                    Transition::Retry { delay, .. } => {
                        let due = last.ended_at
                            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                        if let Ok(remaining) = (due - Utc::now()).to_std()
                            && !remaining.is_zero()
                        {
                            debug!(job_id, stage = %stage, remaining_ms = remaining.as_millis() as u64, "waiting out pending backoff");
                            sleep(remaining).await;
                        }
                    }
                    Transition::Fail(record) => return self.fail(job, record).await,
                    Transition::CompleteDegraded { stage, reason } => {
                        return self.complete_degraded(job, stage, reason).await;
                    }
                    Transition::Complete | Transition::Advance { .. } => {}
                }
            }

            if job.stage != stage || job.status != stage.status() {
                let progress = job
                    .pipeline
                    .previous(stage)
                    .map(|prev| job.pipeline.progress_after(prev))
                    .unwrap_or(0)
                    .max(job.progress);
                let resumed_from = job.stage;
                job = self.jobs.update_job_stage(job_id, stage, progress).await?;
                if resumed_from != stage {
                    info!(job_id, completed = %resumed_from, next = %stage, progress, "stage advanced on resume");
                    self.observer
                        .on_stage_advanced(job_id, resumed_from, stage, progress);
                }
            }

            let attempt = self.execute_stage(&job, stage).await;
            job = match self.jobs.append_stage_attempt(job_id, attempt.clone()).await {
                Ok(job) => job,
                Err(e) => {
                    self.discard(&attempt.artifacts).await;
                    return Err(e.into());
                }
            };

            match StateMachine::next(&job, &attempt, &self.settings.retry) {
                Transition::Advance { next, progress } => {
                    job = self.jobs.update_job_stage(job_id, next, progress).await?;
                    info!(job_id, completed = %stage, next = %next, progress, "stage advanced");
                    self.observer.on_stage_advanced(job_id, stage, next, progress);
                }
                Transition::Retry {
                    stage,
                    attempt,
                    delay,
                    reason,
                } => {
                    warn!(job_id, stage = %stage, attempt, delay_ms = delay.as_millis() as u64, reason = %reason, "retrying stage");
                    self.observer
                        .on_retry_scheduled(job_id, stage, attempt, delay, &reason);
                    sleep(delay).await;
                    job = self.jobs.get_job(job_id).await?;
                }
                Transition::Complete => return self.complete(job, None).await,
                Transition::CompleteDegraded { stage, reason } => {
                    return self.complete_degraded(job, stage, reason).await;
                }
                Transition::Fail(record) => return self.fail(job, record).await,
            }
        }
    }

    /// Run one attempt of `stage`. Never fails: errors come back as a failed
    /// attempt, with whatever the attempt wrote already removed.
    async fn execute_stage(&self, job: &Job, stage: Stage) -> StageAttempt {
        let attempt_no = job.attempts_for(stage) + 1;
        let started_at = Utc::now();

        let Some(executor) = self.registry.get(stage) else {
            let err = StageError::permanent(format!("no executor registered for {stage}"));
            return StageAttempt::failed(stage, attempt_no, started_at, &err);
        };

        info!(job_id = %job.id, stage = %stage, attempt = attempt_no, "dispatching stage");
        self.observer.on_stage_started(&job.id, stage, attempt_no);

        let ctx = JobContext::new(
            job.id.clone(),
            job.source_name.clone(),
            stage,
            attempt_no,
            job.attempts.clone(),
            Arc::clone(&self.artifacts),
            Arc::clone(&self.gateway),
            self.settings.scoring.clone(),
        );
        let inputs = job.inputs_for(stage);
        let timeout = self.settings.stage_timeout;

        let result = match tokio::time::timeout(timeout, executor.execute(&ctx, &inputs)).await {
            Ok(result) => result,
            Err(_) => Err(StageError::transient(format!(
                "{stage} timed out after {}s",
                timeout.as_secs_f64()
            ))),
        };
        let written = ctx.take_written();

        match result {
            Ok(output) => {
                StageAttempt::succeeded(stage, attempt_no, started_at, output.metadata, output.artifacts)
            }
            Err(err) => {
                warn!(job_id = %job.id, stage = %stage, attempt = attempt_no, error = %err, "stage attempt failed");
                self.discard(&written).await;
                StageAttempt::failed(stage, attempt_no, started_at, &err)
            }
        }
    }

    async fn discard(&self, artifacts: &[ArtifactRef]) {
        for artifact in artifacts {
            if let Err(e) = self.artifacts.delete_artifact(artifact).await {
                warn!(artifact = %artifact, error = %e, "failed to delete artifact of failed attempt");
            }
        }
    }

    async fn complete(&self, job: Job, degraded: Option<String>) -> Result<Job, PipelineError> {
        let quality = job
            .attempts
            .iter()
            .rev()
            .filter(|a| a.is_success())
            .find_map(|a| a.metadata.get(keys::QUALITY_REPORT))
            .and_then(|v| serde_json::from_value::<QualityReport>(v.clone()).ok());
        let artifacts = job
            .last_success(job.pipeline.deliverable_stage())
            .map(|a| a.artifacts.clone())
            .unwrap_or_default();

        let job = self
            .jobs
            .finalize(&job.id, JobOutcome::Succeeded { artifacts, degraded }, quality)
            .await?;
        info!(
            job_id = %job.id,
            quality = job.quality.as_ref().map(|q| q.overall),
            cost_usd = job.total_cost_usd(),
            "job completed"
        );
        self.observer.on_job_completed(&job);
        Ok(job)
    }

    async fn complete_degraded(&self, job: Job, stage: Stage, reason: String) -> Result<Job, PipelineError> {
        warn!(job_id = %job.id, stage = %stage, reason = %reason, "advisory stage gave up, completing without it");
        self.complete(job, Some(format!("{stage} did not finish: {reason}")))
            .await
    }

    async fn fail(&self, job: Job, record: FailureRecord) -> Result<Job, PipelineError> {
        error!(job_id = %job.id, stage = %record.stage, class = %record.class, reason = %record.reason, "job failed");
        let job = self
            .jobs
            .finalize(&job.id, JobOutcome::Failed(record.clone()), None)
            .await?;
        self.observer.on_job_failed(&job, &record);
        Ok(job)
    }

    async fn finish_cancelled(&self, job: Job) -> Result<Job, PipelineError> {
        let record = FailureRecord {
            stage: job.stage,
            class: FailureClass::Cancelled,
            reason: "cancelled by request".into(),
            attempts: job.attempts_for(job.stage),
        };
        self.fail(job, record).await
    }
}
