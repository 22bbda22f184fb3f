use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::state::{JobStatus, Stage, StageSequence};
use crate::error::{FailureClass, StageError};
use crate::scoring::QualityReport;
use crate::stages::keys;
use crate::store::ArtifactRef;

/// Structured facts a stage surfaces about one attempt.
pub type Metadata = BTreeMap<String, Value>;

/// Outcome of a single stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

/// One execution of one stage for one job. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageAttempt {
    pub stage: Stage,
    /// 1-based, counted per stage.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Artifacts handed to the next stage. Empty unless the attempt succeeded.
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
}

impl StageAttempt {
    pub fn succeeded(
        stage: Stage,
        attempt: u32,
        started_at: DateTime<Utc>,
        metadata: Metadata,
        artifacts: Vec<ArtifactRef>,
    ) -> Self {
        Self {
            stage,
            attempt,
            started_at,
            ended_at: Utc::now(),
            outcome: AttemptOutcome::Success,
            error: None,
            metadata,
            artifacts,
        }
    }

    pub fn failed(stage: Stage, attempt: u32, started_at: DateTime<Utc>, err: &StageError) -> Self {
        let outcome = if err.is_transient() {
            AttemptOutcome::TransientFailure
        } else {
            AttemptOutcome::PermanentFailure
        };
        Self {
            stage,
            attempt,
            started_at,
            ended_at: Utc::now(),
            outcome,
            error: Some(err.message().to_string()),
            metadata: Metadata::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }

    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }
}

/// Why a job ended as FAILED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub stage: Stage,
    pub class: FailureClass,
    pub reason: String,
    pub attempts: u32,
}

impl std::fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} failed ({}, {} attempt(s)): {}",
            self.stage, self.class, self.attempts, self.reason
        )
    }
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded {
        artifacts: Vec<ArtifactRef>,
        /// Set when an advisory stage gave up.
        #[serde(default)]
        degraded: Option<String>,
    },
    Failed(FailureRecord),
}

/// Retry behaviour for transient stage failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts per stage, counting the first one.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Ceiling for a single backoff delay.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Delay before the retry that follows failed attempt number `attempt`.
    /// delay = min(base_delay_ms * 2^(attempt - 1), max_delay_ms)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms)
    }
}

/// Everything needed to create a job record.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub idempotency_key: String,
    pub owner: Option<String>,
    pub source_name: String,
    pub input: ArtifactRef,
    pub pipeline: StageSequence,
}

/// One conversion request and its persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub idempotency_key: String,
    /// Opaque to the orchestrator.
    #[serde(default)]
    pub owner: Option<String>,
    pub source_name: String,
    pub input: ArtifactRef,
    pub pipeline: StageSequence,
    pub status: JobStatus,
    /// Stage currently dispatched, or next to dispatch.
    pub stage: Stage,
    pub progress: u8,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub attempts: Vec<StageAttempt>,
    #[serde(default)]
    pub outcome: Option<JobOutcome>,
    #[serde(default)]
    pub quality: Option<QualityReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(new_job: NewJob) -> Self {
        let now = Utc::now();
        let stage = new_job.pipeline.first();
        Self {
            id: new_job.id,
            idempotency_key: new_job.idempotency_key,
            owner: new_job.owner,
            source_name: new_job.source_name,
            input: new_job.input,
            pipeline: new_job.pipeline,
            status: JobStatus::Queued,
            stage,
            progress: 0,
            cancel_requested: false,
            attempts: Vec::new(),
            outcome: None,
            quality: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of attempts recorded for `stage`.
    pub fn attempts_for(&self, stage: Stage) -> u32 {
        self.attempts.iter().filter(|a| a.stage == stage).count() as u32
    }

    pub fn last_success(&self, stage: Stage) -> Option<&StageAttempt> {
        self.attempts
            .iter()
            .rev()
            .find(|a| a.stage == stage && a.is_success())
    }

    /// First stage of the pipeline without a recorded success, i.e. where a
    /// runner picks the job up. `None` once every stage has succeeded.
    pub fn resume_stage(&self) -> Option<Stage> {
        self.pipeline
            .stages()
            .iter()
            .copied()
            .find(|s| self.last_success(*s).is_none())
    }

    /// Input artifacts for `stage`: the job input for the first stage,
    /// otherwise the outputs of the preceding stage's successful attempt.
    pub fn inputs_for(&self, stage: Stage) -> Vec<ArtifactRef> {
        match self.pipeline.previous(stage) {
            None => vec![self.input.clone()],
            Some(prev) => self
                .last_success(prev)
                .map(|a| a.artifacts.clone())
                .unwrap_or_default(),
        }
    }

    pub fn failure(&self) -> Option<&FailureRecord> {
        match &self.outcome {
            Some(JobOutcome::Failed(record)) => Some(record),
            _ => None,
        }
    }

    /// Sum of AI cost recorded across every attempt.
    pub fn total_cost_usd(&self) -> f64 {
        self.attempts
            .iter()
            .filter_map(|a| a.metadata.get(keys::COST_USD).and_then(Value::as_f64))
            .sum()
    }
}

/// Compact record produced when a job reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub job_id: String,
    pub source_name: String,
    pub status: JobStatus,
    pub stage_transitions: Vec<Stage>,
    pub attempt_count: usize,
    pub retry_count: usize,
    pub total_cost_usd: f64,
    pub quality_score: Option<f64>,
    pub failure: Option<FailureRecord>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl AuditRecord {
    pub fn from_job(job: &Job) -> Self {
        let stage_transitions = job
            .attempts
            .iter()
            .filter(|a| a.is_success())
            .map(|a| a.stage)
            .collect();
        let retry_count = job
            .attempts
            .iter()
            .filter(|a| a.outcome == AttemptOutcome::TransientFailure)
            .count();

        Self {
            job_id: job.id.clone(),
            source_name: job.source_name.clone(),
            status: job.status,
            stage_transitions,
            attempt_count: job.attempts.len(),
            retry_count,
            total_cost_usd: job.total_cost_usd(),
            quality_score: job.quality.as_ref().map(|q| q.overall),
            failure: job.failure().cloned(),
            started_at: job.created_at,
            completed_at: job.updated_at,
            duration_ms: (job.updated_at - job.created_at).num_milliseconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_job() -> Job {
        Job::new(NewJob {
            id: "job-7".into(),
            idempotency_key: "k".into(),
            owner: Some("tenant-a".into()),
            source_name: "report.md".into(),
            input: ArtifactRef::new("job-7", "input", "report.md", 1, "d1", 10),
            pipeline: StageSequence::default(),
        })
    }

    fn success(stage: Stage, artifacts: Vec<ArtifactRef>, cost: f64) -> StageAttempt {
        let mut metadata = Metadata::new();
        metadata.insert(keys::COST_USD.into(), json!(cost));
        StageAttempt::succeeded(stage, 1, Utc::now(), metadata, artifacts)
    }

    #[test]
    fn job_creation_defaults() {
        let job = make_job();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.stage, Stage::Convert);
        assert_eq!(job.progress, 0);
        assert!(job.attempts.is_empty());
        assert!(!job.cancel_requested);
        assert_eq!(job.resume_stage(), Some(Stage::Convert));
    }

    #[test]
    fn retry_config_exponential_backoff() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
        };
        assert_eq!(config.delay_for_attempt(1), 1000);
        assert_eq!(config.delay_for_attempt(2), 2000);
        assert_eq!(config.delay_for_attempt(3), 4000);
        assert_eq!(config.delay_for_attempt(4), 5000);
        assert_eq!(config.delay_for_attempt(80), 5000);
    }

    #[test]
    fn inputs_follow_the_previous_success() {
        let mut job = make_job();
        assert_eq!(job.inputs_for(Stage::Convert), vec![job.input.clone()]);
        assert!(job.inputs_for(Stage::Extract).is_empty());

        let ir = ArtifactRef::new("job-7", "convert", "intermediate.json", 2, "d2", 5);
        job.attempts.push(StageAttempt::failed(
            Stage::Convert,
            1,
            Utc::now(),
            &StageError::transient("disk busy"),
        ));
        job.attempts.push(success(Stage::Convert, vec![ir.clone()], 0.0));

        assert_eq!(job.inputs_for(Stage::Extract), vec![ir]);
        assert_eq!(job.attempts_for(Stage::Convert), 2);
        assert_eq!(job.resume_stage(), Some(Stage::Extract));
    }

    #[test]
    fn total_cost_sums_metadata() {
        let mut job = make_job();
        job.attempts.push(success(Stage::Convert, vec![], 0.0));
        job.attempts.push(success(Stage::Extract, vec![], 0.012));
        job.attempts.push(success(Stage::Structure, vec![], 0.003));
        assert!((job.total_cost_usd() - 0.015).abs() < 1e-9);
    }

    #[test]
    fn audit_record_from_failed_job() {
        let mut job = make_job();
        job.attempts.push(StageAttempt::failed(
            Stage::Convert,
            1,
            Utc::now(),
            &StageError::permanent("corrupted input"),
        ));
        let failure = FailureRecord {
            stage: Stage::Convert,
            class: FailureClass::Permanent,
            reason: "corrupted input".into(),
            attempts: 1,
        };
        job.status = JobStatus::Failed;
        job.outcome = Some(JobOutcome::Failed(failure.clone()));

        let record = AuditRecord::from_job(&job);
        assert_eq!(record.job_id, "job-7");
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.retry_count, 0);
        assert!(record.stage_transitions.is_empty());
        assert_eq!(record.failure, Some(failure));
    }

    #[test]
    fn failure_record_display() {
        let record = FailureRecord {
            stage: Stage::Extract,
            class: FailureClass::ResourceExhausted,
            reason: "provider unavailable".into(),
            attempts: 3,
        };
        assert_eq!(
            record.to_string(),
            "Extract failed (ResourceExhausted, 3 attempt(s)): provider unavailable"
        );
    }

    #[test]
    fn job_serialization_keeps_attempt_log() {
        let mut job = make_job();
        job.attempts.push(success(Stage::Convert, vec![], 0.0));
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }
}
