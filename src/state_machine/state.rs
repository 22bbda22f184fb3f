use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::job::{AttemptOutcome, FailureRecord, Job, RetryConfig, StageAttempt};
use crate::error::FailureClass;

/// One step of the conversion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Convert,
    Extract,
    Structure,
    Generate,
    Score,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Convert,
        Stage::Extract,
        Stage::Structure,
        Stage::Generate,
        Stage::Score,
    ];

    /// Lowercase label used for artifact paths and config files.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Convert => "convert",
            Stage::Extract => "extract",
            Stage::Structure => "structure",
            Stage::Generate => "generate",
            Stage::Score => "score",
        }
    }

    /// Job status while this stage is in flight.
    pub fn status(self) -> JobStatus {
        match self {
            Stage::Convert => JobStatus::Converting,
            Stage::Extract => JobStatus::Extracting,
            Stage::Structure => JobStatus::Structuring,
            Stage::Generate => JobStatus::Generating,
            Stage::Score => JobStatus::Scoring,
        }
    }

    /// Advisory stages describe the deliverable instead of producing it.
    /// Their failure degrades the job instead of failing it.
    pub fn is_advisory(self) -> bool {
        matches!(self, Stage::Score)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Convert => write!(f, "Convert"),
            Stage::Extract => write!(f, "Extract"),
            Stage::Structure => write!(f, "Structure"),
            Stage::Generate => write!(f, "Generate"),
            Stage::Score => write!(f, "Score"),
        }
    }
}

/// Lifecycle status of a job.
///
/// QUEUED → CONVERTING → EXTRACTING → STRUCTURING → GENERATING → SCORING → COMPLETED,
/// with every non-terminal status able to move to FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Converting,
    Extracting,
    Structuring,
    Generating,
    Scoring,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Converting => "CONVERTING",
            JobStatus::Extracting => "EXTRACTING",
            JobStatus::Structuring => "STRUCTURING",
            JobStatus::Generating => "GENERATING",
            JobStatus::Scoring => "SCORING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

/// Ordered list of stages a job runs through.
///
/// Pinned on the job at submission so a config change never reorders a job
/// that is already in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Stage>", into = "Vec<Stage>")]
pub struct StageSequence(Vec<Stage>);

impl StageSequence {
    /// Validates the sequence: non-empty, no duplicates, and advisory stages
    /// only at the tail.
    pub fn new(stages: Vec<Stage>) -> Result<Self, String> {
        if stages.is_empty() {
            return Err("stage sequence must not be empty".into());
        }
        for (i, stage) in stages.iter().enumerate() {
            if stages[..i].contains(stage) {
                return Err(format!("stage {stage} appears more than once"));
            }
        }
        if let Some(pos) = stages.iter().position(|s| s.is_advisory())
            && stages[pos..].iter().any(|s| !s.is_advisory())
        {
            return Err(format!("advisory stage {} must come last", stages[pos]));
        }
        Ok(Self(stages))
    }

    pub fn stages(&self) -> &[Stage] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Stage {
        self.0[0]
    }

    pub fn position(&self, stage: Stage) -> Option<usize> {
        self.0.iter().position(|s| *s == stage)
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.0.contains(&stage)
    }

    pub fn next_after(&self, stage: Stage) -> Option<Stage> {
        let pos = self.position(stage)?;
        self.0.get(pos + 1).copied()
    }

    pub fn previous(&self, stage: Stage) -> Option<Stage> {
        let pos = self.position(stage)?;
        pos.checked_sub(1).map(|p| self.0[p])
    }

    /// Progress once `stage` has succeeded: its 1-based position as a share of 100.
    pub fn progress_after(&self, stage: Stage) -> u8 {
        match self.position(stage) {
            Some(pos) => (((pos + 1) * 100) / self.0.len()) as u8,
            None => 0,
        }
    }

    /// Last stage whose output is the job's deliverable.
    pub fn deliverable_stage(&self) -> Stage {
        self.0
            .iter()
            .rev()
            .find(|s| !s.is_advisory())
            .copied()
            .unwrap_or_else(|| self.first())
    }
}

impl Default for StageSequence {
    fn default() -> Self {
        Self(Stage::ALL.to_vec())
    }
}

impl TryFrom<Vec<Stage>> for StageSequence {
    type Error = String;

    fn try_from(stages: Vec<Stage>) -> Result<Self, Self::Error> {
        Self::new(stages)
    }
}

impl From<StageSequence> for Vec<Stage> {
    fn from(seq: StageSequence) -> Self {
        seq.0
    }
}

/// What the orchestrator should do after recording an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Persist the new stage pointer and progress, then dispatch `next`.
    Advance { next: Stage, progress: u8 },
    /// Dispatch the same stage again after `delay`.
    Retry {
        stage: Stage,
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    /// Every stage succeeded.
    Complete,
    /// An advisory stage gave up; the deliverable stands without its report.
    CompleteDegraded { stage: Stage, reason: String },
    /// The job is finished as FAILED.
    Fail(FailureRecord),
}

/// Pure transition rules for the conversion pipeline.
pub struct StateMachine;

impl StateMachine {
    /// Decide the next transition for `job` given the attempt that was just
    /// appended to its log.
    ///
    /// - Success advances to the next stage in the job's sequence, or
    ///   completes after the last one.
    /// - A transient failure retries while the stage has attempts left;
    ///   after that the job fails as `ResourceExhausted`.
    /// - A permanent failure never retries.
    /// - Failures of advisory stages complete the job in degraded form.
    pub fn next(job: &Job, attempt: &StageAttempt, retry: &RetryConfig) -> Transition {
        let stage = attempt.stage;
        let reason = attempt
            .error
            .clone()
            .unwrap_or_else(|| "unknown failure".to_string());

        let class = match attempt.outcome {
            AttemptOutcome::Success => {
                return match job.pipeline.next_after(stage) {
                    Some(next) => Transition::Advance {
                        next,
                        progress: job.pipeline.progress_after(stage),
                    },
                    None => Transition::Complete,
                };
            }
            AttemptOutcome::TransientFailure => {
                let made = job.attempts_for(stage);
                if made < retry.max_attempts {
                    return Transition::Retry {
                        stage,
                        attempt: made + 1,
                        delay: Duration::from_millis(retry.delay_for_attempt(made)),
                        reason,
                    };
                }
                FailureClass::ResourceExhausted
            }
            AttemptOutcome::PermanentFailure => FailureClass::Permanent,
        };

        if stage.is_advisory() {
            return Transition::CompleteDegraded { stage, reason };
        }

        Transition::Fail(FailureRecord {
            stage,
            class,
            reason,
            attempts: job.attempts_for(stage),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::job::{Metadata, NewJob};
    use crate::store::ArtifactRef;
    use chrono::Utc;

    fn make_job() -> Job {
        Job::new(NewJob {
            id: "job-1".into(),
            idempotency_key: "key-1".into(),
            owner: None,
            source_name: "doc.txt".into(),
            input: ArtifactRef::new("job-1", "input", "doc.txt", 1, "abc", 3),
            pipeline: StageSequence::default(),
        })
    }

    fn attempt(stage: Stage, n: u32, outcome: AttemptOutcome) -> StageAttempt {
        StageAttempt {
            stage,
            attempt: n,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            outcome,
            error: match outcome {
                AttemptOutcome::Success => None,
                _ => Some("boom".into()),
            },
            metadata: Metadata::new(),
            artifacts: Vec::new(),
        }
    }

    fn record(job: &mut Job, a: &StageAttempt) {
        job.attempts.push(a.clone());
    }

    #[test]
    fn success_walks_the_sequence_with_fixed_progress() {
        let mut job = make_job();
        let mut seen = Vec::new();
        for stage in Stage::ALL {
            let a = attempt(stage, 1, AttemptOutcome::Success);
            record(&mut job, &a);
            seen.push(StateMachine::next(&job, &a, &RetryConfig::default()));
        }
        assert_eq!(
            seen,
            vec![
                Transition::Advance { next: Stage::Extract, progress: 20 },
                Transition::Advance { next: Stage::Structure, progress: 40 },
                Transition::Advance { next: Stage::Generate, progress: 60 },
                Transition::Advance { next: Stage::Score, progress: 80 },
                Transition::Complete,
            ]
        );
    }

    #[test]
    fn transient_failure_retries_with_backoff_then_exhausts() {
        let mut job = make_job();
        let retry = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 150,
        };

        let a1 = attempt(Stage::Convert, 1, AttemptOutcome::TransientFailure);
        record(&mut job, &a1);
        match StateMachine::next(&job, &a1, &retry) {
            Transition::Retry { attempt, delay, .. } => {
                assert_eq!(attempt, 2);
                assert_eq!(delay, Duration::from_millis(100));
            }
            other => panic!("expected retry, got {other:?}"),
        }

        let a2 = attempt(Stage::Convert, 2, AttemptOutcome::TransientFailure);
        record(&mut job, &a2);
        match StateMachine::next(&job, &a2, &retry) {
            Transition::Retry { attempt, delay, .. } => {
                assert_eq!(attempt, 3);
                // Capped at max_delay_ms.
                assert_eq!(delay, Duration::from_millis(150));
            }
            other => panic!("expected retry, got {other:?}"),
        }

        let a3 = attempt(Stage::Convert, 3, AttemptOutcome::TransientFailure);
        record(&mut job, &a3);
        match StateMachine::next(&job, &a3, &retry) {
            Transition::Fail(record) => {
                assert_eq!(record.class, FailureClass::ResourceExhausted);
                assert_eq!(record.stage, Stage::Convert);
                assert_eq!(record.attempts, 3);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn permanent_failure_never_retries() {
        let mut job = make_job();
        let a = attempt(Stage::Convert, 1, AttemptOutcome::PermanentFailure);
        record(&mut job, &a);
        let t = StateMachine::next(&job, &a, &RetryConfig::default());
        assert_eq!(
            t,
            Transition::Fail(FailureRecord {
                stage: Stage::Convert,
                class: FailureClass::Permanent,
                reason: "boom".into(),
                attempts: 1,
            })
        );
    }

    #[test]
    fn advisory_stage_failure_degrades_instead_of_failing() {
        let mut job = make_job();
        let a = attempt(Stage::Score, 1, AttemptOutcome::PermanentFailure);
        record(&mut job, &a);
        let t = StateMachine::next(&job, &a, &RetryConfig::default());
        assert_eq!(
            t,
            Transition::CompleteDegraded {
                stage: Stage::Score,
                reason: "boom".into()
            }
        );
    }

    #[test]
    fn retry_then_succeed_advances() {
        let mut job = make_job();
        let a1 = attempt(Stage::Convert, 1, AttemptOutcome::TransientFailure);
        record(&mut job, &a1);
        assert!(matches!(
            StateMachine::next(&job, &a1, &RetryConfig::default()),
            Transition::Retry { .. }
        ));
        let a2 = attempt(Stage::Convert, 2, AttemptOutcome::Success);
        record(&mut job, &a2);
        assert_eq!(
            StateMachine::next(&job, &a2, &RetryConfig::default()),
            Transition::Advance { next: Stage::Extract, progress: 20 }
        );
    }

    #[test]
    fn sequence_validation() {
        assert!(StageSequence::new(vec![]).is_err());
        assert!(StageSequence::new(vec![Stage::Convert, Stage::Convert]).is_err());
        assert!(StageSequence::new(vec![Stage::Score, Stage::Convert]).is_err());

        let short = StageSequence::new(vec![Stage::Convert, Stage::Generate]).unwrap();
        assert_eq!(short.progress_after(Stage::Convert), 50);
        assert_eq!(short.next_after(Stage::Convert), Some(Stage::Generate));
        assert_eq!(short.previous(Stage::Generate), Some(Stage::Convert));
        assert_eq!(short.deliverable_stage(), Stage::Generate);
        assert_eq!(StageSequence::default().deliverable_stage(), Stage::Generate);
    }

    #[test]
    fn sequence_deserializes_with_validation() {
        let seq: StageSequence = serde_json::from_str(r#"["convert","extract"]"#).unwrap();
        assert_eq!(seq.stages(), &[Stage::Convert, Stage::Extract]);
        assert!(serde_json::from_str::<StageSequence>(r#"["score","convert"]"#).is_err());
    }

    #[test]
    fn display_labels() {
        assert_eq!(Stage::Convert.to_string(), "Convert");
        assert_eq!(Stage::Structure.as_str(), "structure");
        assert_eq!(JobStatus::Structuring.to_string(), "STRUCTURING");
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Scoring.is_terminal());
    }
}
