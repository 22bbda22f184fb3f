use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::state_machine::Stage;

/// Errors surfaced by the orchestrator to its callers.
///
/// Stage failures never show up here: executors classify them into
/// [`StageError`] and the orchestrator records them on the job instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("No executor registered for stage {0}")]
    MissingExecutor(Stage),

    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("Worker pool is shut down")]
    WorkersClosed,

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Errors raised by the job state store and the artifact store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job `{0}` not found")]
    JobNotFound(String),

    #[error("artifact `{0}` not found")]
    ArtifactNotFound(String),

    #[error("invalid artifact name `{0}`")]
    InvalidName(String),

    #[error("artifact `{0}` failed its integrity check")]
    Corrupted(String),

    #[error("job `{0}` is terminal and cannot be modified")]
    Terminal(String),

    #[error("invalid transition for job `{job_id}`: {detail}")]
    InvalidTransition { job_id: String, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Classifies a failed attempt or a failed job.
///
/// Stages only ever produce `Transient` or `Permanent`. The orchestrator
/// adds `ResourceExhausted` when the retry budget runs out and `Cancelled`
/// when a cancellation request is honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network error, timeout, rate limit, provider unavailable.
    Transient,
    /// Malformed or unsupported input, validation failure, refusal.
    Permanent,
    /// Transient failures kept happening until the retry budget was spent.
    ResourceExhausted,
    /// The job was cancelled at a stage boundary.
    Cancelled,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureClass::Transient => write!(f, "Transient"),
            FailureClass::Permanent => write!(f, "Permanent"),
            FailureClass::ResourceExhausted => write!(f, "ResourceExhausted"),
            FailureClass::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// A classified stage failure.
///
/// Only constructible as transient or permanent, so an executor cannot
/// hand the orchestrator an unclassified error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class} failure: {message}")]
pub struct StageError {
    class: FailureClass,
    message: String,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Permanent,
            message: message.into(),
        }
    }

    pub fn class(&self) -> FailureClass {
        self.class
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_transient(&self) -> bool {
        self.class == FailureClass::Transient
    }
}

impl From<GatewayError> for StageError {
    fn from(err: GatewayError) -> Self {
        if err.is_transient() {
            StageError::transient(err.to_string())
        } else {
            StageError::permanent(err.to_string())
        }
    }
}

/// Store I/O inside a stage is worth retrying; a missing, corrupted or
/// undecodable artifact is not going to fix itself.
impl From<StoreError> for StageError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io(_) => StageError::transient(err.to_string()),
            _ => StageError::permanent(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_display_includes_class() {
        let err = StageError::permanent("input is not UTF-8");
        assert_eq!(err.to_string(), "Permanent failure: input is not UTF-8");
        assert!(!err.is_transient());

        let err = StageError::transient("connection reset");
        assert_eq!(err.class(), FailureClass::Transient);
        assert!(err.is_transient());
    }

    #[test]
    fn store_io_errors_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk busy");
        let err: StageError = StoreError::Io(io).into();
        assert!(err.is_transient());

        let err: StageError = StoreError::Corrupted("job/convert/x@v1".into()).into();
        assert_eq!(err.class(), FailureClass::Permanent);
    }

    #[test]
    fn failure_class_serializes_snake_case() {
        let json = serde_json::to_string(&FailureClass::ResourceExhausted).unwrap();
        assert_eq!(json, r#""resource_exhausted""#);
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PipelineError>();
        assert_send_sync::<StoreError>();
        assert_send_sync::<StageError>();
    }
}
