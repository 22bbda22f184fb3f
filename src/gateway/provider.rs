use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// What a stage wants the AI to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisTask {
    /// Confirm the element layout of extracted content and suggest headings.
    Layout,
    /// Review a section outline and suggest a document title.
    Structure,
}

impl fmt::Display for AnalysisTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisTask::Layout => write!(f, "layout"),
            AnalysisTask::Structure => write!(f, "structure"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub task: AnalysisTask,
    pub content: String,
}

impl AnalysisRequest {
    pub fn new(task: AnalysisTask, content: impl Into<String>) -> Self {
        Self {
            task,
            content: content.into(),
        }
    }
}

/// A provider's answer before the gateway decides whether to keep it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub result: Value,
    /// Self-reported confidence in `0.0..=1.0`.
    pub confidence: f64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("refused to answer: {0}")]
    Refused(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether calling the same provider again could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout(_)
                | ProviderError::RateLimited { .. }
                | ProviderError::Unavailable(_)
                | ProviderError::InvalidResponse(_)
        )
    }
}

/// One AI capability behind the gateway. Implementations are listed in
/// preference order and must be interchangeable for every [`AnalysisTask`].
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap local check, e.g. a missing API key. Unavailable providers are
    /// skipped without a call.
    fn is_available(&self) -> bool {
        true
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<ProviderResponse, ProviderError>;
}
