//! Stage executors and the registry the orchestrator resolves them from.
//!
//! Every executor follows the same contract: read the previous stage's
//! artifacts through the [`JobContext`], do its work, write its own
//! artifacts back through the context and return them with metadata. All
//! errors come back classified as [`StageError`].

mod convert;
pub mod document;
mod extract;
pub mod generate;
mod score;
mod structure;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;

pub use convert::ConvertExecutor;
pub use extract::ExtractExecutor;
pub use generate::GenerateExecutor;
pub use score::ScoreExecutor;
pub use structure::StructureExecutor;

use crate::error::{PipelineError, StageError};
use crate::gateway::{Analysis, ProviderGateway};
use crate::scoring::ScoringConfig;
use crate::state_machine::{Metadata, Stage, StageAttempt, StageSequence};
use crate::store::{ArtifactRef, ArtifactStore};

/// Metadata keys shared between the stages and the scorer.
pub mod keys {
    pub const PROVIDER: &str = "provider";
    pub const CONFIDENCE: &str = "confidence";
    pub const COST_USD: &str = "cost_usd";
    pub const PROVIDER_CALLS: &str = "provider_calls";
    pub const FALLBACKS: &str = "fallbacks";
    pub const PAGES: &str = "pages";
    pub const EMPTY_PAGES: &str = "empty_pages";
    pub const ELEMENT_COUNT: &str = "element_count";
    pub const HEADINGS_DETECTED: &str = "headings_detected";
    pub const SECTION_COUNT: &str = "section_count";
    pub const EMPTY_SECTIONS: &str = "empty_sections";
    pub const LEVEL_SKIPS: &str = "level_skips";
    pub const RENDERED_ELEMENTS: &str = "rendered_elements";
    pub const PLACEHOLDER_COUNT: &str = "placeholder_count";
    pub const QUALITY_REPORT: &str = "quality_report";
}

/// What a successful execution hands back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub artifacts: Vec<ArtifactRef>,
    pub metadata: Metadata,
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn stage(&self) -> Stage;

    async fn execute(
        &self,
        ctx: &JobContext,
        inputs: &[ArtifactRef],
    ) -> Result<StageOutput, StageError>;
}

/// Per-attempt view of a job given to an executor.
pub struct JobContext {
    pub job_id: String,
    pub source_name: String,
    pub stage: Stage,
    pub attempt: u32,
    /// Attempts recorded before this one, oldest first.
    pub history: Vec<StageAttempt>,
    artifacts: Arc<dyn ArtifactStore>,
    gateway: Arc<ProviderGateway>,
    scoring: ScoringConfig,
    written: Mutex<Vec<ArtifactRef>>,
}

impl JobContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: impl Into<String>,
        source_name: impl Into<String>,
        stage: Stage,
        attempt: u32,
        history: Vec<StageAttempt>,
        artifacts: Arc<dyn ArtifactStore>,
        gateway: Arc<ProviderGateway>,
        scoring: ScoringConfig,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            source_name: source_name.into(),
            stage,
            attempt,
            history,
            artifacts,
            gateway,
            scoring,
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn gateway(&self) -> &ProviderGateway {
        &self.gateway
    }

    pub fn scoring(&self) -> &ScoringConfig {
        &self.scoring
    }

    /// Read the input artifact called `name`.
    pub async fn read(&self, inputs: &[ArtifactRef], name: &str) -> Result<Vec<u8>, StageError> {
        let artifact = inputs
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| StageError::permanent(format!("missing input artifact `{name}`")))?;
        Ok(self.artifacts.get(artifact).await?)
    }

    pub async fn read_json<T: DeserializeOwned>(
        &self,
        inputs: &[ArtifactRef],
        name: &str,
    ) -> Result<T, StageError> {
        let bytes = self.read(inputs, name).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| StageError::permanent(format!("artifact `{name}` is malformed: {e}")))
    }

    /// Store an artifact under the current stage. The write is remembered so
    /// the orchestrator can remove it if the attempt fails.
    pub async fn write(&self, name: &str, bytes: Vec<u8>) -> Result<ArtifactRef, StageError> {
        let artifact = self
            .artifacts
            .put(&self.job_id, self.stage.as_str(), name, bytes)
            .await?;
        self.written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(artifact.clone());
        Ok(artifact)
    }

    pub async fn write_json<T: Serialize + Sync>(
        &self,
        name: &str,
        value: &T,
    ) -> Result<ArtifactRef, StageError> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| StageError::permanent(format!("cannot encode `{name}`: {e}")))?;
        self.write(name, bytes).await
    }

    /// Drain the list of artifacts written during this attempt.
    pub fn take_written(&self) -> Vec<ArtifactRef> {
        std::mem::take(&mut *self.written.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Record provider identity, confidence and cost of a gateway call.
pub(crate) fn record_analysis(metadata: &mut Metadata, analysis: &Analysis) {
    metadata.insert(keys::PROVIDER.into(), json!(analysis.provider));
    metadata.insert(keys::CONFIDENCE.into(), json!(analysis.confidence));
    metadata.insert(keys::COST_USD.into(), json!(analysis.cost_usd));
    metadata.insert(keys::PROVIDER_CALLS.into(), json!(analysis.calls));
    metadata.insert(keys::FALLBACKS.into(), json!(analysis.fallbacks));
}

/// Stage id to executor lookup.
#[derive(Clone, Default)]
pub struct StageRegistry {
    executors: HashMap<Stage, Arc<dyn StageExecutor>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in executor for every stage.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ConvertExecutor));
        registry.register(Arc::new(ExtractExecutor));
        registry.register(Arc::new(StructureExecutor));
        registry.register(Arc::new(GenerateExecutor));
        registry.register(Arc::new(ScoreExecutor));
        registry
    }

    /// Register `executor` for its stage, returning the one it replaces.
    pub fn register(&mut self, executor: Arc<dyn StageExecutor>) -> Option<Arc<dyn StageExecutor>> {
        self.executors.insert(executor.stage(), executor)
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageExecutor>> {
        self.executors.get(&stage).cloned()
    }

    /// Every stage of `pipeline` must have an executor.
    pub fn validate(&self, pipeline: &StageSequence) -> Result<(), PipelineError> {
        match pipeline.stages().iter().find(|s| !self.executors.contains_key(*s)) {
            Some(stage) => Err(PipelineError::MissingExecutor(*stage)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::store::MemoryArtifactStore;

    pub fn context(stage: Stage, store: Arc<MemoryArtifactStore>) -> JobContext {
        context_with_gateway(stage, store, Arc::new(ProviderGateway::heuristic()))
    }

    pub fn context_with_gateway(
        stage: Stage,
        store: Arc<MemoryArtifactStore>,
        gateway: Arc<ProviderGateway>,
    ) -> JobContext {
        JobContext::new(
            "job-1",
            "report.md",
            stage,
            1,
            Vec::new(),
            store,
            gateway,
            ScoringConfig::default(),
        )
    }
}
