use async_trait::async_trait;
use serde_json::json;

use super::{JobContext, StageExecutor, StageOutput, generate, keys};
use crate::error::StageError;
use crate::scoring::{self, Anomaly};
use crate::state_machine::{Metadata, Stage};
use crate::store::ArtifactRef;

pub const OUTPUT: &str = "quality_report.json";

/// Aggregates the job's attempt log into a quality report.
pub struct ScoreExecutor;

#[async_trait]
impl StageExecutor for ScoreExecutor {
    fn stage(&self) -> Stage {
        Stage::Score
    }

    async fn execute(&self, ctx: &JobContext, inputs: &[ArtifactRef]) -> Result<StageOutput, StageError> {
        let body = ctx.read(inputs, generate::DOCUMENT).await?;
        let mut report = scoring::evaluate(&ctx.history, ctx.scoring());
        if body.is_empty() {
            report.anomalies.push(Anomaly {
                stage: Stage::Generate,
                code: "empty_output".into(),
                message: "generated document is empty".into(),
            });
        }

        let artifact = ctx.write_json(OUTPUT, &report).await?;
        let value = serde_json::to_value(&report)
            .map_err(|e| StageError::permanent(format!("cannot encode quality report: {e}")))?;

        let mut metadata = Metadata::new();
        metadata.insert("overall".into(), json!(report.overall));
        metadata.insert("anomaly_count".into(), json!(report.anomalies.len()));
        metadata.insert(keys::QUALITY_REPORT.into(), value);
        Ok(StageOutput {
            artifacts: vec![artifact],
            metadata,
        })
    }
}
