use async_trait::async_trait;
use serde_json::json;

use super::document::{IntermediateDoc, Page, SourceFormat};
use super::{JobContext, StageExecutor, StageOutput, keys};
use crate::error::StageError;
use crate::state_machine::{Metadata, Stage};
use crate::store::ArtifactRef;

pub const OUTPUT: &str = "intermediate.json";

/// Page separator in plain-text exports.
const FORM_FEED: char = '\u{000C}';

/// Formats that need a dedicated parser this pipeline does not ship.
const UNSUPPORTED_EXTENSIONS: &[&str] = &["pdf", "docx", "doc", "odt", "rtf", "png", "jpg", "jpeg", "gif"];

/// Raw bytes to paged text. Deterministic, no AI.
pub struct ConvertExecutor;

fn detect_format(source_name: &str, bytes: &[u8]) -> Result<SourceFormat, StageError> {
    let extension = source_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    if bytes.starts_with(b"%PDF") || UNSUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(StageError::permanent(format!(
            "unsupported input format for `{source_name}`"
        )));
    }

    Ok(match extension.as_str() {
        "md" | "markdown" => SourceFormat::Markdown,
        _ => SourceFormat::PlainText,
    })
}

/// Decode and page the input. Binary or empty content is a permanent failure.
pub(crate) fn convert(source_name: &str, bytes: &[u8]) -> Result<IntermediateDoc, StageError> {
    if bytes.is_empty() {
        return Err(StageError::permanent("input is empty"));
    }
    let format = detect_format(source_name, bytes)?;

    let text = std::str::from_utf8(bytes)
        .map_err(|e| StageError::permanent(format!("input is corrupted: not valid UTF-8 ({e})")))?;
    if text.contains('\0') {
        return Err(StageError::permanent("input is corrupted: contains NUL bytes"));
    }
    if text.trim().is_empty() {
        return Err(StageError::permanent("input has no text content"));
    }

    let pages = text
        .split(FORM_FEED)
        .enumerate()
        .map(|(i, chunk)| Page {
            number: i as u32 + 1,
            lines: chunk.lines().map(|l| l.trim_end().to_string()).collect(),
        })
        .collect();

    Ok(IntermediateDoc {
        source_name: source_name.to_string(),
        format,
        pages,
    })
}

#[async_trait]
impl StageExecutor for ConvertExecutor {
    fn stage(&self) -> Stage {
        Stage::Convert
    }

    async fn execute(&self, ctx: &JobContext, inputs: &[ArtifactRef]) -> Result<StageOutput, StageError> {
        let input = inputs
            .first()
            .ok_or_else(|| StageError::permanent("job has no input artifact"))?;
        let bytes = ctx.read(inputs, &input.name).await?;
        let doc = convert(&ctx.source_name, &bytes)?;

        let empty_pages = doc.pages.iter().filter(|p| p.is_blank()).count();
        let mut metadata = Metadata::new();
        metadata.insert(keys::PAGES.into(), json!(doc.pages.len()));
        metadata.insert(keys::EMPTY_PAGES.into(), json!(empty_pages));
        metadata.insert("format".into(), json!(doc.format));

        let artifact = ctx.write_json(OUTPUT, &doc).await?;
        Ok(StageOutput {
            artifacts: vec![artifact],
            metadata,
        })
    }
}
