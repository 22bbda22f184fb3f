use async_trait::async_trait;
use serde_json::{Value, json};

use super::document::{Element, Section, StructuredDoc, TocEntry};
use super::{JobContext, StageExecutor, StageOutput, extract, keys, record_analysis};
use crate::error::StageError;
use crate::gateway::{AnalysisRequest, AnalysisTask};
use crate::state_machine::{Metadata, Stage};
use crate::store::ArtifactRef;

pub const OUTPUT: &str = "structure.json";

/// Title of the section that holds content found before the first heading.
const PREAMBLE_TITLE: &str = "Overview";

/// Elements to sections, headings and a table of contents.
pub struct StructureExecutor;

/// Outline of the document as `(sections, level_skips)`.
pub(crate) fn build_sections(elements: &[Element]) -> (Vec<Section>, usize) {
    let mut sections: Vec<Section> = Vec::new();
    let mut previous_level: Option<u8> = None;
    let mut level_skips = 0;

    for element in elements {
        match element.heading_level() {
            Some(level) => {
                if let Some(prev) = previous_level
                    && level > prev + 1
                {
                    level_skips += 1;
                }
                previous_level = Some(level);
                sections.push(Section {
                    id: format!("sec-{}", sections.len() + 1),
                    title: element.text.clone(),
                    level,
                    synthetic: false,
                    elements: Vec::new(),
                });
            }
            None => {
                if sections.is_empty() {
                    sections.push(Section {
                        id: "sec-1".into(),
                        title: PREAMBLE_TITLE.into(),
                        level: 1,
                        synthetic: true,
                        elements: Vec::new(),
                    });
                }
                if let Some(current) = sections.last_mut() {
                    current.elements.push(element.clone());
                }
            }
        }
    }
    (sections, level_skips)
}

fn outline(sections: &[Section], elements: &[Element]) -> String {
    let mut lines: Vec<String> = sections
        .iter()
        .filter(|s| !s.synthetic)
        .map(|s| format!("{} {} ({} elements)", "#".repeat(s.level as usize), s.title, s.elements.len()))
        .collect();
    if let Some(first) = elements.iter().find(|e| e.heading_level().is_none()) {
        let preview: String = first.text.chars().take(200).collect();
        lines.push(format!("First paragraph: {preview}"));
    }
    lines.join("\n")
}

fn source_stem(source_name: &str) -> String {
    let file = source_name.rsplit(['/', '\\']).next().unwrap_or(source_name);
    let stem = file.rsplit_once('.').map(|(s, _)| s).unwrap_or(file);
    if stem.is_empty() {
        "Untitled document".to_string()
    } else {
        stem.to_string()
    }
}

/// First level-1 heading, then the provider's suggestion, then the file name.
fn choose_title(sections: &[Section], suggestion: &Value, source_name: &str) -> (String, &'static str) {
    if let Some(h1) = sections.iter().find(|s| !s.synthetic && s.level == 1) {
        return (h1.title.clone(), "heading");
    }
    if let Some(title) = suggestion.get("title").and_then(Value::as_str)
        && !title.trim().is_empty()
    {
        return (title.trim().to_string(), "provider");
    }
    (source_stem(source_name), "source_name")
}

#[async_trait]
impl StageExecutor for StructureExecutor {
    fn stage(&self) -> Stage {
        Stage::Structure
    }

    async fn execute(&self, ctx: &JobContext, inputs: &[ArtifactRef]) -> Result<StageOutput, StageError> {
        let elements: Vec<Element> = ctx.read_json(inputs, extract::OUTPUT).await?;
        let (sections, level_skips) = build_sections(&elements);

        let request = AnalysisRequest::new(AnalysisTask::Structure, outline(&sections, &elements));
        let analysis = ctx.gateway().analyze(&request).await?;
        let (title, title_source) = choose_title(&sections, &analysis.result, &ctx.source_name);

        let toc = sections
            .iter()
            .filter(|s| !s.synthetic)
            .map(|s| TocEntry {
                id: s.id.clone(),
                title: s.title.clone(),
                level: s.level,
            })
            .collect();
        let empty_sections = sections.iter().filter(|s| s.elements.is_empty()).count();

        let mut metadata = Metadata::new();
        record_analysis(&mut metadata, &analysis);
        metadata.insert(keys::SECTION_COUNT.into(), json!(sections.len()));
        metadata.insert(keys::EMPTY_SECTIONS.into(), json!(empty_sections));
        metadata.insert(keys::LEVEL_SKIPS.into(), json!(level_skips));
        metadata.insert("title_source".into(), json!(title_source));

        let doc = StructuredDoc { title, sections, toc };
        let artifact = ctx.write_json(OUTPUT, &doc).await?;
        Ok(StageOutput {
            artifacts: vec![artifact],
            metadata,
        })
    }
}
