use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::document::{Element, ElementKind, IntermediateDoc};
use super::{JobContext, StageExecutor, StageOutput, convert, keys, record_analysis};
use crate::error::StageError;
use crate::gateway::{AnalysisRequest, AnalysisTask};
use crate::state_machine::{Metadata, Stage};
use crate::store::ArtifactRef;

pub const OUTPUT: &str = "elements.json";

/// Longest element text quoted to the provider.
const PREVIEW_CHARS: usize = 160;

/// Paged text to typed content elements, with AI layout confirmation.
pub struct ExtractExecutor;

/// `## Title` → (2, "Title").
fn markdown_heading(line: &str) -> Option<(u8, &str)> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if !(1..=6).contains(&hashes) {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.starts_with(' ') || rest.trim().is_empty() {
        return None;
    }
    Some((hashes as u8, rest.trim()))
}

enum Numbered<'a> {
    Heading(u8, &'a str),
    ListItem(&'a str),
}

/// `2.1 Scope` is a heading, `3. Buy milk` a list item.
fn numbered_line(line: &str) -> Option<Numbered<'_>> {
    let (token, rest) = line.split_once(' ')?;
    if token.is_empty() || !token.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    let parts: Vec<&str> = token.split('.').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() || parts.iter().any(|p| !p.chars().all(|c| c.is_ascii_digit())) {
        return None;
    }
    let rest = rest.trim();
    if rest.is_empty() {
        return None;
    }
    if parts.len() == 1 && token.ends_with('.') {
        return Some(Numbered::ListItem(rest));
    }
    let looks_like_title = rest.chars().next().is_some_and(char::is_uppercase)
        && rest.chars().count() <= 80
        && !rest.ends_with('.');
    looks_like_title.then(|| Numbered::Heading(parts.len().min(6) as u8, rest))
}

/// `![alt](src)` → (alt, src).
fn image(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix("![")?;
    let (alt, rest) = rest.split_once("](")?;
    let source = rest.strip_suffix(')')?;
    Some((alt, source))
}

fn is_table_separator(line: &str) -> bool {
    line.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

#[derive(Default)]
struct Builder {
    elements: Vec<Element>,
    paragraph: Vec<String>,
    table: Vec<String>,
    equation: Option<Vec<String>>,
    page: u32,
}

impl Builder {
    fn push(&mut self, kind: ElementKind, text: impl Into<String>) {
        self.elements.push(Element {
            kind,
            text: text.into(),
            page: self.page,
        });
    }

    fn flush_paragraph(&mut self) {
        if !self.paragraph.is_empty() {
            let text = self.paragraph.join(" ");
            self.paragraph.clear();
            self.push(ElementKind::Paragraph, text);
        }
    }

    fn flush_table(&mut self) {
        if !self.table.is_empty() {
            let text = self.table.join("\n");
            self.table.clear();
            self.push(ElementKind::Table, text);
        }
    }

    fn flush(&mut self) {
        self.flush_paragraph();
        self.flush_table();
        if let Some(lines) = self.equation.take() {
            self.push(ElementKind::Equation, lines.join("\n"));
        }
    }

    fn line(&mut self, raw: &str) {
        let line = raw.trim();

        if let Some(lines) = self.equation.as_mut() {
            if let Some(body) = line.strip_suffix("$$") {
                if !body.trim().is_empty() {
                    lines.push(body.trim().to_string());
                }
                let lines = self.equation.take().unwrap_or_default();
                self.push(ElementKind::Equation, lines.join("\n"));
            } else {
                lines.push(line.to_string());
            }
            return;
        }

        if line.starts_with('|') {
            self.flush_paragraph();
            if !is_table_separator(line) {
                self.table.push(line.to_string());
            }
            return;
        }
        self.flush_table();

        if line.is_empty() {
            self.flush_paragraph();
            return;
        }

        if let Some(body) = line.strip_prefix("$$") {
            self.flush_paragraph();
            match body.strip_suffix("$$") {
                Some(inline) => self.push(ElementKind::Equation, inline.trim()),
                None => {
                    let first = body.trim();
                    self.equation = Some(if first.is_empty() { vec![] } else { vec![first.to_string()] });
                }
            }
            return;
        }

        if let Some((level, title)) = markdown_heading(line) {
            self.flush_paragraph();
            self.push(ElementKind::Heading { level }, title);
            return;
        }

        if let Some((alt, source)) = image(line) {
            self.flush_paragraph();
            self.push(
                ElementKind::Image {
                    source: source.to_string(),
                },
                alt,
            );
            return;
        }

        if let Some(item) = ["- ", "* ", "+ "].iter().find_map(|m| line.strip_prefix(m)) {
            self.flush_paragraph();
            self.push(ElementKind::ListItem, item.trim());
            return;
        }

        match numbered_line(line) {
            Some(Numbered::Heading(level, title)) => {
                self.flush_paragraph();
                self.push(ElementKind::Heading { level }, title);
            }
            Some(Numbered::ListItem(item)) => {
                self.flush_paragraph();
                self.push(ElementKind::ListItem, item);
            }
            None => self.paragraph.push(line.to_string()),
        }
    }
}

/// Classify every line of `doc` into elements, in reading order.
pub(crate) fn extract_elements(doc: &IntermediateDoc) -> Vec<Element> {
    let mut builder = Builder::default();
    for page in &doc.pages {
        builder.flush();
        builder.page = page.number;
        for line in &page.lines {
            builder.line(line);
        }
    }
    builder.flush();
    builder.elements
}

/// One line per element, as the provider sees the layout.
fn layout_summary(elements: &[Element]) -> String {
    elements
        .iter()
        .map(|e| {
            let preview: String = e.text.chars().take(PREVIEW_CHARS).collect();
            format!("[{}] {}", e.kind.label(), preview.replace('\n', " / "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Promote paragraphs the provider flagged as headings. Returns how many
/// elements changed.
fn apply_heading_hints(elements: &mut [Element], hints: &Value) -> usize {
    let Some(hints) = hints.get("headings").and_then(Value::as_array) else {
        return 0;
    };
    let hints: Vec<&str> = hints.iter().filter_map(Value::as_str).map(str::trim).collect();
    let mut promoted = 0;
    for element in elements.iter_mut() {
        if element.kind == ElementKind::Paragraph && hints.contains(&element.text.trim()) {
            element.kind = ElementKind::Heading { level: 2 };
            promoted += 1;
        }
    }
    promoted
}

#[async_trait]
impl StageExecutor for ExtractExecutor {
    fn stage(&self) -> Stage {
        Stage::Extract
    }

    async fn execute(&self, ctx: &JobContext, inputs: &[ArtifactRef]) -> Result<StageOutput, StageError> {
        let doc: IntermediateDoc = ctx.read_json(inputs, convert::OUTPUT).await?;
        let mut elements = extract_elements(&doc);

        let request = AnalysisRequest::new(AnalysisTask::Layout, layout_summary(&elements));
        let analysis = ctx.gateway().analyze(&request).await?;
        let promoted = apply_heading_hints(&mut elements, &analysis.result);
        debug!(job_id = %ctx.job_id, elements = elements.len(), promoted, provider = %analysis.provider, "layout confirmed");

        let headings = elements.iter().filter(|e| e.heading_level().is_some()).count();
        let mut metadata = Metadata::new();
        record_analysis(&mut metadata, &analysis);
        metadata.insert(keys::ELEMENT_COUNT.into(), json!(elements.len()));
        metadata.insert(keys::HEADINGS_DETECTED.into(), json!(headings));
        metadata.insert("headings_promoted".into(), json!(promoted));

        let artifact = ctx.write_json(OUTPUT, &elements).await?;
        Ok(StageOutput {
            artifacts: vec![artifact],
            metadata,
        })
    }
}
