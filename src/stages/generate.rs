use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use super::document::{Element, ElementKind, Section, StructuredDoc};
use super::{JobContext, StageExecutor, StageOutput, keys, structure};
use crate::error::StageError;
use crate::state_machine::{Metadata, Stage};
use crate::store::ArtifactRef;

pub const DOCUMENT: &str = "document.html";
pub const NAVIGATION: &str = "nav.html";
pub const METADATA: &str = "metadata.json";

pub const PLACEHOLDER: &str =
    r#"<p class="placeholder">No extractable content was found for this section.</p>"#;

/// Structured document to HTML body, navigation and metadata.
pub struct GenerateExecutor;

pub(crate) fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn table_cells(row: &str) -> Vec<String> {
    row.trim()
        .trim_start_matches('|')
        .trim_end_matches('|')
        .split('|')
        .map(|c| escape_html(c.trim()))
        .collect()
}

fn render_table(text: &str, out: &mut String) {
    out.push_str("<table>\n");
    for (i, row) in text.lines().enumerate() {
        let tag = if i == 0 { "th" } else { "td" };
        out.push_str("<tr>");
        for cell in table_cells(row) {
            out.push_str(&format!("<{tag}>{cell}</{tag}>"));
        }
        out.push_str("</tr>\n");
    }
    out.push_str("</table>\n");
}

fn render_elements(elements: &[Element], out: &mut String) {
    let mut in_list = false;
    for element in elements {
        let is_item = element.kind == ElementKind::ListItem;
        if in_list && !is_item {
            out.push_str("</ul>\n");
        }
        if is_item && !in_list {
            out.push_str("<ul>\n");
        }
        in_list = is_item;

        let text = escape_html(&element.text);
        match &element.kind {
            ElementKind::ListItem => out.push_str(&format!("<li>{text}</li>\n")),
            ElementKind::Paragraph => out.push_str(&format!("<p>{text}</p>\n")),
            ElementKind::Equation => out.push_str(&format!("<pre class=\"equation\">{text}</pre>\n")),
            ElementKind::Table => render_table(&element.text, out),
            ElementKind::Image { source } => out.push_str(&format!(
                "<figure><img src=\"{}\" alt=\"{text}\"><figcaption>{text}</figcaption></figure>\n",
                escape_html(source)
            )),
            // Headings only live in section titles after Structure; render
            // a stray one as a plain subheading.
            ElementKind::Heading { level } => {
                let tag = (*level + 1).min(6);
                out.push_str(&format!("<h{tag}>{text}</h{tag}>\n"));
            }
        }
    }
    if in_list {
        out.push_str("</ul>\n");
    }
}

/// Rendered page plus the counts Score needs.
pub(crate) struct Rendered {
    pub body: String,
    pub nav: String,
    pub placeholders: usize,
    pub rendered_elements: usize,
}

pub(crate) fn render(doc: &StructuredDoc) -> Rendered {
    let fallback;
    let sections: &[Section] = if doc.sections.is_empty() {
        fallback = [Section {
            id: "sec-1".into(),
            title: doc.title.clone(),
            level: 1,
            synthetic: true,
            elements: Vec::new(),
        }];
        &fallback
    } else {
        &doc.sections
    };

    let mut body = String::new();
    let mut placeholders = 0;
    let mut rendered_elements = 0;

    body.push_str("<article class=\"document\">\n");
    body.push_str(&format!("<h1 class=\"doc-title\">{}</h1>\n", escape_html(&doc.title)));
    for section in sections {
        body.push_str(&format!("<section id=\"{}\">\n", escape_html(&section.id)));
        if !section.synthetic {
            let tag = (section.level + 1).min(6);
            body.push_str(&format!("<h{tag}>{}</h{tag}>\n", escape_html(&section.title)));
            rendered_elements += 1;
        }
        if section.elements.is_empty() {
            body.push_str(PLACEHOLDER);
            body.push('\n');
            placeholders += 1;
        } else {
            render_elements(&section.elements, &mut body);
            rendered_elements += section.elements.len();
        }
        body.push_str("</section>\n");
    }
    body.push_str("</article>\n");

    let mut nav = String::from("<nav class=\"toc\">\n<ol>\n");
    for entry in &doc.toc {
        nav.push_str(&format!(
            "<li class=\"toc-level-{}\"><a href=\"#{}\">{}</a></li>\n",
            entry.level,
            escape_html(&entry.id),
            escape_html(&entry.title)
        ));
    }
    nav.push_str("</ol>\n</nav>\n");

    Rendered {
        body,
        nav,
        placeholders,
        rendered_elements,
    }
}

#[async_trait]
impl StageExecutor for GenerateExecutor {
    fn stage(&self) -> Stage {
        Stage::Generate
    }

    async fn execute(&self, ctx: &JobContext, inputs: &[ArtifactRef]) -> Result<StageOutput, StageError> {
        let doc: StructuredDoc = ctx.read_json(inputs, structure::OUTPUT).await?;
        let rendered = render(&doc);

        let element_total: usize = doc.sections.iter().map(|s| s.elements.len()).sum();
        let info = json!({
            "title": doc.title,
            "source_name": ctx.source_name,
            "sections": doc.sections.len(),
            "elements": element_total,
            "placeholders": rendered.placeholders,
            "generated_at": Utc::now(),
        });

        let body = ctx.write(DOCUMENT, rendered.body.into_bytes()).await?;
        let nav = ctx.write(NAVIGATION, rendered.nav.into_bytes()).await?;
        let meta = ctx.write_json(METADATA, &info).await?;

        let mut metadata = Metadata::new();
        metadata.insert(keys::RENDERED_ELEMENTS.into(), json!(rendered.rendered_elements));
        metadata.insert(keys::PLACEHOLDER_COUNT.into(), json!(rendered.placeholders));
        Ok(StageOutput {
            artifacts: vec![body, nav, meta],
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::document::TocEntry;
    use crate::stages::test_support::context;
    use crate::store::MemoryArtifactStore;
    use std::sync::Arc;

    fn section(id: &str, title: &str, elements: Vec<Element>) -> Section {
        Section {
            id: id.into(),
            title: title.into(),
            level: 1,
            synthetic: false,
            elements,
        }
    }

    fn element(kind: ElementKind, text: &str) -> Element {
        Element {
            kind,
            text: text.into(),
            page: 1,
        }
    }

    #[test]
    fn empty_section_renders_placeholder() {
        let doc = StructuredDoc {
            title: "T".into(),
            sections: vec![
                section("sec-1", "Filled", vec![element(ElementKind::Paragraph, "x")]),
                section("sec-2", "Empty", vec![]),
            ],
            toc: vec![],
        };
        let rendered = render(&doc);
        assert_eq!(rendered.placeholders, 1);
        assert!(rendered.body.contains(PLACEHOLDER));
        assert!(rendered.body.contains("<section id=\"sec-2\">\n<h2>Empty</h2>"));
        assert_eq!(rendered.rendered_elements, 3);
    }

    #[test]
    fn document_without_sections_still_renders() {
        let doc = StructuredDoc {
            title: "Nothing here".into(),
            sections: vec![],
            toc: vec![],
        };
        let rendered = render(&doc);
        assert!(!rendered.body.is_empty());
        assert_eq!(rendered.placeholders, 1);
        assert!(rendered.body.contains("Nothing here"));
    }

    #[test]
    fn renders_lists_tables_and_escapes() {
        let mut out = String::new();
        render_elements(
            &[
                element(ElementKind::ListItem, "a < b"),
                element(ElementKind::ListItem, "c"),
                element(ElementKind::Table, "| h1 | h2 |\n| 1 | 2 |"),
                element(
                    ElementKind::Image {
                        source: "fig.png".into(),
                    },
                    "Fig \"1\"",
                ),
            ],
            &mut out,
        );
        assert!(out.starts_with("<ul>\n<li>a &lt; b</li>\n<li>c</li>\n</ul>\n"));
        assert!(out.contains("<tr><th>h1</th><th>h2</th></tr>"));
        assert!(out.contains("<tr><td>1</td><td>2</td></tr>"));
        assert!(out.contains("alt=\"Fig &quot;1&quot;\""));
    }

    #[tokio::test]
    async fn execute_writes_three_artifacts() {
        let store = Arc::new(MemoryArtifactStore::new());
        let doc = StructuredDoc {
            title: "Guide".into(),
            sections: vec![section("sec-1", "Guide", vec![])],
            toc: vec![TocEntry {
                id: "sec-1".into(),
                title: "Guide".into(),
                level: 1,
            }],
        };
        let input = context(Stage::Structure, store.clone())
            .write_json(structure::OUTPUT, &doc)
            .await
            .unwrap();
        let ctx = context(Stage::Generate, store);

        let output = GenerateExecutor.execute(&ctx, &[input]).await.unwrap();
        let names: Vec<&str> = output.artifacts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec![DOCUMENT, NAVIGATION, METADATA]);
        assert_eq!(output.metadata[keys::PLACEHOLDER_COUNT], json!(1));

        let nav = ctx.read(&output.artifacts, NAVIGATION).await.unwrap();
        assert!(String::from_utf8(nav).unwrap().contains("<a href=\"#sec-1\">Guide</a>"));
    }
}
