//! Document shapes handed from one stage to the next, serialized as JSON
//! artifacts.

use serde::{Deserialize, Serialize};

/// Input format detected by Convert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    Markdown,
    PlainText,
}

/// Convert output: the raw text split into pages of lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntermediateDoc {
    pub source_name: String,
    pub format: SourceFormat,
    pub pages: Vec<Page>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// 1-based.
    pub number: u32,
    pub lines: Vec<String>,
}

impl Page {
    pub fn is_blank(&self) -> bool {
        self.lines.iter().all(|l| l.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementKind {
    Heading { level: u8 },
    Paragraph,
    Table,
    Image { source: String },
    Equation,
    ListItem,
}

impl ElementKind {
    pub fn label(&self) -> &'static str {
        match self {
            ElementKind::Heading { .. } => "heading",
            ElementKind::Paragraph => "paragraph",
            ElementKind::Table => "table",
            ElementKind::Image { .. } => "image",
            ElementKind::Equation => "equation",
            ElementKind::ListItem => "list_item",
        }
    }
}

/// Extract output unit. Tables keep their rows newline-separated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    #[serde(flatten)]
    pub kind: ElementKind,
    pub text: String,
    pub page: u32,
}

impl Element {
    pub fn heading_level(&self) -> Option<u8> {
        match self.kind {
            ElementKind::Heading { level } => Some(level),
            _ => None,
        }
    }
}

/// Structure output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredDoc {
    pub title: String,
    pub sections: Vec<Section>,
    pub toc: Vec<TocEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    /// Stable anchor, `sec-1`, `sec-2`, ...
    pub id: String,
    pub title: String,
    pub level: u8,
    /// Created to hold content that appears before the first heading.
    #[serde(default)]
    pub synthetic: bool,
    pub elements: Vec<Element>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TocEntry {
    pub id: String,
    pub title: String,
    pub level: u8,
}
