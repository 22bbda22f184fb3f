use async_trait::async_trait;
use serde_json::json;

use super::provider::{AnalysisProvider, AnalysisRequest, AnalysisTask, ProviderError, ProviderResponse};

/// Offline provider that judges content by how clean its lines look.
///
/// Suggests nothing and costs nothing; its only job is to put a
/// deterministic confidence behind layouts the local parser already found.
#[derive(Debug, Clone)]
pub struct HeuristicProvider {
    name: String,
}

impl HeuristicProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for HeuristicProvider {
    fn default() -> Self {
        Self::new("heuristic")
    }
}

/// A line is clean when at least 80% of its characters are ordinary text.
fn is_clean_line(line: &str) -> bool {
    let total = line.chars().count();
    let ordinary = line
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || c.is_ascii_punctuation())
        .count();
    ordinary * 5 >= total * 4
}

/// Share of non-blank lines that look clean. Blank content counts as clean.
pub(crate) fn clean_line_ratio(content: &str) -> f64 {
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return 1.0;
    }
    let clean = lines.iter().filter(|l| is_clean_line(l)).count();
    clean as f64 / lines.len() as f64
}

#[async_trait]
impl AnalysisProvider for HeuristicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<ProviderResponse, ProviderError> {
        let confidence = 0.5 + 0.45 * clean_line_ratio(&request.content);
        let result = match request.task {
            AnalysisTask::Layout => json!({ "headings": [] }),
            AnalysisTask::Structure => json!({ "title": null }),
        };
        Ok(ProviderResponse {
            result,
            confidence,
            cost_usd: 0.0,
        })
    }
}
