//! Quality scoring for a finished conversion.
//!
//! Scores are built only from what earlier stages recorded in their attempt
//! metadata, so a job can be re-scored from its log without touching any
//! artifact. Each dimension is normalized to 0-100; dimensions without data
//! drop out and the remaining weights are renormalized.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stages::keys;
use crate::state_machine::{AttemptOutcome, Metadata, Stage, StageAttempt};

pub const STRUCTURAL_FIDELITY: &str = "structural_fidelity";
pub const CONTENT_COMPLETENESS: &str = "content_completeness";
pub const AI_CONFIDENCE: &str = "ai_confidence";
pub const ANOMALY_FREEDOM: &str = "anomaly_freedom";

/// Relative weight of each dimension in the overall score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    #[serde(default = "default_structural")]
    pub structural_fidelity: f64,
    #[serde(default = "default_completeness")]
    pub content_completeness: f64,
    #[serde(default = "default_confidence")]
    pub ai_confidence: f64,
    #[serde(default = "default_anomaly")]
    pub anomaly_freedom: f64,
}

fn default_structural() -> f64 {
    0.30
}

fn default_completeness() -> f64 {
    0.25
}

fn default_confidence() -> f64 {
    0.30
}

fn default_anomaly() -> f64 {
    0.15
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            structural_fidelity: default_structural(),
            content_completeness: default_completeness(),
            ai_confidence: default_confidence(),
            anomaly_freedom: default_anomaly(),
        }
    }
}

impl ScoringWeights {
    pub fn sum(&self) -> f64 {
        self.structural_fidelity + self.content_completeness + self.ai_confidence + self.anomaly_freedom
    }

    /// Name of the first weight below zero, if any.
    pub fn first_negative(&self) -> Option<&'static str> {
        [
            (STRUCTURAL_FIDELITY, self.structural_fidelity),
            (CONTENT_COMPLETENESS, self.content_completeness),
            (AI_CONFIDENCE, self.ai_confidence),
            (ANOMALY_FREEDOM, self.anomaly_freedom),
        ]
        .into_iter()
        .find(|(_, w)| *w < 0.0 || w.is_nan())
        .map(|(name, _)| name)
    }

    fn weight(&self, dimension: &str) -> f64 {
        match dimension {
            STRUCTURAL_FIDELITY => self.structural_fidelity,
            CONTENT_COMPLETENESS => self.content_completeness,
            AI_CONFIDENCE => self.ai_confidence,
            ANOMALY_FREEDOM => self.anomaly_freedom,
            _ => 0.0,
        }
    }
}

/// `[scoring]` section of `docpipe.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default)]
    pub weights: ScoringWeights,

    /// Points taken off anomaly freedom per anomaly.
    #[serde(default = "default_anomaly_penalty")]
    pub anomaly_penalty: f64,

    /// Provider confidence below this is reported as an anomaly.
    #[serde(default = "default_low_confidence_threshold")]
    pub low_confidence_threshold: f64,
}

fn default_anomaly_penalty() -> f64 {
    10.0
}

fn default_low_confidence_threshold() -> f64 {
    0.7
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            anomaly_penalty: default_anomaly_penalty(),
            low_confidence_threshold: default_low_confidence_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub stage: Stage,
    pub code: String,
    pub message: String,
}

/// Score of one completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Weighted average of `categories`, 0-100.
    pub overall: f64,
    pub categories: BTreeMap<String, f64>,
    pub anomalies: Vec<Anomaly>,
    pub generated_at: DateTime<Utc>,
}

fn number(metadata: &Metadata, key: &str) -> Option<f64> {
    metadata.get(key).and_then(Value::as_f64)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Latest successful attempt per stage, in log order.
fn successes(attempts: &[StageAttempt]) -> BTreeMap<Stage, &StageAttempt> {
    let mut latest = BTreeMap::new();
    for attempt in attempts.iter().filter(|a| a.is_success()) {
        latest.insert(attempt.stage, attempt);
    }
    latest
}

/// Build a report from a job's attempt log.
pub fn evaluate(attempts: &[StageAttempt], config: &ScoringConfig) -> QualityReport {
    let done = successes(attempts);
    let meta = |stage: Stage| done.get(&stage).map(|a| &a.metadata);
    let mut anomalies = Vec::new();
    let mut anomaly = |stage: Stage, code: &str, message: String| {
        anomalies.push(Anomaly {
            stage,
            code: code.to_string(),
            message,
        })
    };

    for stage in Stage::ALL {
        let retries = attempts
            .iter()
            .filter(|a| a.stage == stage && a.outcome == AttemptOutcome::TransientFailure)
            .count();
        if retries > 0 {
            anomaly(stage, "retried", format!("{stage} needed {retries} retr{}", if retries == 1 { "y" } else { "ies" }));
        }
    }

    let mut categories = BTreeMap::new();

    // Structure: heading coverage and hierarchy.
    let headings = meta(Stage::Extract).and_then(|m| number(m, keys::HEADINGS_DETECTED));
    let level_skips = meta(Stage::Structure).and_then(|m| number(m, keys::LEVEL_SKIPS));
    if headings.is_some() || level_skips.is_some() {
        let mut score = 100.0;
        if headings == Some(0.0) {
            score -= 30.0;
            anomaly(Stage::Extract, "no_headings", "no headings were detected".into());
        }
        if let Some(skips) = level_skips
            && skips > 0.0
        {
            score -= 10.0 * skips;
            anomaly(Stage::Structure, "heading_level_skip", format!("{skips} heading level skip(s)"));
        }
        categories.insert(STRUCTURAL_FIDELITY.to_string(), score);
    }
    if let Some(empty) = meta(Stage::Structure).and_then(|m| number(m, keys::EMPTY_SECTIONS))
        && empty > 0.0
    {
        anomaly(Stage::Structure, "empty_sections", format!("{empty} section(s) without content"));
    }

    // Completeness: pages with text and sections with content.
    let mut completeness: Option<f64> = None;
    if let Some(m) = meta(Stage::Convert)
        && let Some(pages) = number(m, keys::PAGES)
        && pages > 0.0
    {
        let empty = number(m, keys::EMPTY_PAGES).unwrap_or(0.0);
        if empty > 0.0 {
            anomaly(Stage::Convert, "empty_pages", format!("{empty} of {pages} page(s) are blank"));
        }
        completeness = Some(100.0 * (pages - empty) / pages);
    }
    if let Some(m) = meta(Stage::Generate)
        && let Some(rendered) = number(m, keys::RENDERED_ELEMENTS)
    {
        let placeholders = number(m, keys::PLACEHOLDER_COUNT).unwrap_or(0.0);
        if placeholders > 0.0 {
            anomaly(Stage::Generate, "placeholders", format!("{placeholders} placeholder(s) rendered"));
        }
        let total = rendered + placeholders;
        let ratio = if total > 0.0 { rendered / total } else { 0.0 };
        completeness = Some(completeness.unwrap_or(100.0) * ratio);
    }
    if let Some(score) = completeness {
        categories.insert(CONTENT_COMPLETENESS.to_string(), score);
    }

    // AI confidence: mean over every stage that asked a provider.
    let mut confidences = Vec::new();
    for (stage, attempt) in &done {
        let Some(confidence) = number(&attempt.metadata, keys::CONFIDENCE) else {
            continue;
        };
        confidences.push(confidence);
        if confidence < config.low_confidence_threshold {
            anomaly(*stage, "low_confidence", format!("provider confidence {confidence:.2}"));
        }
        if let Some(fallbacks) = number(&attempt.metadata, keys::FALLBACKS)
            && fallbacks > 0.0
        {
            let provider = attempt
                .metadata
                .get(keys::PROVIDER)
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            anomaly(*stage, "provider_fallback", format!("answered by fallback provider `{provider}`"));
        }
    }
    if !confidences.is_empty() {
        let mean = confidences.iter().sum::<f64>() / confidences.len() as f64;
        categories.insert(AI_CONFIDENCE.to_string(), 100.0 * mean);
    }

    let anomaly_count = anomalies.len() as f64;
    categories.insert(
        ANOMALY_FREEDOM.to_string(),
        100.0 - config.anomaly_penalty * anomaly_count,
    );

    for value in categories.values_mut() {
        *value = round2(value.clamp(0.0, 100.0));
    }

    let total_weight: f64 = categories.keys().map(|k| config.weights.weight(k)).sum();
    let overall = if total_weight > 0.0 {
        categories
            .iter()
            .map(|(k, v)| config.weights.weight(k) * v)
            .sum::<f64>()
            / total_weight
    } else {
        0.0
    };

    QualityReport {
        overall: round2(overall.clamp(0.0, 100.0)),
        categories,
        anomalies,
        generated_at: Utc::now(),
    }
}
