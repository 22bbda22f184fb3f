//! AI provider gateway: one capability, an ordered chain of providers.
//!
//! Every call is bounded by a timeout. A transient failure is retried once
//! on the same provider before the gateway falls back to the next one; an
//! answer below the confidence threshold falls back straight away. The
//! gateway never hands back a partial result.

mod health;
mod heuristic;
mod provider;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use health::{HealthTracker, ProviderHealth};
pub use heuristic::HeuristicProvider;
pub use provider::{
    AnalysisProvider, AnalysisRequest, AnalysisTask, ProviderError, ProviderResponse,
};

use crate::anthropic::{AnthropicError, AnthropicProvider, AnthropicProviderConfig};

/// `[[gateway.providers]]` entry. Order in the file is preference order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    Anthropic(AnthropicProviderConfig),
    Heuristic {
        #[serde(default = "default_heuristic_name")]
        name: String,
    },
}

impl ProviderConfig {
    pub fn name(&self) -> &str {
        match self {
            ProviderConfig::Anthropic(cfg) => &cfg.name,
            ProviderConfig::Heuristic { name } => name,
        }
    }
}

fn default_heuristic_name() -> String {
    "heuristic".to_string()
}

/// `[gateway]` section of `docpipe.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Upper bound for a single provider call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Answers below this confidence fall back to the next provider.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// In-place retries of a transient failure before falling back.
    #[serde(default = "default_in_place_retries")]
    pub in_place_retries: u32,

    /// Consecutive transient failures that take a provider down.
    #[serde(default = "default_unhealthy_after")]
    pub unhealthy_after: u32,

    /// How long a provider stays down.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,
}

fn default_call_timeout_secs() -> u64 {
    60
}

fn default_min_confidence() -> f64 {
    0.6
}

fn default_in_place_retries() -> u32 {
    1
}

fn default_unhealthy_after() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig::Anthropic(AnthropicProviderConfig::default()),
        ProviderConfig::Heuristic {
            name: default_heuristic_name(),
        },
    ]
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            min_confidence: default_min_confidence(),
            in_place_retries: default_in_place_retries(),
            unhealthy_after: default_unhealthy_after(),
            cooldown_secs: default_cooldown_secs(),
            providers: default_providers(),
        }
    }
}

impl GatewayConfig {
    /// First provider name that appears more than once. Health is tracked
    /// per name, so names must be unique within the chain.
    pub fn duplicate_provider_name(&self) -> Option<&str> {
        self.providers
            .iter()
            .enumerate()
            .find(|(i, p)| self.providers[..*i].iter().any(|q| q.name() == p.name()))
            .map(|(_, p)| p.name())
    }
}

/// Runtime knobs of the gateway, resolved from [`GatewayConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayPolicy {
    pub call_timeout: Duration,
    pub min_confidence: f64,
    pub in_place_retries: u32,
    pub unhealthy_after: u32,
    pub cooldown: Duration,
}

impl Default for GatewayPolicy {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

impl From<&GatewayConfig> for GatewayPolicy {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            min_confidence: config.min_confidence,
            // More than one in-place retry just burns the stage timeout.
            in_place_retries: config.in_place_retries.min(1),
            unhealthy_after: config.unhealthy_after,
            cooldown: Duration::from_secs(config.cooldown_secs),
        }
    }
}

/// Accepted answer plus the bookkeeping stages record in their metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub result: Value,
    pub confidence: f64,
    /// Cost of every call made for this request, discarded answers included.
    pub cost_usd: f64,
    pub provider: String,
    pub calls: u32,
    /// How many providers were passed over before `provider` answered.
    pub fallbacks: u32,
}

/// Why one provider did not produce the answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderFailure {
    pub provider: String,
    pub reason: String,
    pub transient: bool,
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.provider, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("no AI providers configured")]
    NoProviders,

    #[error("all AI providers failed ({})", summarize(.failures))]
    Exhausted {
        /// At least one provider failed in a way a later retry could fix.
        transient: bool,
        failures: Vec<ProviderFailure>,
    },
}

fn summarize(failures: &[ProviderFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::NoProviders => false,
            GatewayError::Exhausted { transient, .. } => *transient,
        }
    }
}

pub struct ProviderGateway {
    providers: Vec<Arc<dyn AnalysisProvider>>,
    policy: GatewayPolicy,
    health: HealthTracker,
}

impl ProviderGateway {
    pub fn new(providers: Vec<Arc<dyn AnalysisProvider>>, policy: GatewayPolicy) -> Self {
        let health = HealthTracker::new(policy.unhealthy_after, policy.cooldown);
        Self {
            providers,
            policy,
            health,
        }
    }

    /// Build the provider chain described by `config`. Anthropic entries
    /// share `api_key`; with an empty key they report themselves unavailable.
    pub fn from_config(config: &GatewayConfig, api_key: &str) -> Result<Self, AnthropicError> {
        let mut providers: Vec<Arc<dyn AnalysisProvider>> = Vec::new();
        for entry in &config.providers {
            match entry {
                ProviderConfig::Anthropic(cfg) => {
                    providers.push(Arc::new(AnthropicProvider::from_config(cfg, api_key)?));
                }
                ProviderConfig::Heuristic { name } => {
                    providers.push(Arc::new(HeuristicProvider::new(name.clone())));
                }
            }
        }
        Ok(Self::new(providers, GatewayPolicy::from(config)))
    }

    /// Offline gateway backed only by the heuristic provider.
    pub fn heuristic() -> Self {
        let provider: Arc<dyn AnalysisProvider> = Arc::new(HeuristicProvider::default());
        Self::new(vec![provider], GatewayPolicy::default())
    }

    pub fn policy(&self) -> &GatewayPolicy {
        &self.policy
    }

    pub fn health(&self) -> Vec<ProviderHealth> {
        self.providers
            .iter()
            .map(|p| self.health.snapshot(p.name(), p.is_available()))
            .collect()
    }

    async fn call(
        &self,
        provider: &dyn AnalysisProvider,
        request: &AnalysisRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let timeout = self.policy.call_timeout;
        tokio::time::timeout(timeout, provider.analyze(request))
            .await
            .unwrap_or(Err(ProviderError::Timeout(timeout)))
    }

    /// Run `request` down the provider chain until one answer clears the
    /// confidence threshold.
    pub async fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, GatewayError> {
        if self.providers.is_empty() {
            return Err(GatewayError::NoProviders);
        }

        let mut failures = Vec::new();
        let mut cost_usd = 0.0;
        let mut calls = 0u32;

        for (index, provider) in self.providers.iter().enumerate() {
            let name = provider.name();
            if !provider.is_available() {
                debug!(provider = name, "provider not available, skipping");
                failures.push(ProviderFailure {
                    provider: name.to_string(),
                    reason: "not available".into(),
                    transient: false,
                });
                continue;
            }
            if self.health.is_down(name) {
                debug!(provider = name, "provider marked down, skipping");
                failures.push(ProviderFailure {
                    provider: name.to_string(),
                    reason: "marked down after repeated failures".into(),
                    transient: true,
                });
                continue;
            }

            let mut tries = 0u32;
            let failure = loop {
                tries += 1;
                calls += 1;
                match self.call(provider.as_ref(), request).await {
                    Ok(response) => {
                        cost_usd += response.cost_usd;
                        self.health.record_success(name);
                        if response.confidence >= self.policy.min_confidence {
                            if index > 0 {
                                info!(provider = name, fallbacks = index, task = %request.task, "fallback provider answered");
                            }
                            return Ok(Analysis {
                                result: response.result,
                                confidence: response.confidence,
                                cost_usd,
                                provider: name.to_string(),
                                calls,
                                fallbacks: index as u32,
                            });
                        }
                        break ProviderFailure {
                            provider: name.to_string(),
                            reason: format!(
                                "confidence {:.2} below threshold {:.2}",
                                response.confidence, self.policy.min_confidence
                            ),
                            transient: false,
                        };
                    }
                    Err(err) => {
                        let transient = err.is_transient();
                        if transient {
                            self.health.record_failure(name);
                        } else {
                            self.health.record_call(name);
                        }
                        if transient
                            && tries <= self.policy.in_place_retries
                            && !self.health.is_down(name)
                        {
                            warn!(provider = name, error = %err, "provider call failed, retrying in place");
                            continue;
                        }
                        break ProviderFailure {
                            provider: name.to_string(),
                            reason: err.to_string(),
                            transient,
                        };
                    }
                }
            };

            warn!(provider = %failure.provider, reason = %failure.reason, task = %request.task, "falling back to next provider");
            failures.push(failure);
        }

        let transient = failures.iter().any(|f| f.transient);
        Err(GatewayError::Exhausted {
            transient,
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Plays back a fixed script of outcomes; `Sleep` outlives any test timeout.
    enum Step {
        Answer(f64),
        Fail(ProviderError),
        Sleep,
    }

    struct ScriptedProvider {
        name: String,
        available: bool,
        script: Mutex<VecDeque<Step>>,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(name: &str, steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                available: true,
                script: Mutex::new(steps.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn unavailable(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                available: false,
                script: Mutex::new(VecDeque::new()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl AnalysisProvider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_available(&self) -> bool {
            self.available
        }

        async fn analyze(&self, _request: &AnalysisRequest) -> Result<ProviderResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().unwrap().pop_front();
            match step {
                Some(Step::Answer(confidence)) => Ok(ProviderResponse {
                    result: json!({ "from": self.name }),
                    confidence,
                    cost_usd: 0.01,
                }),
                Some(Step::Fail(err)) => Err(err),
                Some(Step::Sleep) => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Err(ProviderError::Unavailable("woke up".into()))
                }
                None => Err(ProviderError::Unavailable("script exhausted".into())),
            }
        }
    }

    fn chain(providers: &[&Arc<ScriptedProvider>], policy: GatewayPolicy) -> ProviderGateway {
        let providers = providers
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn AnalysisProvider>)
            .collect();
        ProviderGateway::new(providers, policy)
    }

    fn policy() -> GatewayPolicy {
        GatewayPolicy {
            call_timeout: Duration::from_millis(20),
            min_confidence: 0.6,
            in_place_retries: 1,
            unhealthy_after: 3,
            cooldown: Duration::from_secs(60),
        }
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest::new(AnalysisTask::Layout, "# Title\nbody")
    }

    #[tokio::test]
    async fn first_confident_answer_wins() {
        let primary = ScriptedProvider::new("primary", vec![Step::Answer(0.9)]);
        let secondary = ScriptedProvider::new("secondary", vec![Step::Answer(0.9)]);
        let gateway = chain(&[&primary, &secondary], policy());

        let analysis = gateway.analyze(&request()).await.unwrap();
        assert_eq!(analysis.provider, "primary");
        assert_eq!(analysis.fallbacks, 0);
        assert_eq!(analysis.calls, 1);
        assert_eq!(secondary.calls(), 0);
    }

    #[tokio::test]
    async fn timeout_twice_then_falls_back() {
        let primary = ScriptedProvider::new("primary", vec![Step::Sleep, Step::Sleep]);
        let secondary = ScriptedProvider::new("secondary", vec![Step::Answer(0.8)]);
        let gateway = chain(&[&primary, &secondary], policy());

        let analysis = gateway.analyze(&request()).await.unwrap();
        assert_eq!(analysis.provider, "secondary");
        assert_eq!(analysis.fallbacks, 1);
        assert_eq!(analysis.calls, 3);
        assert_eq!(primary.calls(), 2);
        assert_eq!(secondary.calls(), 1);
    }

    #[tokio::test]
    async fn low_confidence_falls_back_without_retry() {
        let primary = ScriptedProvider::new("primary", vec![Step::Answer(0.3)]);
        let secondary = ScriptedProvider::new("secondary", vec![Step::Answer(0.7)]);
        let gateway = chain(&[&primary, &secondary], policy());

        let analysis = gateway.analyze(&request()).await.unwrap();
        assert_eq!(analysis.provider, "secondary");
        assert_eq!(primary.calls(), 1);
        // Both answers were paid for.
        assert!((analysis.cost_usd - 0.02).abs() < 1e-9);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried_in_place() {
        let primary = ScriptedProvider::new(
            "primary",
            vec![Step::Fail(ProviderError::Rejected("bad request".into()))],
        );
        let gateway = chain(&[&primary], policy());

        let err = gateway.analyze(&request()).await.unwrap_err();
        assert_eq!(primary.calls(), 1);
        assert!(!err.is_transient());
        assert!(err.to_string().contains("primary: request rejected: bad request"));
    }

    #[tokio::test]
    async fn exhaustion_with_a_transient_failure_is_transient() {
        let primary = ScriptedProvider::new(
            "primary",
            vec![
                Step::Fail(ProviderError::RateLimited { retry_after_ms: 5 }),
                Step::Fail(ProviderError::RateLimited { retry_after_ms: 5 }),
            ],
        );
        let secondary = ScriptedProvider::new("secondary", vec![Step::Answer(0.1)]);
        let gateway = chain(&[&primary, &secondary], policy());

        let err = gateway.analyze(&request()).await.unwrap_err();
        assert!(err.is_transient());
        match err {
            GatewayError::Exhausted { failures, .. } => assert_eq!(failures.len(), 2),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unavailable_providers_are_skipped() {
        let offline = ScriptedProvider::unavailable("offline");
        let backup = ScriptedProvider::new("backup", vec![Step::Answer(0.9)]);
        let gateway = chain(&[&offline, &backup], policy());

        let analysis = gateway.analyze(&request()).await.unwrap();
        assert_eq!(analysis.provider, "backup");
        assert_eq!(analysis.calls, 1);
        assert_eq!(offline.calls(), 0);
    }

    #[tokio::test]
    async fn down_provider_is_skipped_until_cooldown() {
        let mut p = policy();
        p.unhealthy_after = 2;
        let flaky = ScriptedProvider::new(
            "flaky",
            vec![
                Step::Fail(ProviderError::Unavailable("503".into())),
                Step::Fail(ProviderError::Unavailable("503".into())),
            ],
        );
        let backup = ScriptedProvider::new("backup", vec![Step::Answer(0.9), Step::Answer(0.9)]);
        let gateway = chain(&[&flaky, &backup], p);

        gateway.analyze(&request()).await.unwrap();
        assert_eq!(flaky.calls(), 2);

        // Second request does not touch the downed provider.
        let analysis = gateway.analyze(&request()).await.unwrap();
        assert_eq!(analysis.provider, "backup");
        assert_eq!(flaky.calls(), 2);

        let health = gateway.health();
        assert!(health[0].down);
        assert!(!health[1].down);
    }

    #[tokio::test]
    async fn empty_chain_is_a_permanent_error() {
        let gateway = ProviderGateway::new(Vec::new(), policy());
        let err = gateway.analyze(&request()).await.unwrap_err();
        assert_eq!(err, GatewayError::NoProviders);
        assert!(!err.is_transient());
    }

    #[test]
    fn policy_caps_in_place_retries() {
        let config = GatewayConfig {
            in_place_retries: 5,
            ..GatewayConfig::default()
        };
        assert_eq!(GatewayPolicy::from(&config).in_place_retries, 1);
    }

    #[test]
    fn provider_config_parses_tagged_entries() {
        let toml_str = r#"
            min_confidence = 0.75

            [[providers]]
            kind = "anthropic"
            model = "claude-haiku-4-5-20251001"

            [[providers]]
            kind = "heuristic"
        "#;
        let config: GatewayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.min_confidence, 0.75);
        assert_eq!(config.call_timeout_secs, 60);
        assert_eq!(config.providers.len(), 2);
        match &config.providers[0] {
            ProviderConfig::Anthropic(cfg) => assert_eq!(cfg.model, "claude-haiku-4-5-20251001"),
            other => panic!("expected anthropic, got {other:?}"),
        }
        assert_eq!(
            config.providers[1],
            ProviderConfig::Heuristic {
                name: "heuristic".into()
            }
        );
    }
}
