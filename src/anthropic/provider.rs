use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::client::{AnthropicClient, API_URL, MessageSender, REQUEST_TIMEOUT};
use super::error::AnthropicError;
use super::types::{Message, MessagesRequest, MessagesResponse};
use crate::gateway::{
    AnalysisProvider, AnalysisRequest, AnalysisTask, ProviderError, ProviderResponse,
};

/// Longest slice of document text sent in one request.
const MAX_CONTENT_CHARS: usize = 24_000;

const SYSTEM_PROMPT: &str = "You review documents that a parser has already split into \
elements. Reply with a single JSON object and nothing else. Always include a \
\"confidence\" number between 0 and 1 describing how well the parsed layout matches the text.";

/// `kind = "anthropic"` entry of `[[gateway.providers]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnthropicProviderConfig {
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Overrides the public API endpoint, e.g. for a proxy.
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// USD per million input tokens.
    #[serde(default = "default_input_cost")]
    pub input_cost_per_mtok: f64,

    /// USD per million output tokens.
    #[serde(default = "default_output_cost")]
    pub output_cost_per_mtok: f64,
}

fn default_name() -> String {
    "anthropic".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_input_cost() -> f64 {
    3.0
}

fn default_output_cost() -> f64 {
    15.0
}

impl Default for AnthropicProviderConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            model: default_model(),
            base_url: None,
            max_tokens: default_max_tokens(),
            input_cost_per_mtok: default_input_cost(),
            output_cost_per_mtok: default_output_cost(),
        }
    }
}

/// Gateway provider backed by the Messages API.
pub struct AnthropicProvider<S: MessageSender = AnthropicClient> {
    sender: S,
    config: AnthropicProviderConfig,
    available: bool,
}

impl AnthropicProvider<AnthropicClient> {
    pub fn from_config(config: &AnthropicProviderConfig, api_key: &str) -> Result<Self, AnthropicError> {
        let base_url = config.base_url.clone().unwrap_or_else(|| API_URL.to_string());
        let client = AnthropicClient::with_base_url(api_key.to_string(), base_url)?;
        let available = client.has_api_key();
        Ok(Self {
            sender: client,
            config: config.clone(),
            available,
        })
    }
}

impl<S: MessageSender> AnthropicProvider<S> {
    pub fn with_sender(sender: S, config: AnthropicProviderConfig) -> Self {
        Self {
            sender,
            config,
            available: true,
        }
    }

    fn build_request(&self, request: &AnalysisRequest) -> MessagesRequest {
        let instructions = match request.task {
            AnalysisTask::Layout => {
                "Check the element layout below. Lines starting with `[kind]` are parsed elements. \
                 Add a \"headings\" array with the exact text of any paragraph that should be a heading."
            }
            AnalysisTask::Structure => {
                "Check the section outline below. Add a \"title\" string with the best document \
                 title, or null if the outline already starts with one."
            }
        };
        let content: String = request.content.chars().take(MAX_CONTENT_CHARS).collect();
        MessagesRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            system: Some(SYSTEM_PROMPT.to_string()),
            messages: vec![Message::user(format!("{instructions}\n\n{content}"))],
        }
    }

    fn cost(&self, response: &MessagesResponse) -> f64 {
        let input = response.usage.input_tokens as f64 * self.config.input_cost_per_mtok;
        let output = response.usage.output_tokens as f64 * self.config.output_cost_per_mtok;
        (input + output) / 1_000_000.0
    }
}

/// Pull the JSON object out of a reply that may wrap it in prose or fences.
fn parse_reply(text: &str) -> Result<(Value, f64), ProviderError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &text[s..=e],
        _ => return Err(ProviderError::InvalidResponse("no JSON object in reply".into())),
    };
    let value: Value = serde_json::from_str(json)
        .map_err(|e| ProviderError::InvalidResponse(format!("reply is not valid JSON: {e}")))?;
    let confidence = value
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or_else(|| ProviderError::InvalidResponse("reply has no confidence".into()))?;
    Ok((value, confidence.clamp(0.0, 1.0)))
}

fn classify(err: AnthropicError) -> ProviderError {
    match err {
        AnthropicError::RateLimited { retry_after_ms } => ProviderError::RateLimited { retry_after_ms },
        AnthropicError::NetworkError(e) if e.is_timeout() => ProviderError::Timeout(REQUEST_TIMEOUT),
        AnthropicError::NetworkError(e) if e.is_decode() => ProviderError::InvalidResponse(e.to_string()),
        AnthropicError::NetworkError(e) => ProviderError::Unavailable(e.to_string()),
        ref api @ AnthropicError::ApiError { .. } if api.is_server_side() => {
            ProviderError::Unavailable(api.to_string())
        }
        AnthropicError::ApiError { status, message } => {
            ProviderError::Rejected(format!("status {status}: {message}"))
        }
        AnthropicError::ClientBuild(e) => ProviderError::Unavailable(e.to_string()),
    }
}

#[async_trait]
impl<S: MessageSender> AnalysisProvider for AnthropicProvider<S> {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<ProviderResponse, ProviderError> {
        let req = self.build_request(request);
        let response = self.sender.send_message(&req).await.map_err(classify)?;
        let cost_usd = self.cost(&response);
        debug!(
            provider = %self.config.name,
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "anthropic call finished"
        );

        if response.stop_reason.as_deref() == Some("refusal") {
            return Err(ProviderError::Refused(response.text()));
        }

        let (result, confidence) = parse_reply(&response.text())?;
        Ok(ProviderResponse {
            result,
            confidence,
            cost_usd,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anthropic::types::{ContentBlock, Usage};

    struct MockClient {
        text: String,
        stop_reason: &'static str,
        error: Option<fn() -> AnthropicError>,
    }

    impl MockClient {
        fn ok(text: &str) -> Self {
            Self {
                text: text.to_string(),
                stop_reason: "end_turn",
                error: None,
            }
        }

        fn refusal() -> Self {
            Self {
                text: "I can't help with that.".into(),
                stop_reason: "refusal",
                error: None,
            }
        }

        fn err(error: fn() -> AnthropicError) -> Self {
            Self {
                text: String::new(),
                stop_reason: "end_turn",
                error: Some(error),
            }
        }
    }

    impl MessageSender for MockClient {
        async fn send_message(&self, _req: &MessagesRequest) -> Result<MessagesResponse, AnthropicError> {
            if let Some(make) = self.error {
                return Err(make());
            }
            Ok(MessagesResponse {
                id: "mock".into(),
                content: vec![ContentBlock {
                    content_type: "text".into(),
                    text: self.text.clone(),
                }],
                model: "mock".into(),
                stop_reason: Some(self.stop_reason.into()),
                usage: Usage {
                    input_tokens: 1_000,
                    output_tokens: 100,
                },
            })
        }
    }

    fn provider(client: MockClient) -> AnthropicProvider<MockClient> {
        AnthropicProvider::with_sender(client, AnthropicProviderConfig::default())
    }

    fn layout() -> AnalysisRequest {
        AnalysisRequest::new(AnalysisTask::Layout, "[heading] Intro\n[paragraph] Body")
    }

    #[tokio::test]
    async fn parses_fenced_json_and_prices_tokens() {
        let reply = "```json\n{\"confidence\": 0.92, \"headings\": [\"Scope\"]}\n```";
        let response = provider(MockClient::ok(reply)).analyze(&layout()).await.unwrap();
        assert_eq!(response.confidence, 0.92);
        assert_eq!(response.result["headings"][0], "Scope");
        // 1000 * 3.0 / 1M + 100 * 15.0 / 1M
        assert!((response.cost_usd - 0.0045).abs() < 1e-12);
    }

    #[tokio::test]
    async fn missing_confidence_is_invalid() {
        let err = provider(MockClient::ok(r#"{"headings": []}"#))
            .analyze(&layout())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn refusal_is_permanent() {
        let err = provider(MockClient::refusal()).analyze(&layout()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Refused(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn api_errors_are_classified() {
        let err = provider(MockClient::err(|| AnthropicError::RateLimited { retry_after_ms: 2000 }))
            .analyze(&layout())
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::RateLimited { retry_after_ms: 2000 });

        let err = provider(MockClient::err(|| AnthropicError::ApiError {
            status: 503,
            message: "down".into(),
        }))
        .analyze(&layout())
        .await
        .unwrap_err();
        assert!(err.is_transient());

        let err = provider(MockClient::err(|| AnthropicError::ApiError {
            status: 400,
            message: "bad".into(),
        }))
        .analyze(&layout())
        .await
        .unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(_)));
    }

    #[test]
    fn confidence_is_clamped() {
        let (_, confidence) = parse_reply(r#"{"confidence": 1.7}"#).unwrap();
        assert_eq!(confidence, 1.0);
    }

    #[test]
    fn empty_key_makes_provider_unavailable() {
        let provider = AnthropicProvider::from_config(&AnthropicProviderConfig::default(), "").unwrap();
        assert!(!provider.is_available());
        assert_eq!(provider.name(), "anthropic");
    }

    #[test]
    fn request_truncates_long_content() {
        let provider = provider(MockClient::ok("{}"));
        let long = "x".repeat(MAX_CONTENT_CHARS * 2);
        let req = provider.build_request(&AnalysisRequest::new(AnalysisTask::Structure, long));
        assert!(req.messages[0].content.chars().count() < MAX_CONTENT_CHARS + 300);
        assert_eq!(req.model, "claude-sonnet-4-5-20250929");
        assert!(req.system.is_some());
    }
}
