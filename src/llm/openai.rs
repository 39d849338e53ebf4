//! OpenAI-compatible provider implementation

use async_trait::async_trait;
use std::time::Duration;
use reqwest::{Client, header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE}};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::llm::{
    provider::{LlmProvider, ProviderClientOptions, utils},
    types::{
        ChatRequest, ProviderResponse, ProviderConfig, Message, MessageRole,
        TokenUsage, FinishReason,
    },
    errors::{LlmError, LlmResult},
};

/// OpenAI API provider
#[derive(Debug, Clone)]
pub struct OpenAIProvider {
    client: Client,
    config: ProviderConfig,
    options: ProviderClientOptions,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider
    pub fn new(config: ProviderConfig) -> LlmResult<Self> {
        Self::with_options(config, ProviderClientOptions::default())
    }

    /// Create a provider with explicit retry and timeout settings
    pub fn with_options(config: ProviderConfig, options: ProviderClientOptions) -> LlmResult<Self> {
        let mut headers = HeaderMap::new();

        let api_key = config
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| LlmError::ConfigError("API key is required".to_string()))?;
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| LlmError::ConfigError(format!("Invalid API key: {}", e)))?;
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        for (key, value) in &config.extra_headers {
            let header_name: reqwest::header::HeaderName = key.parse()
                .map_err(|e| LlmError::ConfigError(format!("Invalid header name '{}': {}", key, e)))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| LlmError::ConfigError(format!("Invalid header value for '{}': {}", key, e)))?;
            headers.insert(header_name, header_value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(options.timeout_seconds))
            .user_agent(&options.user_agent)
            .build()
            .map_err(|e| LlmError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            options,
        })
    }

    /// Convert messages to OpenAI format, system prompt first
    fn convert_messages(system_message: Option<&str>, messages: &[Message]) -> Vec<OpenAIMessage> {
        let system = system_message
            .filter(|s| !s.is_empty())
            .map(|s| OpenAIMessage {
                role: "system".to_string(),
                content: s.to_string(),
            });

        system
            .into_iter()
            .chain(messages.iter().map(|msg| OpenAIMessage {
                role: match msg.role {
                    MessageRole::User => "user".to_string(),
                    MessageRole::Model => "assistant".to_string(),
                },
                content: msg.get_text_content(),
            }))
            .collect()
    }

    /// Get the API endpoint URL
    fn get_endpoint(&self) -> String {
        let base_url = self.config.base_url.as_deref().unwrap_or("https://api.openai.com");
        format!("{}/v1/chat/completions", base_url.trim_end_matches('/'))
    }

    /// Execute request with retries
    async fn execute_request<T>(&self, request_body: serde_json::Value) -> LlmResult<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let mut last_error = None;

        for attempt in 0..=self.options.max_retries {
            if attempt > 0 {
                debug!("Retrying OpenAI request (attempt {})", attempt);
                utils::exponential_backoff_with_jitter(attempt, self.options.retry_delay_ms).await;
            }

            let response = self.client
                .post(self.get_endpoint())
                .json(&request_body)
                .send()
                .await;

            let error = match response {
                Ok(resp) if resp.status().is_success() => match resp.json::<T>().await {
                    Ok(result) => return Ok(result),
                    Err(e) => LlmError::HttpError(e),
                },
                Ok(resp) => {
                    let status = resp.status();
                    let error_msg = utils::extract_error_message(resp).await;

                    if status.as_u16() == 400 && error_msg.contains("context_length_exceeded") {
                        LlmError::ContextLimitError(error_msg)
                    } else {
                        utils::error_for_status(status, error_msg)
                    }
                }
                Err(e) => LlmError::from_transport(e),
            };

            if !utils::is_retryable_error(&error) || attempt == self.options.max_retries {
                return Err(error);
            }
            last_error = Some(error);
        }

        Err(last_error.unwrap_or_else(|| LlmError::ApiError("Unknown error".to_string())))
    }
}

#[async_trait]
impl LlmProvider for OpenAIProvider {
    async fn chat_completion(&self, request: ChatRequest) -> LlmResult<ProviderResponse> {
        let mut request_body = json!({
            "model": self.config.model,
            "messages": Self::convert_messages(request.system_message.as_deref(), &request.messages),
            "stream": false,
        });

        if let Some(max_tokens) = request.max_tokens.or(self.config.max_tokens) {
            request_body["max_tokens"] = json!(max_tokens);
        }

        if let Some(temperature) = request.temperature.or(self.config.temperature) {
            request_body["temperature"] = json!(temperature);
        }

        if let Some(top_p) = request.top_p.or(self.config.top_p) {
            request_body["top_p"] = json!(top_p);
        }

        let response: OpenAIResponse = self.execute_request(request_body).await?;

        let choice = response.choices.into_iter().next()
            .ok_or_else(|| LlmError::ApiError("No choices in response".to_string()))?;

        let finish_reason = match choice.finish_reason.as_deref() {
            Some("stop") => Some(FinishReason::Stop),
            Some("length") => Some(FinishReason::Length),
            Some("content_filter") => Some(FinishReason::ContentFilter),
            _ => None,
        };

        let usage = response.usage.unwrap_or_default();

        Ok(ProviderResponse {
            content: choice.message.content.unwrap_or_default(),
            usage: TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            },
            finish_reason,
        })
    }

    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn validate_config(&self) -> LlmResult<()> {
        if self.config.model.is_empty() {
            return Err(LlmError::ConfigError("Model is required".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::test_server::TestServer;
    use std::collections::HashMap;

    fn config(api_key: Option<&str>) -> ProviderConfig {
        ProviderConfig {
            kind: crate::llm::BackendKind::OpenAi,
            api_key: api_key.map(str::to_string),
            base_url: Some("http://localhost:8080/".to_string()),
            model: "gpt-4o-mini".to_string(),
            max_tokens: None,
            temperature: None,
            top_p: None,
            extra_headers: HashMap::new(),
        }
    }

    #[test]
    fn test_missing_api_key_is_config_error() {
        let err = OpenAIProvider::new(config(None)).unwrap_err();
        assert!(matches!(err, LlmError::ConfigError(_)));
        let err = OpenAIProvider::new(config(Some(""))).unwrap_err();
        assert!(matches!(err, LlmError::ConfigError(_)));
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let provider = OpenAIProvider::new(config(Some("sk-test"))).unwrap();
        assert_eq!(provider.get_endpoint(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn test_convert_messages_prepends_system_prompt() {
        let history = vec![Message::new_user("hello"), Message::new_model("hi")];
        let converted = OpenAIProvider::convert_messages(Some("be brief"), &history);

        let roles: Vec<&str> = converted.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant"]);
        assert_eq!(converted[2].content, "hi");
    }

    const COMPLETION: &str = r#"{"choices":[{"message":{"content":"pong"},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":1,"total_tokens":4}}"#;

    fn fast_retries() -> ProviderClientOptions {
        ProviderClientOptions {
            max_retries: 2,
            retry_delay_ms: 1,
            ..ProviderClientOptions::default()
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            messages: vec![Message::new_user("ping")],
            system_message: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
        }
    }

    #[tokio::test]
    async fn test_service_unavailable_is_retried() {
        let server = TestServer::start(vec![(503, r#"{"error":{"message":"overloaded"}}"#), (200, COMPLETION)]).await;
        let mut cfg = config(Some("sk-test"));
        cfg.base_url = Some(server.base_url.clone());
        let provider = OpenAIProvider::with_options(cfg, fast_retries()).unwrap();

        let response = provider.chat_completion(request()).await.unwrap();
        assert_eq!(response.content, "pong");
        assert_eq!(response.usage.total_tokens, 4);
        assert_eq!(server.hits(), 2);
    }

    #[tokio::test]
    async fn test_bad_request_is_not_retried() {
        let server = TestServer::start(vec![(400, r#"{"error":{"message":"bad input"}}"#)]).await;
        let mut cfg = config(Some("sk-test"));
        cfg.base_url = Some(server.base_url.clone());
        let provider = OpenAIProvider::with_options(cfg, fast_retries()).unwrap();

        let err = provider.chat_completion(request()).await.unwrap_err();
        assert!(matches!(err, LlmError::ApiError(ref msg) if msg.contains("bad input")));
        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn test_persistent_server_error_gives_up_after_retries() {
        let server = TestServer::start(vec![(502, "upstream down")]).await;
        let mut cfg = config(Some("sk-test"));
        cfg.base_url = Some(server.base_url.clone());
        let provider = OpenAIProvider::with_options(cfg, fast_retries()).unwrap();

        let err = provider.chat_completion(request()).await.unwrap_err();
        assert!(matches!(err, LlmError::ServerError(_)));
        assert_eq!(server.hits(), 3);
    }
}
