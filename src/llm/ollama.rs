use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{
    provider::{LlmProvider, ProviderClientOptions, utils},
    types::{ChatRequest, ProviderResponse, ProviderConfig, Message, MessageRole, TokenUsage, FinishReason},
    errors::{LlmError, LlmResult},
};

/// Ollama API configuration
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    default_model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    top_p: Option<f32>,
    options: ProviderClientOptions,
}

/// Ollama chat request format
#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

/// Ollama chat completion request
#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

/// Ollama response format for chat
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
    done: bool,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

impl OllamaProvider {
    /// Create a new Ollama provider from configuration
    pub fn new(config: ProviderConfig) -> LlmResult<Self> {
        Self::with_options(config, ProviderClientOptions::default())
    }

    /// Create a provider with explicit retry and timeout settings
    pub fn with_options(config: ProviderConfig, options: ProviderClientOptions) -> LlmResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(options.timeout_seconds))
            .user_agent(&options.user_agent)
            .build()
            .map_err(|e| LlmError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;
        let base_url = config
            .base_url
            .unwrap_or_else(|| "http://localhost:11434".to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client,
            base_url,
            default_model: config.model,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            top_p: config.top_p,
            options,
        })
    }

    /// Request body; per-request sampling settings win over configured ones
    fn build_request(&self, request: &ChatRequest) -> OllamaChatRequest {
        OllamaChatRequest {
            model: self.default_model.clone(),
            messages: Self::convert_messages(request.system_message.as_deref(), &request.messages),
            stream: false,
            options: Some(OllamaOptions {
                temperature: request.temperature.or(self.temperature),
                num_predict: request.max_tokens.or(self.max_tokens),
                top_p: request.top_p.or(self.top_p),
            }),
        }
    }

    /// Convert our Message format to Ollama's format
    fn convert_messages(system_message: Option<&str>, messages: &[Message]) -> Vec<OllamaMessage> {
        let system = system_message
            .filter(|s| !s.is_empty())
            .map(|s| OllamaMessage {
                role: "system".to_string(),
                content: s.to_string(),
            });

        system
            .into_iter()
            .chain(messages.iter().map(|msg| OllamaMessage {
                role: match msg.role {
                    MessageRole::User => "user".to_string(),
                    MessageRole::Model => "assistant".to_string(),
                },
                content: msg.get_text_content(),
            }))
            .collect()
    }

    async fn post_chat(&self, body: &OllamaChatRequest) -> LlmResult<OllamaChatResponse> {
        let url = format!("{}/api/chat", self.base_url);
        debug!("Sending Ollama chat request to: {}", url);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(LlmError::from_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_msg = utils::extract_error_message(response).await;
            return Err(match status.as_u16() {
                404 => LlmError::ConfigError(format!(
                    "Model '{}' is not available: {}",
                    self.default_model, error_msg
                )),
                _ => utils::error_for_status(status, format!("Ollama API error {}", error_msg)),
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn chat_completion(&self, request: ChatRequest) -> LlmResult<ProviderResponse> {
        let ollama_request = self.build_request(&request);

        let mut attempt = 0;
        let ollama_response = loop {
            match self.post_chat(&ollama_request).await {
                Ok(response) => break response,
                Err(e) if utils::is_retryable_error(&e) && attempt < self.options.max_retries => {
                    attempt += 1;
                    debug!("Retrying Ollama request (attempt {}): {}", attempt, e);
                    utils::exponential_backoff_with_jitter(attempt, self.options.retry_delay_ms).await;
                }
                Err(e) => return Err(e),
            }
        };

        let input_tokens = ollama_response.prompt_eval_count.unwrap_or(0);
        let output_tokens = ollama_response.eval_count.unwrap_or(0);

        Ok(ProviderResponse {
            content: ollama_response.message.content,
            usage: TokenUsage {
                input_tokens,
                output_tokens,
                total_tokens: input_tokens + output_tokens,
            },
            finish_reason: if ollama_response.done { Some(FinishReason::Stop) } else { None },
        })
    }

    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.default_model
    }

    fn validate_config(&self) -> LlmResult<()> {
        if self.default_model.is_empty() {
            return Err(LlmError::ConfigError("Ollama model name is required".to_string()));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(LlmError::ConfigError(format!(
                "Invalid Ollama base URL: {}",
                self.base_url
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::test_server::TestServer;
    use std::collections::HashMap;

    fn config(base_url: &str, model: &str) -> ProviderConfig {
        ProviderConfig {
            kind: crate::llm::BackendKind::Ollama,
            api_key: None,
            base_url: Some(base_url.to_string()),
            model: model.to_string(),
            max_tokens: None,
            temperature: None,
            top_p: None,
            extra_headers: HashMap::new(),
        }
    }

    fn provider(base_url: &str, model: &str) -> OllamaProvider {
        OllamaProvider::new(config(base_url, model)).unwrap()
    }

    fn request() -> ChatRequest {
        ChatRequest {
            messages: vec![Message::new_user("ping")],
            system_message: Some("be brief".to_string()),
            max_tokens: None,
            temperature: None,
            top_p: None,
        }
    }

    fn fast_retries() -> ProviderClientOptions {
        ProviderClientOptions {
            max_retries: 2,
            retry_delay_ms: 1,
            ..ProviderClientOptions::default()
        }
    }

    #[test]
    fn test_validate_config() {
        assert!(provider("http://localhost:11434/", "llama3").validate_config().is_ok());
        assert!(provider("localhost:11434", "llama3").validate_config().is_err());
        assert!(provider("http://localhost:11434", "").validate_config().is_err());
    }

    #[test]
    fn test_convert_messages_maps_model_role() {
        let history = vec![Message::new_user("ping"), Message::new_model("pong")];
        let converted = OllamaProvider::convert_messages(None, &history);

        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0].role, "user");
        assert_eq!(converted[1].role, "assistant");
        assert_eq!(converted[1].content, "pong");
    }

    #[test]
    fn test_configured_sampling_options_are_sent() {
        let mut cfg = config("http://localhost:11434", "llama3");
        cfg.temperature = Some(0.2);
        cfg.max_tokens = Some(77);
        cfg.top_p = Some(0.5);
        let provider = OllamaProvider::new(cfg).unwrap();

        let body = serde_json::to_value(provider.build_request(&request())).unwrap();
        assert_eq!(body["model"], "llama3");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["options"]["num_predict"], 77);
        assert!((body["options"]["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
        assert!((body["options"]["top_p"].as_f64().unwrap() - 0.5).abs() < 1e-6);

        let mut overridden = request();
        overridden.max_tokens = Some(5);
        let body = serde_json::to_value(provider.build_request(&overridden)).unwrap();
        assert_eq!(body["options"]["num_predict"], 5);
    }

    #[test]
    fn test_unset_sampling_options_are_omitted() {
        let body = serde_json::to_value(provider("http://localhost:11434", "llama3").build_request(&request())).unwrap();
        assert_eq!(body["options"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_server_error_is_retried_and_options_reach_the_wire() {
        let server = TestServer::start(vec![
            (503, r#"{"error":"loading model"}"#),
            (200, r#"{"message":{"role":"assistant","content":"pong"},"done":true,"prompt_eval_count":5,"eval_count":2}"#),
        ])
        .await;
        let mut cfg = config(&server.base_url, "llama3");
        cfg.temperature = Some(0.2);
        let provider = OllamaProvider::with_options(cfg, fast_retries()).unwrap();

        let response = provider.chat_completion(request()).await.unwrap();
        assert_eq!(response.content, "pong");
        assert_eq!(response.usage.total_tokens, 7);
        assert_eq!(server.hits(), 2);

        let sent: serde_json::Value = serde_json::from_str(&server.bodies()[1]).unwrap();
        assert!((sent["options"]["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_missing_model_is_not_retried() {
        let server = TestServer::start(vec![(404, r#"{"error":"model 'nope' not found"}"#)]).await;
        let provider = OllamaProvider::with_options(config(&server.base_url, "nope"), fast_retries()).unwrap();

        let err = provider.chat_completion(request()).await.unwrap_err();
        assert!(matches!(err, LlmError::ConfigError(ref msg) if msg.contains("nope")));
        assert_eq!(server.hits(), 1);
    }
}
