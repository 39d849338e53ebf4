//! Common types for LLM providers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr};

use crate::config::ConfigError;

/// Role of a message in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    #[serde(alias = "assistant")]
    Model,
}

/// Content block types for messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new_text(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::Text { text: text.into() }],
            timestamp: Some(Utc::now()),
        }
    }

    pub fn new_user(text: impl Into<String>) -> Self {
        Self::new_text(MessageRole::User, text)
    }

    pub fn new_model(text: impl Into<String>) -> Self {
        Self::new_text(MessageRole::Model, text)
    }

    /// First text part, the one that survives persistence
    pub fn first_text(&self) -> Option<&str> {
        self.content.first().map(|block| match block {
            ContentBlock::Text { text } => text.as_str(),
        })
    }

    /// All text parts joined together
    pub fn get_text_content(&self) -> String {
        self.content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Token usage information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

/// Finish reason for a completion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Error,
}

/// Response from an LLM provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<FinishReason>,
}

/// Reply from a chat handle for one turn
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub text: String,
    pub tokens_used: Option<u64>,
}

/// What a session hands back to its caller for one turn.
///
/// When the backend call failed, `text` is a placeholder and `error` carries
/// the provider's message.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub text: String,
    pub tokens_used: Option<u64>,
    pub error: Option<String>,
}

impl LlmResponse {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// The closed set of supported backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    OpenAi,
    Ollama,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::OpenAi => "openai",
            BackendKind::Ollama => "ollama",
        }
    }

    pub fn all() -> &'static [BackendKind] {
        &[BackendKind::OpenAi, BackendKind::Ollama]
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(BackendKind::OpenAi),
            "ollama" => Ok(BackendKind::Ollama),
            _ => Err(ConfigError::UnknownBackend(s.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for an LLM provider
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: BackendKind,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub extra_headers: HashMap<String, String>,
}

/// Chat completion request
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub system_message: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("openai".parse::<BackendKind>().unwrap(), BackendKind::OpenAi);
        assert_eq!(" Ollama ".parse::<BackendKind>().unwrap(), BackendKind::Ollama);

        let err = "gemini-local".parse::<BackendKind>().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownBackend(ref name) if name == "gemini-local"));
    }

    #[test]
    fn test_first_text_and_joined_text() {
        let message = Message {
            role: MessageRole::User,
            content: vec![
                ContentBlock::Text { text: "what is this?".to_string() },
                ContentBlock::Text { text: " and this?".to_string() },
            ],
            timestamp: None,
        };

        assert_eq!(message.first_text(), Some("what is this?"));
        assert_eq!(message.get_text_content(), "what is this? and this?");
    }

    #[test]
    fn test_role_accepts_assistant_alias() {
        let role: MessageRole = serde_json::from_str("\"assistant\"").unwrap();
        assert_eq!(role, MessageRole::Model);
        assert_eq!(serde_json::to_string(&MessageRole::Model).unwrap(), "\"model\"");
    }
}
