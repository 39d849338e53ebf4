//! Backend adapter contract: stateful chat handles over stateless providers
//!
//! A [`Backend`] builds [`ChatHandle`]s. The handle owns the authoritative
//! conversation history for as long as it lives; sessions only cache it.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::llm::{
    errors::LlmResult,
    provider::{LlmProvider, ProviderFactory},
    types::{ChatReply, ChatRequest, Message, ProviderConfig},
};

/// Fixed per-message overhead used by the token estimate
const MESSAGE_TOKEN_OVERHEAD: u64 = 4;

/// Estimate tokens as characters/4 (rounded up) plus a per-message overhead.
///
/// Adding a message never lowers the count.
pub fn estimate_tokens(history: &[Message]) -> u64 {
    history
        .iter()
        .map(|message| {
            let chars = message.get_text_content().chars().count() as u64;
            chars.div_ceil(4) + MESSAGE_TOKEN_OVERHEAD
        })
        .sum()
}

/// A live conversation with a backend
#[async_trait]
pub trait ChatHandle: Send + Sync {
    /// Send a user turn. On success both the user and model turns are
    /// appended to the handle's history; on failure history is unchanged.
    async fn send(&mut self, text: &str) -> LlmResult<ChatReply>;

    /// Record a message without contacting the provider
    fn append(&mut self, message: Message);

    /// The authoritative history, in the order it was exchanged
    async fn history(&self) -> Vec<Message>;

    /// Token count for `history`
    async fn count_tokens(&self, history: &[Message]) -> u64 {
        estimate_tokens(history)
    }
}

/// Factory for chat handles
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    /// Start a chat seeded with `prior_history` so later turns keep context
    async fn create_session(
        &self,
        system_prompt: &str,
        prior_history: Vec<Message>,
    ) -> LlmResult<Box<dyn ChatHandle>>;
}

/// Adapts a stateless [`LlmProvider`] into a [`Backend`]
pub struct ProviderBackend {
    provider: Arc<dyn LlmProvider>,
}

impl ProviderBackend {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Backend for ProviderBackend {
    fn name(&self) -> &str {
        self.provider.name()
    }

    fn model(&self) -> &str {
        self.provider.model()
    }

    async fn create_session(
        &self,
        system_prompt: &str,
        prior_history: Vec<Message>,
    ) -> LlmResult<Box<dyn ChatHandle>> {
        self.provider.validate_config()?;
        debug!(
            "Creating {} chat handle with {} prior messages",
            self.provider.name(),
            prior_history.len()
        );

        Ok(Box::new(ProviderChat {
            provider: self.provider.clone(),
            system_prompt: system_prompt.to_string(),
            history: prior_history,
        }))
    }
}

/// Chat handle that replays the whole history on every request
struct ProviderChat {
    provider: Arc<dyn LlmProvider>,
    system_prompt: String,
    history: Vec<Message>,
}

#[async_trait]
impl ChatHandle for ProviderChat {
    async fn send(&mut self, text: &str) -> LlmResult<ChatReply> {
        let user_message = Message::new_user(text);
        let mut messages = self.history.clone();
        messages.push(user_message.clone());

        let request = ChatRequest {
            messages,
            system_message: Some(self.system_prompt.clone()),
            max_tokens: None,
            temperature: None,
            top_p: None,
        };

        let response = self.provider.chat_completion(request).await?;

        self.history.push(user_message);
        self.history.push(Message::new_model(response.content.clone()));

        let tokens_used = match response.usage.total_tokens {
            0 => None,
            total => Some(u64::from(total)),
        };

        Ok(ChatReply {
            text: response.content,
            tokens_used,
        })
    }

    fn append(&mut self, message: Message) {
        self.history.push(message);
    }

    async fn history(&self) -> Vec<Message> {
        self.history.clone()
    }
}

/// Build the process-wide backend from provider configuration
pub fn create_backend(config: ProviderConfig) -> LlmResult<Arc<dyn Backend>> {
    let provider = ProviderFactory::create_provider(config)?;
    Ok(Arc::new(ProviderBackend::new(Arc::from(provider))))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{
        errors::LlmError,
        types::{ProviderResponse, TokenUsage},
    };
    use std::sync::Mutex;

    struct FlakyProvider {
        fail: bool,
        requests: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl LlmProvider for FlakyProvider {
        async fn chat_completion(&self, request: ChatRequest) -> LlmResult<ProviderResponse> {
            self.requests.lock().unwrap().push(request.messages.len());
            if self.fail {
                return Err(LlmError::ApiError("503: overloaded".to_string()));
            }
            Ok(ProviderResponse {
                content: "hi".to_string(),
                usage: TokenUsage { input_tokens: 3, output_tokens: 1, total_tokens: 4 },
                finish_reason: None,
            })
        }

        fn name(&self) -> &str {
            "flaky"
        }

        fn model(&self) -> &str {
            "flaky-1"
        }

        fn validate_config(&self) -> LlmResult<()> {
            Ok(())
        }
    }

    fn backend(fail: bool) -> (ProviderBackend, Arc<FlakyProvider>) {
        let provider = Arc::new(FlakyProvider { fail, requests: Mutex::new(Vec::new()) });
        (ProviderBackend::new(provider.clone()), provider)
    }

    #[test]
    fn test_estimate_is_monotonic() {
        let mut history = Vec::new();
        let mut last = estimate_tokens(&history);
        assert_eq!(last, 0);

        for text in ["", "a", "hello there", "a much longer message than the others"] {
            history.push(Message::new_user(text));
            let next = estimate_tokens(&history);
            assert!(next > last);
            last = next;
        }
    }

    #[tokio::test]
    async fn test_provider_chat_replays_prior_history() {
        let (backend, provider) = backend(false);
        let prior = vec![Message::new_user("earlier"), Message::new_model("reply")];
        let mut handle = backend.create_session("system", prior).await.unwrap();

        let reply = handle.send("hello").await.unwrap();
        assert_eq!(reply.text, "hi");
        assert_eq!(reply.tokens_used, Some(4));

        // Prior two messages plus the new user turn
        assert_eq!(*provider.requests.lock().unwrap(), vec![3]);

        let history = handle.history().await;
        assert_eq!(history.len(), 4);
        assert_eq!(history[2].first_text(), Some("hello"));
        assert_eq!(history[3].first_text(), Some("hi"));
    }

    #[tokio::test]
    async fn test_failed_send_leaves_history_untouched() {
        let (backend, _) = backend(true);
        let mut handle = backend.create_session("system", Vec::new()).await.unwrap();

        assert!(handle.send("hello").await.is_err());
        assert!(handle.history().await.is_empty());
    }
}
