//! Provider trait and factory for LLM providers

use async_trait::async_trait;
use crate::llm::{
    types::{BackendKind, ChatRequest, ProviderResponse, ProviderConfig},
    errors::LlmResult,
    openai::OpenAIProvider,
    ollama::OllamaProvider,
};

/// Trait for stateless LLM providers
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request and get a response
    async fn chat_completion(&self, request: ChatRequest) -> LlmResult<ProviderResponse>;

    /// Get the provider name
    fn name(&self) -> &str;

    /// Get the model name
    fn model(&self) -> &str;

    /// Validate the configuration
    fn validate_config(&self) -> LlmResult<()>;
}

/// Factory for creating LLM providers
pub struct ProviderFactory;

impl ProviderFactory {
    /// Create a new provider from configuration
    pub fn create_provider(config: ProviderConfig) -> LlmResult<Box<dyn LlmProvider>> {
        match config.kind {
            BackendKind::OpenAi => Ok(Box::new(OpenAIProvider::new(config)?)),
            BackendKind::Ollama => Ok(Box::new(OllamaProvider::new(config)?)),
        }
    }
}

/// Provider client options for flexible configuration
#[derive(Debug, Clone)]
pub struct ProviderClientOptions {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_seconds: u64,
    pub user_agent: String,
}

impl Default for ProviderClientOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            timeout_seconds: 300,
            user_agent: concat!("chatkeep/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Utility functions for provider implementations
pub mod utils {
    use std::time::Duration;
    use tokio::time::sleep;
    use rand::Rng;

    use crate::llm::errors::LlmError;

    /// Delay for a retry attempt, capped at 30 seconds
    pub fn backoff_delay(attempt: u32, base_delay_ms: u64, jitter: f64) -> Duration {
        let delay_ms = (base_delay_ms as f64 * 2.0_f64.powi(attempt as i32) * (1.0 + jitter)) as u64;
        Duration::from_millis(delay_ms.min(30000))
    }

    /// Exponential backoff with jitter
    pub async fn exponential_backoff_with_jitter(attempt: u32, base_delay_ms: u64) {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        sleep(backoff_delay(attempt, base_delay_ms, jitter)).await;
    }

    /// Map a non-success status to an error; 5xx, 408 and 429 come back retryable
    pub fn error_for_status(status: reqwest::StatusCode, message: String) -> LlmError {
        match status.as_u16() {
            429 => LlmError::RateLimitError(message),
            401 | 403 => LlmError::AuthError(message),
            408 => LlmError::TimeoutError(message),
            500..=599 => LlmError::ServerError(message),
            _ => LlmError::ApiError(message),
        }
    }

    /// Check if an error is retryable
    pub fn is_retryable_error(error: &LlmError) -> bool {
        match error {
            LlmError::RateLimitError(_) | LlmError::ServerError(_) => true,
            LlmError::HttpError(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map_or(false, |status| {
                        status.is_server_error() || status == 429 || status == 408
                    })
            }
            LlmError::TimeoutError(_) => true,
            _ => false,
        }
    }

    /// Extract error message from HTTP response
    pub async fn extract_error_message(response: reqwest::Response) -> String {
        let status = response.status();
        match response.text().await {
            Ok(text) => {
                if let Ok(json) = serde_json::from_str::<serde_json::Value>(&text) {
                    if let Some(message) = json.get("error").and_then(|e| e.get("message").or(Some(e))) {
                        return format!("{}: {}", status, message.as_str().unwrap_or("Unknown error"));
                    }
                }
                format!("{}: {}", status, text)
            }
            Err(_) => format!("{}: Failed to read error response", status),
        }
    }

}

/// Minimal HTTP server that answers each connection with the next canned response
#[cfg(test)]
pub mod test_server {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    pub struct TestServer {
        pub base_url: String,
        hits: Arc<AtomicUsize>,
        bodies: Arc<Mutex<Vec<String>>>,
    }

    impl TestServer {
        /// Serve `responses` in order; the last one repeats once they run out
        pub async fn start(responses: Vec<(u16, &str)>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base_url = format!("http://{}", listener.local_addr().unwrap());
            let hits = Arc::new(AtomicUsize::new(0));
            let bodies = Arc::new(Mutex::new(Vec::new()));
            let responses: Vec<(u16, String)> =
                responses.into_iter().map(|(code, body)| (code, body.to_string())).collect();

            let (server_hits, server_bodies) = (hits.clone(), bodies.clone());
            tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    let index = server_hits.fetch_add(1, Ordering::SeqCst);
                    let (code, body) = responses[index.min(responses.len() - 1)].clone();
                    let request_body = read_request(&mut stream).await;
                    server_bodies.lock().unwrap().push(request_body);
                    let reply = format!(
                        "HTTP/1.1 {} Test\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        code,
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(reply.as_bytes()).await;
                    let _ = stream.shutdown().await;
                }
            });

            Self { base_url, hits, bodies }
        }

        pub fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }

        pub fn bodies(&self) -> Vec<String> {
            self.bodies.lock().unwrap().clone()
        }
    }

    /// Read headers and a Content-Length body, returning the body
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(end) = find(&data, b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&data[..end]).to_ascii_lowercase();
                let length = headers
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if data.len() >= end + 4 + length {
                    return String::from_utf8_lossy(&data[end + 4..end + 4 + length]).into_owned();
                }
            }
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return String::from_utf8_lossy(&data).into_owned(),
                Ok(n) => data.extend_from_slice(&chunk[..n]),
            }
        }
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|window| window == needle)
    }
}
