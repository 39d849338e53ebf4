use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::debug;

use crate::llm::{BackendKind, ProviderConfig};

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer clearly and keep track of the conversation so far.";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown backend '{0}' (expected one of: {})", supported_backends())]
    UnknownBackend(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn supported_backends() -> String {
    BackendKind::all()
        .iter()
        .map(BackendKind::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for session records and the append log
    pub data_dir: PathBuf,

    /// Chat backend: `openai` or `ollama`
    pub backend: String,

    /// API key
    pub api_key: Option<String>,

    /// Base URL for the API
    pub base_url: Option<String>,

    /// Model to use; empty picks the backend's default
    pub model: String,

    /// Maximum tokens for responses
    pub max_tokens: Option<u32>,

    /// Temperature for sampling
    pub temperature: Option<f32>,

    /// Top-p for nucleus sampling
    pub top_p: Option<f32>,

    /// Extra headers for API requests
    pub extra_headers: HashMap<String, String>,

    /// System prompt every session starts from
    pub system_prompt: String,

    /// Name shown in front of model replies
    pub display_name: String,

    /// Token budget reported by `/tokens`
    pub context_budget: u64,

    /// Upper bound on the save performed at exit
    pub shutdown_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backend: BackendKind::OpenAi.as_str().to_string(),
            api_key: None,
            base_url: None,
            model: String::new(),
            max_tokens: Some(4096),
            temperature: Some(0.7),
            top_p: None,
            extra_headers: HashMap::new(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            display_name: "assistant".to_string(),
            context_budget: 32_768,
            shutdown_timeout_secs: 5,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("chatkeep"))
        .unwrap_or_else(|| PathBuf::from("./.chatkeep"))
}

impl Config {
    /// Initialize configuration: defaults, then the first config file found,
    /// then environment variables. Not validated here; commands that only
    /// read local files work without backend credentials.
    pub async fn init() -> Result<Self, ConfigError> {
        debug!("Initializing configuration");

        let mut config = Self::load_from_file().await?.unwrap_or_default();
        config.load_from_env();

        debug!(
            "Using backend {} with model {}, data in {}",
            config.backend,
            config.model_name(),
            config.data_dir.display()
        );
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn load_from_env(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup("CHATKEEP_BACKEND") {
            self.backend = backend;
        }

        // Provider-specific variables only fill gaps
        if self.backend == BackendKind::OpenAi.as_str() && self.api_key.is_none() {
            self.api_key = lookup("OPENAI_API_KEY");
        }
        if self.backend == BackendKind::Ollama.as_str() {
            if let Some(host) = lookup("OLLAMA_HOST") {
                self.base_url = Some(host);
            }
        }

        if let Some(key) = lookup("CHATKEEP_API_KEY") {
            self.api_key = Some(key);
        }
        if let Some(base_url) = lookup("CHATKEEP_BASE_URL") {
            self.base_url = Some(base_url);
        }
        if let Some(model) = lookup("CHATKEEP_MODEL") {
            self.model = model;
        }
        if let Some(max_tokens) = lookup("CHATKEEP_MAX_TOKENS").and_then(|v| v.parse().ok()) {
            self.max_tokens = Some(max_tokens);
        }
        if let Some(temperature) = lookup("CHATKEEP_TEMPERATURE").and_then(|v| v.parse().ok()) {
            self.temperature = Some(temperature);
        }
        if let Some(data_dir) = lookup("CHATKEEP_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }
        if let Some(prompt) = lookup("CHATKEEP_SYSTEM_PROMPT") {
            self.system_prompt = prompt;
        }
        if let Some(budget) = lookup("CHATKEEP_CONTEXT_BUDGET").and_then(|v| v.parse().ok()) {
            self.context_budget = budget;
        }
    }

    /// Load the first configuration file that exists:
    /// 1. ./.chatkeep.json
    /// 2. ./chatkeep.json
    /// 3. $CONFIG_DIR/chatkeep/chatkeep.json
    pub async fn load_from_file() -> Result<Option<Self>, ConfigError> {
        let mut config_paths = vec![PathBuf::from("./.chatkeep.json"), PathBuf::from("./chatkeep.json")];

        if let Some(config_dir) = dirs::config_dir() {
            config_paths.push(config_dir.join("chatkeep").join("chatkeep.json"));
        }

        for path in config_paths {
            if path.exists() {
                return Self::load_path(path).await.map(Some);
            }
        }

        Ok(None)
    }

    async fn load_path(path: PathBuf) -> Result<Self, ConfigError> {
        debug!("Loading configuration from: {}", path.display());
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn backend_kind(&self) -> Result<BackendKind, ConfigError> {
        self.backend.parse()
    }

    /// The configured model, or the backend's default when none is set
    pub fn model_name(&self) -> String {
        if !self.model.is_empty() {
            return self.model.clone();
        }
        match self.backend_kind() {
            Ok(BackendKind::OpenAi) | Err(_) => "gpt-4o-mini".to_string(),
            Ok(BackendKind::Ollama) => "llama3".to_string(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let kind = self.backend_kind()?;

        if kind == BackendKind::OpenAi && self.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Invalid(
                "no API key configured; set OPENAI_API_KEY or CHATKEEP_API_KEY".to_string(),
            ));
        }

        if let Some(max_tokens) = self.max_tokens {
            if max_tokens == 0 {
                return Err(ConfigError::Invalid("max_tokens must be greater than 0".to_string()));
            }
        }

        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(ConfigError::Invalid("temperature must be between 0.0 and 2.0".to_string()));
            }
        }

        if let Some(top_p) = self.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(ConfigError::Invalid("top_p must be between 0.0 and 1.0".to_string()));
            }
        }

        if self.context_budget == 0 {
            return Err(ConfigError::Invalid("context_budget must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// Reserved for exported conversations
    pub fn exports_dir(&self) -> PathBuf {
        self.data_dir.join("exports")
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn provider_config(&self) -> Result<ProviderConfig, ConfigError> {
        Ok(ProviderConfig {
            kind: self.backend_kind()?,
            api_key: self.api_key.clone(),
            base_url: self.base_url.clone(),
            model: self.model_name(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            extra_headers: self.extra_headers.clone(),
        })
    }
}
