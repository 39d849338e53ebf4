//! Who the assistant is: fixed for the life of the process

use crate::config::Config;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantIdentity {
    pub system_prompt: String,
    pub display_name: String,
}

impl AssistantIdentity {
    pub fn new(system_prompt: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            display_name: display_name.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.system_prompt.clone(), config.display_name.clone())
    }
}
