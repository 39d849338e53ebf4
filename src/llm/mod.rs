//! LLM provider abstractions and implementations
//!
//! This module provides a unified interface for interacting with different
//! language model providers, and the chat-handle contract sessions use to
//! keep conversation history in one authoritative place.

pub mod backend;
pub mod errors;
pub mod ollama;
pub mod openai;
pub mod provider;
pub mod types;

pub use backend::*;
pub use errors::*;
pub use types::*;
