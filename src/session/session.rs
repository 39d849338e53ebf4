//! A single conversation and its lifecycle

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    app::AssistantIdentity,
    llm::{estimate_tokens, Backend, ChatHandle, LlmError, LlmResponse, Message},
    session::{
        log::{AppendLog, LogEntry},
        store::{SaveError, SaveOutcome, SessionStore, MIN_PERSISTED_MESSAGES},
    },
};

/// Model text recorded when the backend call fails
pub const PLACEHOLDER_RESPONSE: &str = "[no response: the model request failed]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Constructed,
    Initializing,
    Ready,
    Saving,
    Terminated,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session {0} is not initialized")]
    NotReady(String),

    #[error("session {0} has been terminated")]
    Terminated(String),

    #[error("failed to start chat backend: {0}")]
    BackendInit(#[source] LlmError),
}

/// Collaborators shared by every session in the process
#[derive(Clone)]
pub struct SessionContext {
    pub backend: Arc<dyn Backend>,
    pub store: Arc<SessionStore>,
    pub log: Arc<AppendLog>,
    pub identity: Arc<AssistantIdentity>,
    pub context_budget: u64,
}

/// Token usage against the context budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenInfo {
    pub used: u64,
    pub budget: u64,
    /// Negative once the conversation is over budget
    pub remaining: i64,
}

/// One conversation.
///
/// While a chat handle exists it owns the real history; `history` here is
/// refreshed from it before every read, save and count.
pub struct Session {
    id: String,
    ctx: SessionContext,
    state: SessionState,
    handle: Option<Box<dyn ChatHandle>>,
    history: Vec<Message>,
}

impl Session {
    /// A fresh, empty session with a newly generated id
    pub fn new(ctx: SessionContext) -> Self {
        Self::with_history(Uuid::new_v4().to_string(), Vec::new(), ctx)
    }

    /// A session resumed from stored history
    pub fn with_history(id: impl Into<String>, history: Vec<Message>, ctx: SessionContext) -> Self {
        Self {
            id: id.into(),
            ctx,
            state: SessionState::Constructed,
            handle: None,
            history,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn model_name(&self) -> &str {
        self.ctx.backend.model()
    }

    pub fn identity(&self) -> &AssistantIdentity {
        &self.ctx.identity
    }

    /// Build the chat handle. Must run before anything else.
    pub async fn initialize(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Terminated => Err(SessionError::Terminated(self.id.clone())),
            SessionState::Ready => Ok(()),
            _ => self.rebuild_handle().await,
        }
    }

    /// Send one user turn and return the model's reply.
    ///
    /// A failed backend call still leaves a user/model pair in history, with
    /// a placeholder as the model text and the error on the response. Every
    /// turn is written to the append log; nothing is saved to the store.
    pub async fn send_message(&mut self, text: &str) -> Result<LlmResponse, SessionError> {
        self.ensure_ready()?;
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| SessionError::NotReady(self.id.clone()))?;

        let response = match handle.send(text).await {
            Ok(reply) => LlmResponse {
                text: reply.text,
                tokens_used: reply.tokens_used,
                error: None,
            },
            Err(e) => {
                warn!("Model request failed in session {}: {}", self.id, e);
                handle.append(Message::new_user(text));
                handle.append(Message::new_model(PLACEHOLDER_RESPONSE));
                LlmResponse {
                    text: PLACEHOLDER_RESPONSE.to_string(),
                    tokens_used: None,
                    error: Some(e.to_string()),
                }
            }
        };

        self.sync_history().await;

        let tokens_used = match response.tokens_used {
            Some(tokens) => tokens,
            None => self.count_cached_tokens().await,
        };
        let entry = LogEntry::new(&self.id, self.model_name(), text, &response.text, tokens_used);
        if let Err(e) = self.ctx.log.append(entry).await {
            warn!("Failed to record exchange in append log: {}", e);
        }

        Ok(response)
    }

    /// Refresh history from the handle and write it to the store
    pub async fn save_to_file(&mut self) -> Result<SaveOutcome, SaveError> {
        self.sync_history().await;

        let was_ready = self.state == SessionState::Ready;
        if was_ready {
            self.state = SessionState::Saving;
        }
        let result = self.ctx.store.save(
            &self.id,
            &self.history,
            &self.ctx.identity.system_prompt,
            self.ctx.backend.model(),
        );
        if was_ready {
            self.state = SessionState::Ready;
        }

        result
    }

    /// Forget the whole conversation and start the backend over
    pub async fn clear_history(&mut self) -> Result<(), SessionError> {
        self.ensure_ready()?;
        self.history.clear();
        self.rebuild_handle().await?;
        self.persist_after_rewrite().await;
        Ok(())
    }

    /// Drop the last user/model pair. Returns false, changing nothing, when
    /// fewer than two messages exist.
    pub async fn pop_last_exchange(&mut self) -> Result<bool, SessionError> {
        self.ensure_ready()?;
        self.sync_history().await;

        if self.history.len() < 2 {
            return Ok(false);
        }

        let keep = self.history.len() - 2;
        self.history.truncate(keep);
        // Handles cannot delete turns, so start a new one from what is left
        self.rebuild_handle().await?;
        self.persist_after_rewrite().await;
        Ok(true)
    }

    pub async fn count_tokens(&mut self) -> Result<u64, SessionError> {
        self.ensure_ready()?;
        self.sync_history().await;
        Ok(self.count_cached_tokens().await)
    }

    pub async fn remaining_tokens(&mut self) -> Result<i64, SessionError> {
        Ok(self.token_info().await?.remaining)
    }

    pub async fn token_info(&mut self) -> Result<TokenInfo, SessionError> {
        let used = self.count_tokens().await?;
        let budget = self.ctx.context_budget;
        Ok(TokenInfo {
            used,
            budget,
            remaining: (budget as i64).saturating_sub(used as i64),
        })
    }

    /// True when a save would not write anything
    pub async fn is_empty(&mut self) -> bool {
        self.sync_history().await;
        self.history.len() < MIN_PERSISTED_MESSAGES
    }

    /// Current history, refreshed from the handle
    pub async fn history(&mut self) -> Vec<Message> {
        self.sync_history().await;
        self.history.clone()
    }

    /// Drop the chat handle. The session cannot be used afterwards.
    pub fn terminate(&mut self) {
        self.handle = None;
        self.state = SessionState::Terminated;
        debug!("Session {} terminated", self.id);
    }

    fn ensure_ready(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Ready => Ok(()),
            SessionState::Terminated => Err(SessionError::Terminated(self.id.clone())),
            _ => Err(SessionError::NotReady(self.id.clone())),
        }
    }

    async fn rebuild_handle(&mut self) -> Result<(), SessionError> {
        self.state = SessionState::Initializing;
        self.handle = None;

        match self
            .ctx
            .backend
            .create_session(&self.ctx.identity.system_prompt, self.history.clone())
            .await
        {
            Ok(handle) => {
                self.handle = Some(handle);
                self.state = SessionState::Ready;
                debug!(
                    "Session {} ready with {} messages on {}",
                    self.id,
                    self.history.len(),
                    self.ctx.backend.name()
                );
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Constructed;
                Err(SessionError::BackendInit(e))
            }
        }
    }

    async fn sync_history(&mut self) {
        if let Some(handle) = &self.handle {
            self.history = handle.history().await;
        }
    }

    async fn count_cached_tokens(&self) -> u64 {
        match &self.handle {
            Some(handle) => handle.count_tokens(&self.history).await,
            None => estimate_tokens(&self.history),
        }
    }

    async fn persist_after_rewrite(&mut self) {
        if let Err(e) = self.save_to_file().await {
            warn!("Failed to save session {} after rewriting history: {}", self.id, e);
        }
    }
}
