//! Owner of the one active session

use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::session::{
    session::{Session, SessionContext, SessionError},
    store::{LoadError, RemoveError, SaveError, SaveOutcome, SessionListing},
};

/// What happened to the previous session when another became active
#[derive(Debug)]
pub struct SessionTransition {
    pub previous_id: String,
    /// `None` when saving was not requested
    pub save: Option<Result<SaveOutcome, SaveError>>,
    pub active_id: String,
}

impl SessionTransition {
    pub fn save_error(&self) -> Option<&SaveError> {
        self.save.as_ref().and_then(|result| result.as_ref().err())
    }
}

#[derive(Debug)]
pub struct RemovalReport {
    pub removed_id: String,
    pub removal: Result<(), RemoveError>,
    pub active_id: String,
}

#[derive(Error, Debug)]
pub enum SwitchError {
    #[error("could not load session {id}: {source}")]
    Load {
        id: String,
        #[source]
        source: LoadError,
        save_error: Option<SaveError>,
    },

    #[error("could not start session {id}: {source}")]
    Init {
        id: String,
        #[source]
        source: SessionError,
        save_error: Option<SaveError>,
    },
}

impl SwitchError {
    /// Failure to save the session that stayed active, if any
    pub fn save_error(&self) -> Option<&SaveError> {
        match self {
            SwitchError::Load { save_error, .. } | SwitchError::Init { save_error, .. } => {
                save_error.as_ref()
            }
        }
    }
}

/// Result of the shutdown save
#[derive(Debug, PartialEq, Eq)]
pub enum CleanupOutcome {
    SkippedEmpty,
    Saved,
    Failed(String),
    TimedOut,
}

/// Keeps exactly one active [`Session`] and moves between sessions
/// without losing the one being left.
pub struct SessionManager {
    ctx: SessionContext,
    active: Session,
}

impl SessionManager {
    /// Start with a resumed session, or a fresh one when `resume_id` is
    /// absent or cannot be loaded. A corrupt record is left on disk and the
    /// fresh session gets a new id, so it is never overwritten.
    pub async fn start(ctx: SessionContext, resume_id: Option<&str>) -> Result<Self, SessionError> {
        let mut active = match resume_id {
            Some(id) => match ctx.store.load(id) {
                Ok(history) => {
                    info!("Resuming session {} ({} messages)", id, history.len());
                    Session::with_history(id, history, ctx.clone())
                }
                Err(e @ LoadError::NotFound(_)) => {
                    warn!("{}; starting a new session", e);
                    Session::new(ctx.clone())
                }
                Err(e) => {
                    warn!("{}; starting a new session and leaving the file untouched", e);
                    Session::new(ctx.clone())
                }
            },
            None => Session::new(ctx.clone()),
        };

        active.initialize().await?;
        Ok(Self { ctx, active })
    }

    pub fn active(&self) -> &Session {
        &self.active
    }

    pub fn active_mut(&mut self) -> &mut Session {
        &mut self.active
    }

    pub fn list_sessions(&self) -> Vec<SessionListing> {
        self.ctx.store.list()
    }

    /// Replace the active session with an empty one. The old session is
    /// saved first when asked; a failed save is reported, not fatal.
    pub async fn create_new_session(
        &mut self,
        save_current: bool,
    ) -> Result<SessionTransition, SessionError> {
        let save = if save_current {
            Some(self.save_active().await)
        } else {
            None
        };

        let mut fresh = Session::new(self.ctx.clone());
        fresh.initialize().await?;

        let previous_id = self.replace_active(fresh);
        info!("Started session {}", self.active.id());

        Ok(SessionTransition {
            previous_id,
            save,
            active_id: self.active.id().to_string(),
        })
    }

    /// Save the active session and make `target_id` active.
    ///
    /// Callers should not switch to the id that is already active. On any
    /// failure the current session stays active.
    pub async fn switch_to_session(&mut self, target_id: &str) -> Result<SessionTransition, SwitchError> {
        let save = self.save_active().await;

        let record = match self.ctx.store.load_record(target_id) {
            Ok(record) => record,
            Err(source) => {
                return Err(SwitchError::Load {
                    id: target_id.to_string(),
                    source,
                    save_error: save.err(),
                })
            }
        };

        if record.model != self.ctx.backend.model() {
            warn!(
                "Session {} was recorded with model {}; continuing with {}",
                target_id,
                record.model,
                self.ctx.backend.model()
            );
        }

        let mut target = Session::with_history(target_id, record.messages(), self.ctx.clone());
        if let Err(source) = target.initialize().await {
            return Err(SwitchError::Init {
                id: target_id.to_string(),
                source,
                save_error: save.err(),
            });
        }

        let previous_id = self.replace_active(target);
        info!("Switched from session {} to {}", previous_id, target_id);

        Ok(SessionTransition {
            previous_id,
            save: Some(save),
            active_id: target_id.to_string(),
        })
    }

    /// Delete the active session's record and start an empty session.
    /// A failed removal is reported; the new session is created regardless.
    pub async fn remove_current_session_and_create_new(&mut self) -> Result<RemovalReport, SessionError> {
        let removed_id = self.active.id().to_string();
        let removal = self.ctx.store.remove(&removed_id);
        if let Err(e) = &removal {
            warn!("Failed to remove session {}: {}", removed_id, e);
        }

        let mut fresh = Session::new(self.ctx.clone());
        fresh.initialize().await?;
        self.replace_active(fresh);

        Ok(RemovalReport {
            removed_id,
            removal,
            active_id: self.active.id().to_string(),
        })
    }

    /// Final save on shutdown, bounded by `timeout`. Never fails; the
    /// outcome is logged and returned.
    pub async fn cleanup_and_save(&mut self, timeout: Duration) -> CleanupOutcome {
        let active = &mut self.active;
        let attempt = tokio::time::timeout(timeout, async {
            if active.is_empty().await {
                return CleanupOutcome::SkippedEmpty;
            }
            match active.save_to_file().await {
                Ok(_) => CleanupOutcome::Saved,
                Err(e) => CleanupOutcome::Failed(e.to_string()),
            }
        })
        .await;

        let outcome = attempt.unwrap_or(CleanupOutcome::TimedOut);
        match &outcome {
            CleanupOutcome::SkippedEmpty => info!("Session {} is empty; nothing to save", self.active.id()),
            CleanupOutcome::Saved => info!("Session {} saved", self.active.id()),
            CleanupOutcome::Failed(reason) => {
                error!("Failed to save session {} on exit: {}", self.active.id(), reason)
            }
            CleanupOutcome::TimedOut => error!(
                "Saving session {} on exit timed out after {:?}",
                self.active.id(),
                timeout
            ),
        }
        outcome
    }

    async fn save_active(&mut self) -> Result<SaveOutcome, SaveError> {
        let result = self.active.save_to_file().await;
        if let Err(e) = &result {
            warn!("Failed to save session {}: {}", self.active.id(), e);
        }
        result
    }

    fn replace_active(&mut self, next: Session) -> String {
        let mut previous = std::mem::replace(&mut self.active, next);
        previous.terminate();
        previous.id().to_string()
    }
}
