//! Core application logic and orchestration
//!
//! [`App`] wires configuration, the chat backend, storage and the
//! [`SessionManager`] together and drives the interactive loop.

mod commands;
mod identity;

pub use commands::*;
pub use identity::*;

use anyhow::{anyhow, Result};
use std::{io::Write, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    llm::create_backend,
    session::{
        AppendLog, RemoveError, SessionContext, SessionError, SessionListing, SessionManager,
        SwitchError,
    },
    utils::fs::ensure_dir,
};

/// What the loop does after a line is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Main application structure
pub struct App {
    config: Config,
    manager: SessionManager,
}

impl App {
    /// Build the backend and storage from `config` and start a session,
    /// resuming `resume_id` when given
    pub async fn new(config: Config, resume_id: Option<&str>) -> Result<Self> {
        debug!("Creating new App instance");
        config.validate()?;

        ensure_dir(config.sessions_dir())?;
        ensure_dir(config.exports_dir())?;

        let backend = create_backend(config.provider_config()?)?;
        info!("Using {} backend with model {}", backend.name(), backend.model());

        let ctx = SessionContext {
            backend,
            store: Arc::new(crate::session::SessionStore::new(config.sessions_dir())),
            log: Arc::new(AppendLog::in_dir(&config.data_dir)),
            identity: Arc::new(AssistantIdentity::from_config(&config)),
            context_budget: config.context_budget,
        };

        Self::with_context(config, ctx, resume_id).await
    }

    pub async fn with_context(config: Config, ctx: SessionContext, resume_id: Option<&str>) -> Result<Self> {
        let manager = SessionManager::start(ctx, resume_id).await?;
        Ok(Self { config, manager })
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Read lines from stdin until `/quit`, end of input, or `cancel` fires,
    /// then save the active session. The save runs even when the loop fails.
    pub async fn run_interactive(&mut self, cancel: CancellationToken) -> Result<()> {
        info!("Starting interactive mode");
        let result = self.interactive_loop(&cancel).await;
        if let Err(e) = &result {
            error!("Interactive loop failed: {:#}", e);
        }

        if cancel.is_cancelled() {
            println!();
            info!("Interrupted; saving before exit");
        }
        self.shutdown().await;
        result
    }

    async fn interactive_loop(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut stdout = std::io::stdout();
        writeln!(
            stdout,
            "Session {} ({}). Type /help for commands.",
            self.manager.active().id(),
            self.manager.active().model_name()
        )?;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            write!(stdout, "> ")?;
            stdout.flush()?;

            let line = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                return Ok(());
            };

            let grace = self.config.shutdown_timeout();
            let handling = self.handle_line(&line, &mut stdout);
            tokio::pin!(handling);

            let flow = tokio::select! {
                flow = &mut handling => flow?,
                _ = cancel.cancelled() => {
                    info!("Interrupted; letting the current request finish");
                    if tokio::time::timeout(grace, &mut handling).await.is_err() {
                        warn!("Request still running after {:?}; abandoning it", grace);
                    }
                    return Ok(());
                }
            };
            if flow == Flow::Quit {
                return Ok(());
            }
        }
    }

    /// One prompt in the active session, saved afterwards
    pub async fn run_non_interactive(&mut self, prompt: &str) -> Result<String> {
        info!("Running non-interactive prompt");
        debug!("Prompt: {}", prompt);

        let session = self.manager.active_mut();
        let response = session.send_message(prompt).await?;
        if let Err(e) = session.save_to_file().await {
            warn!("Failed to save session {}: {}", session.id(), e);
        }

        match response.error {
            Some(error) => Err(anyhow!("model request failed: {}", error)),
            None => Ok(response.text),
        }
    }

    /// Handle one line of input, writing user-facing output to `out`
    pub async fn handle_line<W: Write>(&mut self, line: &str, out: &mut W) -> Result<Flow> {
        match Command::parse(line) {
            Command::Empty => {}
            Command::Message(text) => self.chat(&text, out).await?,
            Command::New => match self.manager.create_new_session(true).await {
                Ok(transition) => {
                    if let Some(e) = transition.save_error() {
                        writeln!(out, "Could not save session {}: {}", transition.previous_id, e)?;
                    }
                    writeln!(out, "Started session {}", transition.active_id)?;
                }
                Err(e) => self.report_no_new_session(&e, out)?,
            },
            Command::Switch(id) => self.switch(&id, out).await?,
            Command::Remove => match self.manager.remove_current_session_and_create_new().await {
                Ok(report) => {
                    match &report.removal {
                        Ok(()) => writeln!(out, "Removed session {}", report.removed_id)?,
                        Err(RemoveError::NotFound(_)) => {
                            writeln!(out, "Session {} was never saved", report.removed_id)?
                        }
                        Err(e) => writeln!(out, "Could not remove session {}: {}", report.removed_id, e)?,
                    }
                    writeln!(out, "Started session {}", report.active_id)?;
                }
                Err(e) => self.report_no_new_session(&e, out)?,
            },
            Command::Clear => match self.manager.active_mut().clear_history().await {
                Ok(()) => writeln!(out, "History cleared")?,
                Err(e) => writeln!(out, "Could not clear history: {}", e)?,
            },
            Command::Undo => match self.manager.active_mut().pop_last_exchange().await {
                Ok(true) => writeln!(out, "Removed the last exchange")?,
                Ok(false) => writeln!(out, "Nothing to undo")?,
                Err(e) => writeln!(out, "Could not undo: {}", e)?,
            },
            Command::Tokens => match self.manager.active_mut().token_info().await {
                Ok(info) => writeln!(
                    out,
                    "Tokens: {} used of {} ({} remaining)",
                    info.used, info.budget, info.remaining
                )?,
                Err(e) => writeln!(out, "Could not count tokens: {}", e)?,
            },
            Command::Sessions => {
                let listings = self.manager.list_sessions();
                if listings.is_empty() {
                    writeln!(out, "No saved sessions")?;
                }
                let active_id = self.manager.active().id().to_string();
                for listing in &listings {
                    writeln!(out, "{}", describe_listing(listing, Some(&active_id)))?;
                }
            }
            Command::Help => writeln!(out, "{}", HELP)?,
            Command::Quit => return Ok(Flow::Quit),
            Command::Invalid(reason) => writeln!(out, "{}", reason)?,
        }
        Ok(Flow::Continue)
    }

    /// Final save, bounded by the configured timeout
    pub async fn shutdown(&mut self) {
        info!("Shutting down application");
        self.manager.cleanup_and_save(self.config.shutdown_timeout()).await;
    }

    async fn chat<W: Write>(&mut self, text: &str, out: &mut W) -> Result<()> {
        let session = self.manager.active_mut();
        let response = match session.send_message(text).await {
            Ok(response) => response,
            Err(e) => {
                writeln!(out, "Could not send message: {}", e)?;
                return Ok(());
            }
        };

        writeln!(out, "{}: {}", session.identity().display_name, response.text)?;
        if let Some(error) = &response.error {
            warn!("Model request failed: {}", error);
            return Ok(());
        }

        if let Err(e) = session.save_to_file().await {
            warn!("Failed to save session {}: {}", session.id(), e);
        }
        Ok(())
    }

    fn report_no_new_session<W: Write>(&self, error: &SessionError, out: &mut W) -> Result<()> {
        warn!("Could not start a new session: {}", error);
        writeln!(out, "Could not start a new session: {}", error)?;
        writeln!(out, "Still in session {}", self.manager.active().id())?;
        Ok(())
    }

    async fn switch<W: Write>(&mut self, id: &str, out: &mut W) -> Result<()> {
        if id == self.manager.active().id() {
            writeln!(out, "Already in session {}", id)?;
            return Ok(());
        }

        match self.manager.switch_to_session(id).await {
            Ok(transition) => {
                if let Some(e) = transition.save_error() {
                    writeln!(out, "Could not save session {}: {}", transition.previous_id, e)?;
                }
                let count = self.manager.active_mut().history().await.len();
                writeln!(out, "Switched to session {} ({} messages)", transition.active_id, count)?;
            }
            Err(e) => {
                if let Some(save_error) = e.save_error() {
                    writeln!(out, "Could not save the current session: {}", save_error)?;
                }
                let detail = match &e {
                    SwitchError::Load { source, .. } => source.to_string(),
                    SwitchError::Init { source, .. } => source.to_string(),
                };
                writeln!(out, "Could not switch to {}: {}", id, detail)?;
                writeln!(out, "Still in session {}", self.manager.active().id())?;
            }
        }
        Ok(())
    }
}

/// One line describing a stored session. `active_id` gets a marker.
pub fn describe_listing(listing: &SessionListing, active_id: Option<&str>) -> String {
    let marker = if active_id == Some(listing.id.as_str()) { "*" } else { " " };
    match &listing.details {
        Ok(summary) => {
            let when = summary
                .last_activity
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string());
            format!("{} {}  {:>4} messages  {}", marker, listing.id, summary.message_count, when)
        }
        Err(reason) => format!("{} {}  [unreadable: {}]", marker, listing.id, reason),
    }
}

/// Token cancelled on the first Ctrl-C
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C");
                trigger.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
    });
    token
}
