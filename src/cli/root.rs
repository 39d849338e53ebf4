use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use super::{logs::LogCommand, run::RunCommand, sessions::SessionsCommand};
use crate::app::{cancel_on_ctrl_c, App};
use crate::config::Config;

/// chatkeep - a terminal chat client that never loses a conversation
#[derive(Debug, Parser)]
#[command(
    name = "chatkeep",
    version,
    about = "A terminal chat client that never loses a conversation",
    long_about = r#"chatkeep keeps every conversation with an LLM backend on disk, so sessions
can be resumed, switched and replayed.

Examples:
  chatkeep                            # Start interactive mode
  chatkeep --session <id>             # Resume a saved session
  chatkeep run "explain this error"   # Run a single prompt
  chatkeep sessions                   # List saved sessions
  chatkeep log --tail 5               # Show the last five exchanges"#
)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long = "debug", global = true)]
    pub debug: bool,

    /// Resume this session instead of starting a new one; filters `log`
    #[arg(short = 's', long = "session", global = true, value_name = "ID")]
    pub session: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a single prompt non-interactively
    Run(RunCommand),
    /// List or remove saved sessions
    Sessions(SessionsCommand),
    /// Show recent exchanges from the log
    Log(LogCommand),
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        if self.debug {
            debug!("Debug logging enabled");
        }

        let config = Config::init().await?;
        debug!("Configuration initialized");

        match self.command {
            Some(Commands::Run(ref run_cmd)) => run_cmd.execute(&config, self.session.as_deref()).await,
            Some(Commands::Sessions(ref sessions_cmd)) => sessions_cmd.execute(&config).await,
            Some(Commands::Log(ref log_cmd)) => log_cmd.execute(&config, self.session.as_deref()).await,
            None => self.start_interactive_mode(config).await,
        }
    }

    async fn start_interactive_mode(&self, config: Config) -> Result<()> {
        info!("Starting interactive mode");

        let cancel = cancel_on_ctrl_c();
        let mut app = App::new(config, self.session.as_deref()).await?;
        app.run_interactive(cancel).await?;

        info!("Application finished");
        Ok(())
    }
}
