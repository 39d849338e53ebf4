//! Log command implementation for viewing the exchange log

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use crate::{
    config::Config,
    session::{AppendLog, LogEntry},
    utils::fs::write_atomic,
};

/// Show recent request/response exchanges
#[derive(Debug, Args)]
pub struct LogCommand {
    /// Number of entries to show from the end of the log
    #[arg(short, long, default_value = "20")]
    pub tail: usize,

    /// Output format (text, json)
    #[arg(long, default_value = "text")]
    pub format: LogFormat,

    /// Write the selected entries as JSON to a file in the exports directory
    #[arg(short, long)]
    pub export: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogCommand {
    /// Print the last entries, only those of `session` when given
    pub async fn execute(&self, config: &Config, session: Option<&str>) -> Result<()> {
        let log = AppendLog::in_dir(&config.data_dir);
        if !log.path().exists() {
            eprintln!("No exchange log found at: {}", log.path().display());
            return Ok(());
        }

        let entries = match session {
            Some(id) => last_for_session(log.read_all().await?, id, self.tail),
            None => log.tail(self.tail).await?,
        };

        if let Some(ref export) = self.export {
            let target = config.exports_dir().join(export);
            let json = serde_json::to_string_pretty(&entries)?;
            write_atomic(&target, json.as_bytes())
                .with_context(|| format!("Failed to export log to: {}", target.display()))?;
            println!("Exported {} entries to: {}", entries.len(), target.display());
            return Ok(());
        }

        match self.format {
            LogFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
            LogFormat::Text => {
                for entry in &entries {
                    println!("{}", format_entry(entry));
                }
            }
        }
        Ok(())
    }
}

/// The last `count` entries belonging to session `id`
fn last_for_session(entries: Vec<LogEntry>, id: &str, count: usize) -> Vec<LogEntry> {
    let mut entries: Vec<LogEntry> = entries.into_iter().filter(|e| e.session_id == id).collect();
    let start = entries.len().saturating_sub(count);
    entries.split_off(start)
}

/// Format: [TIME] SESSION MODEL (N tokens) followed by the prompt and reply
fn format_entry(entry: &LogEntry) -> String {
    format!(
        "[{}] {} {} ({} tokens)\n  > {}\n  < {}",
        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
        entry.session_id,
        entry.model,
        entry.tokens_used,
        entry.prompt,
        entry.response
    )
}
