//! Append-only transaction log shared by every session
//!
//! The log is a single JSON array rewritten on every append. It is the
//! forensic record of each exchange and is independent of session records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::utils::fs::write_atomic;

pub const LOG_FILE_NAME: &str = "chat_log.json";

/// One request/response transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub model: String,
    pub prompt: String,
    pub response: String,
    pub tokens_used: u64,
}

impl LogEntry {
    pub fn new(
        session_id: impl Into<String>,
        model: impl Into<String>,
        prompt: impl Into<String>,
        response: impl Into<String>,
        tokens_used: u64,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id: session_id.into(),
            model: model.into(),
            prompt: prompt.into(),
            response: response.into(),
            tokens_used,
        }
    }
}

#[derive(Error, Debug)]
pub enum LogError {
    #[error("failed to access log file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("log file {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize log: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The process-wide append log.
///
/// Appends are read-modify-write of the whole array, so they all go through
/// one mutex; two unserialized appends could drop an entry.
#[derive(Debug)]
pub struct AppendLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AppendLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    /// Log stored under `dir` with the default file name
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        Self::new(dir.as_ref().join(LOG_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry.
    ///
    /// A missing or blank file starts a new array. Content that is not a
    /// JSON array of log entries is overwritten with an empty array first;
    /// those bytes are lost. The file is replaced atomically, so a failed append leaves the
    /// previous log intact.
    pub async fn append(&self, entry: LogEntry) -> Result<(), LogError> {
        let _guard = self.lock.lock().await;

        let mut entries = match self.read_raw()? {
            Some(content) => match serde_json::from_str::<Vec<LogEntry>>(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(
                        "Append log {} is corrupt ({}); resetting it to an empty log",
                        self.path.display(),
                        e
                    );
                    self.write(b"[]")?;
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        debug!("Appending log entry #{} for session {}", entries.len() + 1, entry.session_id);
        entries.push(entry);
        let json = serde_json::to_string_pretty(&entries)?;
        self.write(json.as_bytes())?;

        Ok(())
    }

    /// Every entry in the log. Unlike `append`, corruption is an error here.
    pub async fn read_all(&self) -> Result<Vec<LogEntry>, LogError> {
        let _guard = self.lock.lock().await;

        match self.read_raw()? {
            Some(content) => serde_json::from_str(&content).map_err(|source| LogError::Corrupt {
                path: self.path.clone(),
                source,
            }),
            None => Ok(Vec::new()),
        }
    }

    /// The last `count` entries, oldest first
    pub async fn tail(&self, count: usize) -> Result<Vec<LogEntry>, LogError> {
        let mut entries = self.read_all().await?;
        let start = entries.len().saturating_sub(count);
        Ok(entries.split_off(start))
    }

    /// File content, or `None` when the file is absent or blank
    fn read_raw(&self) -> Result<Option<String>, LogError> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(None),
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(LogError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn write(&self, contents: &[u8]) -> Result<(), LogError> {
        write_atomic(&self.path, contents).map_err(|source| LogError::Io {
            path: self.path.clone(),
            source,
        })
    }
}
