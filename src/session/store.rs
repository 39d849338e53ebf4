//! File-backed session records
//!
//! Each session lives in its own pretty-printed JSON document named
//! `session_<id>.json` under the sessions directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    llm::{Message, MessageRole},
    utils::fs::write_atomic,
};

const FILE_PREFIX: &str = "session_";
const FILE_EXTENSION: &str = "json";

/// A record needs at least one full exchange before it is written
pub const MIN_PERSISTED_MESSAGES: usize = 2;

/// One message as it appears on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: MessageRole,
    pub text: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<&Message> for StoredMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            text: message.first_text().unwrap_or_default().to_string(),
            timestamp: message.timestamp,
        }
    }
}

impl From<StoredMessage> for Message {
    fn from(stored: StoredMessage) -> Self {
        let mut message = Message::new_text(stored.role, stored.text);
        message.timestamp = stored.timestamp;
        message
    }
}

/// Full on-disk state of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub model: String,
    pub system_role: String,
    pub history: Vec<StoredMessage>,
}

impl SessionRecord {
    pub fn messages(&self) -> Vec<Message> {
        self.history.iter().cloned().map(Message::from).collect()
    }

    fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.history.iter().rev().find_map(|m| m.timestamp)
    }
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("session file {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to read session file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum SaveError {
    #[error("failed to serialize session {id}: {source}")]
    Serialize {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write session file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum RemoveError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("failed to remove session file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What a successful save did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Written(PathBuf),
    /// History too short to persist; nothing on disk was touched
    Skipped,
}

/// Summary of a readable record
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub message_count: usize,
    pub last_activity: Option<DateTime<Utc>>,
}

/// One row of [`SessionStore::list`]
#[derive(Debug, Clone)]
pub struct SessionListing {
    pub id: String,
    /// The summary, or why the file could not be read
    pub details: Result<SessionSummary, String>,
}

/// Reads and writes session records in one directory
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions_dir: PathBuf,
}

impl SessionStore {
    pub fn new<P: AsRef<Path>>(sessions_dir: P) -> Self {
        Self {
            sessions_dir: sessions_dir.as_ref().to_path_buf(),
        }
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// Get the file path for a session
    pub fn session_path(&self, id: &str) -> PathBuf {
        let safe_id = id.replace([':', '/', '\\', '.'], "_");
        self.sessions_dir
            .join(format!("{}{}.{}", FILE_PREFIX, safe_id, FILE_EXTENSION))
    }

    /// Load only the history of a session
    pub fn load(&self, id: &str) -> Result<Vec<Message>, LoadError> {
        self.load_record(id).map(|record| record.messages())
    }

    /// Load a whole record. A corrupt file is reported and left in place.
    pub fn load_record(&self, id: &str) -> Result<SessionRecord, LoadError> {
        let path = self.session_path(id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(LoadError::NotFound(id.to_string()))
            }
            Err(source) => return Err(LoadError::Io { path, source }),
        };

        serde_json::from_str(&content).map_err(|source| LoadError::Corrupt { path, source })
    }

    /// Persist a session, replacing any earlier record for the same id.
    ///
    /// Histories shorter than one exchange are skipped without error.
    pub fn save(
        &self,
        id: &str,
        history: &[Message],
        system_prompt: &str,
        model: &str,
    ) -> Result<SaveOutcome, SaveError> {
        if history.len() < MIN_PERSISTED_MESSAGES {
            debug!("Skipping save of session {} with {} messages", id, history.len());
            return Ok(SaveOutcome::Skipped);
        }

        let record = SessionRecord {
            session_id: id.to_string(),
            model: model.to_string(),
            system_role: system_prompt.to_string(),
            history: history.iter().map(StoredMessage::from).collect(),
        };
        let json = serde_json::to_string_pretty(&record).map_err(|source| SaveError::Serialize {
            id: id.to_string(),
            source,
        })?;

        let path = self.session_path(id);
        write_atomic(&path, json.as_bytes()).map_err(|source| SaveError::Io {
            path: path.clone(),
            source,
        })?;

        debug!("Saved session {} ({} messages)", id, history.len());
        Ok(SaveOutcome::Written(path))
    }

    /// List every record, newest first. Unreadable files are listed last
    /// with the reason instead of being dropped.
    pub fn list(&self) -> Vec<SessionListing> {
        let entries = match fs::read_dir(&self.sessions_dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to read sessions directory {}: {}", self.sessions_dir.display(), e);
                }
                return Vec::new();
            }
        };

        let mut listings: Vec<SessionListing> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                let id = Self::id_from_path(&path)?;
                let details = Self::summarize(&path);
                Some(SessionListing { id, details })
            })
            .collect();

        listings.sort_by(|a, b| {
            let order = match (&a.details, &b.details) {
                (Ok(a), Ok(b)) => b.last_activity.cmp(&a.last_activity),
                (Ok(_), Err(_)) => Ordering::Less,
                (Err(_), Ok(_)) => Ordering::Greater,
                (Err(_), Err(_)) => Ordering::Equal,
            };
            order.then_with(|| a.id.cmp(&b.id))
        });

        listings
    }

    /// Delete a session record
    pub fn remove(&self, id: &str) -> Result<(), RemoveError> {
        let path = self.session_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed session file {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(RemoveError::NotFound(id.to_string())),
            Err(source) => Err(RemoveError::Io { path, source }),
        }
    }

    fn id_from_path(path: &Path) -> Option<String> {
        if path.extension().and_then(|ext| ext.to_str()) != Some(FILE_EXTENSION) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        stem.strip_prefix(FILE_PREFIX).map(str::to_string)
    }

    fn summarize(path: &Path) -> Result<SessionSummary, String> {
        let content = fs::read_to_string(path).map_err(|e| e.to_string())?;
        let record: SessionRecord = serde_json::from_str(&content).map_err(|e| e.to_string())?;

        let last_activity = record.last_activity().or_else(|| {
            fs::metadata(path)
                .and_then(|meta| meta.modified())
                .ok()
                .map(DateTime::<Utc>::from)
        });

        Ok(SessionSummary {
            message_count: record.history.len(),
            last_activity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn exchange(user: &str, model: &str, minute: u32) -> Vec<Message> {
        let mut user_msg = Message::new_user(user);
        user_msg.timestamp = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap());
        let mut model_msg = Message::new_model(model);
        model_msg.timestamp = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 30).unwrap());
        vec![user_msg, model_msg]
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = SessionStore::new(temp_dir.path());
        let mut history = exchange("hello", "hi", 0);
        history.extend(exchange("how are you?", "fine", 1));

        let outcome = store.save("abc", &history, "be kind", "gpt-4o").unwrap();
        assert_eq!(outcome, SaveOutcome::Written(store.session_path("abc")));

        assert_eq!(store.load("abc").unwrap(), history);

        let record = store.load_record("abc").unwrap();
        assert_eq!(record.session_id, "abc");
        assert_eq!(record.model, "gpt-4o");
        assert_eq!(record.system_role, "be kind");
    }

    #[test]
    fn test_save_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = SessionStore::new(temp_dir.path());
        let history = exchange("hello", "hi", 0);

        store.save("abc", &history, "sys", "m").unwrap();
        let first = fs::read(store.session_path("abc")).unwrap();
        store.save("abc", &history, "sys", "m").unwrap();
        let second = fs::read(store.session_path("abc")).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_short_history_is_not_persisted() {
        let temp_dir = TempDir::new().unwrap();
        let store = SessionStore::new(temp_dir.path());

        assert_eq!(store.save("empty", &[], "sys", "m").unwrap(), SaveOutcome::Skipped);
        assert_eq!(
            store.save("half", &[Message::new_user("hello")], "sys", "m").unwrap(),
            SaveOutcome::Skipped
        );
        assert!(!store.session_path("empty").exists());
        assert!(!store.session_path("half").exists());

        // An existing record is left alone by a skipped save
        let history = exchange("hello", "hi", 0);
        store.save("kept", &history, "sys", "m").unwrap();
        store.save("kept", &[], "sys", "m").unwrap();
        assert_eq!(store.load("kept").unwrap(), history);
    }

    #[test]
    fn test_only_first_text_part_is_persisted() {
        let temp_dir = TempDir::new().unwrap();
        let store = SessionStore::new(temp_dir.path());
        let mut history = exchange("hello", "hi", 0);
        history[1]
            .content
            .push(crate::llm::ContentBlock::Text { text: " there".to_string() });

        store.save("parts", &history, "sys", "m").unwrap();
        let loaded = store.load("parts").unwrap();
        assert_eq!(loaded[1].get_text_content(), "hi");
    }

    #[test]
    fn test_load_missing_and_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let store = SessionStore::new(temp_dir.path());

        assert!(matches!(store.load("nope"), Err(LoadError::NotFound(id)) if id == "nope"));

        let path = store.session_path("broken");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(store.load("broken"), Err(LoadError::Corrupt { .. })));

        // The corrupt file is preserved for inspection
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn test_list_reports_corrupt_entries_without_hiding_others() {
        let temp_dir = TempDir::new().unwrap();
        let store = SessionStore::new(temp_dir.path());

        store.save("older", &exchange("a", "b", 0), "sys", "m").unwrap();
        let mut newer = exchange("c", "d", 5);
        newer.extend(exchange("e", "f", 6));
        store.save("newer", &newer, "sys", "m").unwrap();
        fs::write(store.session_path("broken"), "[1, 2").unwrap();
        fs::write(temp_dir.path().join("chat_log.json"), "[]").unwrap();

        let listings = store.list();
        let ids: Vec<&str> = listings.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["newer", "older", "broken"]);

        let newer_details = listings[0].details.as_ref().unwrap();
        assert_eq!(newer_details.message_count, 4);
        assert_eq!(
            newer_details.last_activity,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 6, 30).unwrap())
        );
        assert!(listings[2].details.is_err());
    }

    #[test]
    fn test_list_missing_directory_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = SessionStore::new(temp_dir.path().join("does-not-exist"));
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_remove() {
        let temp_dir = TempDir::new().unwrap();
        let store = SessionStore::new(temp_dir.path());
        store.save("abc", &exchange("a", "b", 0), "sys", "m").unwrap();

        store.remove("abc").unwrap();
        assert!(!store.session_path("abc").exists());
        assert!(matches!(store.remove("abc"), Err(RemoveError::NotFound(_))));
    }

    #[test]
    fn test_session_path_cannot_escape_directory() {
        let store = SessionStore::new("/data/sessions");
        let path = store.session_path("../../etc/passwd");
        assert_eq!(path.parent().unwrap(), Path::new("/data/sessions"));
    }
}
