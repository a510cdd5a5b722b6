//! Durable message history.
//!
//! The history is a single JSON document holding an ordered array of
//! messages. Bot messages linked to a `run_id` with `streaming` set are still
//! being reassembled; once finalized both fields are cleared and the message
//! never changes again.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Bot,
}

/// A stored chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget: Option<Value>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub streaming: bool,
}

impl Message {
    pub fn user(text: impl Into<String>, images: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::User,
            text: text.into(),
            images,
            widget: None,
            timestamp: now_millis(),
            run_id: None,
            streaming: false,
        }
    }

    /// A bot message still receiving deltas for `run_id`.
    pub fn streaming_bot(run_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::Bot,
            text: text.into(),
            images: Vec::new(),
            widget: None,
            timestamp: now_millis(),
            run_id: Some(run_id.into()),
            streaming: true,
        }
    }

    pub const fn is_mutable(&self) -> bool {
        self.streaming && self.run_id.is_some()
    }
}

/// JSON-document backed history. `path == None` keeps it in memory.
#[derive(Debug)]
pub struct HistoryStore {
    path: Option<PathBuf>,
    messages: Mutex<Vec<Message>>,
}

impl HistoryStore {
    /// Open the history file, starting empty if it does not exist.
    pub fn open(path: &Path) -> Result<Self> {
        let messages = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            if data.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&data).map_err(|e| {
                    Error::History(format!("Failed to parse {}: {e}", path.display()))
                })?
            }
        } else {
            Vec::new()
        };
        debug!(path = %path.display(), count = messages.len(), "History loaded");
        Ok(Self {
            path: Some(path.to_path_buf()),
            messages: Mutex::new(messages),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            messages: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Message>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, messages: &[Message]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_json_atomic(path, &messages)
    }

    /// Snapshot of every stored message, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.lock().clone()
    }

    pub fn append(&self, message: Message) -> Result<()> {
        let mut messages = self.lock();
        messages.push(message);
        self.persist(&messages)
    }

    /// The still-mutable message linked to `run_id`, if any.
    pub fn find_streaming(&self, run_id: &str) -> Option<Message> {
        self.lock()
            .iter()
            .rev()
            .find(|m| m.is_mutable() && m.run_id.as_deref() == Some(run_id))
            .cloned()
    }

    /// Apply `f` to the message with `id` and persist. Returns whether it existed.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut Message)) -> Result<bool> {
        let mut messages = self.lock();
        let Some(message) = messages.iter_mut().find(|m| m.id == id) else {
            return Ok(false);
        };
        f(message);
        self.persist(&messages)?;
        Ok(true)
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut messages = self.lock();
        let before = messages.len();
        messages.retain(|m| m.id != id);
        if messages.len() == before {
            return Ok(false);
        }
        self.persist(&messages)?;
        Ok(true)
    }
}

/// Serialize `value` to `path` via a temp file and rename.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        warn!(path = %path.display(), error = %e, "Atomic rename failed");
        std::fs::remove_file(&tmp).ok();
        return Err(e.into());
    }
    Ok(())
}
