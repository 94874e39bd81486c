//! Bounded per-chat conversation memory.
//!
//! Each chat keeps at most `max_history` user/assistant entries; older ones
//! fall off the front. System prompts and one-off hints are never stored, so
//! steering text can't accumulate. Histories are saved as one JSON array per
//! chat (`{history_dir}/{chat_id}.json`).

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_HISTORY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Part type the backend expects for plain text from this role.
    pub fn text_part_kind(self) -> &'static str {
        match self {
            Role::User => "input_text",
            Role::Assistant => "output_text",
        }
    }
}

/// Message content: plain text or structured parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One structured part (`{"type": ..., "text"?: ..., ...}`). Fields other than
/// `type` and `text` are kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ContentPart {
    pub fn text(kind: &str, text: &str) -> Self {
        Self {
            kind: kind.to_string(),
            text: Some(text.to_string()),
            extra: Map::new(),
        }
    }

    fn is_text(&self) -> bool {
        matches!(self.kind.as_str(), "text" | "input_text" | "output_text")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: Content,
}

impl HistoryEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Content::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::Text(text.into()),
        }
    }

    /// Backend shape: content always as parts, text parts typed by role.
    /// Rich parts (images, files, refusals) are left untouched.
    pub fn normalized(&self) -> Self {
        let kind = self.role.text_part_kind();
        let parts = match &self.content {
            Content::Text(text) => vec![ContentPart::text(kind, text)],
            Content::Parts(parts) => parts
                .iter()
                .map(|part| {
                    let mut part = part.clone();
                    if part.is_text() {
                        part.kind = kind.to_string();
                    }
                    part
                })
                .collect(),
        };

        Self {
            role: self.role,
            content: Content::Parts(parts),
        }
    }
}

/// Normalize a whole history for the backend.
pub fn normalize(entries: &[HistoryEntry]) -> Vec<HistoryEntry> {
    entries.iter().map(HistoryEntry::normalized).collect()
}

/// Failure to save or load one chat.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("failed to write '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to serialize history: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-chat rolling conversation windows.
pub struct HistoryStore {
    chats: HashMap<i64, Vec<HistoryEntry>>,
    max_history: usize,
    dir: Option<PathBuf>,
}

impl HistoryStore {
    /// In-memory store without persistence.
    pub fn new(max_history: usize) -> Self {
        Self {
            chats: HashMap::new(),
            max_history: max_history.max(1),
            dir: None,
        }
    }

    /// Store that persists to `dir`.
    pub fn with_dir(max_history: usize, dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Self::new(max_history)
        }
    }

    /// Append an entry, dropping the oldest ones past the bound.
    pub fn append(&mut self, chat_id: i64, entry: HistoryEntry) {
        let history = self.chats.entry(chat_id).or_default();
        history.push(entry);
        if history.len() > self.max_history {
            let excess = history.len() - self.max_history;
            history.drain(..excess);
        }
    }

    pub fn get(&self, chat_id: i64) -> Option<&[HistoryEntry]> {
        self.chats.get(&chat_id).map(Vec::as_slice)
    }

    /// Forget a chat's window, on disk too. Returns whether anything was stored.
    pub fn clear(&mut self, chat_id: i64) -> bool {
        let had = self.chats.remove(&chat_id).is_some();

        if let Some(path) = self.chat_path(chat_id) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove history file {}: {e}", path.display()),
            }
        }

        if had {
            info!("🧽 Cleared history for chat {}", chat_id);
        }
        had
    }

    /// Record a sibling bot's message as a user turn.
    pub fn inject_external(&mut self, chat_id: i64, emitter: &str, text: &str) {
        debug!("Injecting @{} message into chat {} history", emitter, chat_id);
        self.append(chat_id, HistoryEntry::user(format!("{emitter}: {text}")));
    }

    pub fn chat_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.chats.keys().copied()
    }

    fn chat_path(&self, chat_id: i64) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{chat_id}.json")))
    }

    /// Save one chat. Writes to a temp file and renames it into place.
    pub fn save_chat(&self, chat_id: i64) -> Result<(), HistoryError> {
        let (Some(path), Some(history)) = (self.chat_path(chat_id), self.chats.get(&chat_id)) else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(history)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|source| HistoryError::Io { path: path.clone(), source })
    }

    /// Save every chat. A failing chat is logged and skipped; the rest are
    /// still written. Returns the failures.
    pub fn persist(&self) -> Vec<(i64, HistoryError)> {
        let Some(dir) = self.dir.as_ref() else {
            return Vec::new();
        };

        if let Err(e) = fs::create_dir_all(dir) {
            warn!("Failed to create history dir {}: {e}", dir.display());
        }

        let mut failures = Vec::new();
        for &chat_id in self.chats.keys() {
            if let Err(e) = self.save_chat(chat_id) {
                warn!("Failed to save history for chat {}: {e}", chat_id);
                failures.push((chat_id, e));
            }
        }

        info!(
            "💾 Saved {} chat histories ({} failed)",
            self.chats.len() - failures.len(),
            failures.len()
        );
        failures
    }

    /// Load every `{chat_id}.json` in the history dir. Unknown fields and
    /// roles other than user/assistant are dropped; the bound is re-applied.
    /// Returns the number of chats loaded.
    pub fn restore(&mut self) -> usize {
        let Some(dir) = self.dir.clone() else {
            return 0;
        };

        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No history dir, starting fresh");
                return 0;
            }
            Err(e) => {
                warn!("Failed to read history dir {}: {e}", dir.display());
                return 0;
            }
        };

        let mut loaded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(chat_id) = chat_id_from_path(&path) else {
                continue;
            };

            match load_entries(&path) {
                Ok(mut history) => {
                    if history.len() > self.max_history {
                        history.drain(..history.len() - self.max_history);
                    }
                    self.chats.insert(chat_id, history);
                    loaded += 1;
                }
                Err(e) => warn!("Skipping history: {e}"),
            }
        }

        info!("Loaded {} chat histories from {}", loaded, dir.display());
        loaded
    }
}

fn chat_id_from_path(path: &Path) -> Option<i64> {
    if path.extension()? != "json" {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

fn load_entries(path: &Path) -> Result<Vec<HistoryEntry>, HistoryError> {
    let json = fs::read_to_string(path).map_err(|source| HistoryError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: Vec<Value> = serde_json::from_str(&json).map_err(|source| HistoryError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(raw
        .into_iter()
        .filter_map(|value| serde_json::from_value::<HistoryEntry>(value).ok())
        .collect())
}
