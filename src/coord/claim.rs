//! Cross-process message claims.
//!
//! Several bot processes watch the same chats. Before answering an event each
//! one tries to create a claim file for it; the filesystem's create-if-absent
//! guarantees exactly one of them wins. The file content is the winner's
//! identity and is only used for debugging.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Key of one claimable event inside a chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClaimKey {
    chat_id: i64,
    key: String,
}

impl ClaimKey {
    /// Key for an event with a stable platform id (every bot in a group sees
    /// the same Telegram message id).
    pub fn for_event(chat_id: i64, event_id: i64) -> Self {
        Self {
            chat_id,
            key: event_id.to_string(),
        }
    }

    /// Key for an event without a stable id, fingerprinted by sender and content.
    ///
    /// Two distinct events with the same sender and text collide; the second
    /// one is treated as already claimed.
    pub fn for_content(chat_id: i64, sender: &str, content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(chat_id.to_le_bytes());
        hasher.update(sender.as_bytes());
        hasher.update([0u8]);
        hasher.update(content.as_bytes());
        let digest = format!("{:x}", hasher.finalize());

        Self {
            chat_id,
            key: format!("h{}", &digest[..32]),
        }
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    /// File name of the claim record: `{chat_id}_{key}`.
    pub fn file_name(&self) -> String {
        format!("{}_{}", self.chat_id, self.key)
    }
}

/// Exclusive, one-shot ownership of events.
pub trait ClaimStore: Send + Sync {
    /// Try to take ownership of `key`. Across all processes sharing the store,
    /// exactly one caller ever gets `true` for a given key.
    fn try_claim(&self, key: &ClaimKey, identity: &str) -> bool;

    /// Remove claims older than `max_age`. Returns how many were removed.
    fn sweep(&self, max_age: Duration) -> usize;
}

/// Claim store backed by a directory of marker files.
pub struct FileClaimStore {
    dir: PathBuf,
}

impl FileClaimStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the claim directory if it doesn't exist.
    pub fn init(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    fn create_exclusive(path: &Path) -> std::io::Result<File> {
        OpenOptions::new().write(true).create_new(true).open(path)
    }
}

impl ClaimStore for FileClaimStore {
    fn try_claim(&self, key: &ClaimKey, identity: &str) -> bool {
        let path = self.dir.join(key.file_name());

        let mut file = match Self::create_exclusive(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Claim {} already taken", key.file_name());
                return false;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Directory vanished (tmp cleaner, fresh host); recreate once.
                if let Err(e) = fs::create_dir_all(&self.dir) {
                    warn!("Failed to create claim dir {}: {e}", self.dir.display());
                    return false;
                }
                match Self::create_exclusive(&path) {
                    Ok(f) => f,
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => return false,
                    Err(e) => {
                        warn!("Failed to create claim {}: {e}", path.display());
                        return false;
                    }
                }
            }
            Err(e) => {
                warn!("Failed to create claim {}: {e}", path.display());
                return false;
            }
        };

        if let Err(e) = file.write_all(identity.as_bytes()) {
            warn!("Claim {} taken but identity not written: {e}", key.file_name());
        }

        info!("🔒 Claimed {} as {}", key.file_name(), identity);
        true
    }

    fn sweep(&self, max_age: Duration) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) => {
                debug!("Skipping claim sweep: {e}");
                return 0;
            }
        };

        let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if modified < cutoff && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!("🧹 Swept {} expired claim(s)", removed);
        }
        removed
    }
}

/// Random delay to wait before claiming, so competing processes don't all
/// race at the same instant.
pub fn claim_jitter(range: &RangeInclusive<Duration>) -> Duration {
    if range.start() >= range.end() {
        return *range.start();
    }
    rand::rng().random_range(*range.start()..=*range.end())
}
