//! File-backed broadcast bus between bot instances.
//!
//! Telegram bots never receive messages sent by other bots, so sibling
//! processes publish their outgoing text here. Each chat gets one append-only
//! JSONL file; readers keep their own byte cursor into it.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// How many tail bytes `last_message_time` inspects.
const TAIL_BYTES: u64 = 4096;

/// A log is only trimmed once it is this many times over its limit.
pub const TRIM_SLACK: usize = 2;

/// One line of a chat's bus file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusRecord {
    /// Username of the bot that emitted the text.
    #[serde(rename = "bot")]
    pub emitter: String,
    pub text: String,
    /// Epoch seconds.
    #[serde(rename = "ts")]
    pub timestamp: f64,
    /// Set when the text was itself a reply to a bus message, so readers don't
    /// start a new chain from it.
    #[serde(rename = "via_bus", default, skip_serializing_if = "is_false")]
    pub originated_from_bus: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl BusRecord {
    pub fn new(emitter: &str, text: &str, originated_from_bus: bool) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        Self {
            emitter: emitter.to_string(),
            text: text.to_string(),
            timestamp,
            originated_from_bus,
        }
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        epoch_to_utc(self.timestamp)
    }
}

/// Convert fractional epoch seconds to a UTC timestamp.
pub fn epoch_to_utc(ts: f64) -> Option<DateTime<Utc>> {
    if !ts.is_finite() {
        return None;
    }
    let secs = ts.floor();
    let nanos = ((ts - secs) * 1e9) as u32;
    DateTime::from_timestamp(secs as i64, nanos)
}

/// Read position of one reader in one chat's log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct BusCursor(pub u64);

impl BusCursor {
    pub const START: BusCursor = BusCursor(0);
}

/// Append-only per-chat broadcast log.
pub trait Bus: Send + Sync {
    /// Append one record to the chat's log.
    fn broadcast(&self, chat_id: i64, emitter: &str, text: &str, via_bus: bool) -> std::io::Result<()>;

    /// Records after `cursor` whose emitter is not `reader`, in append order,
    /// plus the cursor to pass next time.
    fn poll(&self, chat_id: i64, reader: &str, cursor: BusCursor) -> (Vec<BusRecord>, BusCursor);

    /// Timestamp of the newest well-formed record, if any.
    fn last_message_time(&self, chat_id: i64) -> Option<f64>;

    /// Cut the log back to its newest `max_lines` records once it holds more
    /// than `TRIM_SLACK * max_lines`.
    ///
    /// A reader whose cursor ends up past the shortened log jumps to its new
    /// end, so a record appended between the rewrite and that reader's next
    /// poll is never seen by it. The slack keeps such rewrites rare.
    fn trim(&self, chat_id: i64, max_lines: usize) -> std::io::Result<()>;
}

/// Bus backed by `{dir}/{chat_id}.jsonl` files.
pub struct FileBus {
    dir: PathBuf,
}

impl FileBus {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the bus directory if it doesn't exist.
    pub fn init(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    pub fn path(&self, chat_id: i64) -> PathBuf {
        self.dir.join(format!("{chat_id}.jsonl"))
    }

    fn read_from(&self, chat_id: i64, cursor: BusCursor) -> std::io::Result<Option<(Vec<u8>, u64)>> {
        let mut file = match File::open(self.path(chat_id)) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        // Snapshot the length: anything appended after this point belongs to
        // the next poll.
        let len = file.metadata()?.len();
        if cursor.0 > len {
            return Ok(Some((Vec::new(), len)));
        }

        file.seek(SeekFrom::Start(cursor.0))?;
        let mut buf = Vec::with_capacity((len - cursor.0) as usize);
        Read::by_ref(&mut file).take(len - cursor.0).read_to_end(&mut buf)?;
        Ok(Some((buf, len)))
    }
}

impl Bus for FileBus {
    fn broadcast(&self, chat_id: i64, emitter: &str, text: &str, via_bus: bool) -> std::io::Result<()> {
        let record = BusRecord::new(emitter, text, via_bus);
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(chat_id))?;

        // One write per record; O_APPEND keeps concurrent writers from interleaving.
        file.write_all(line.as_bytes())?;
        file.flush()?;

        debug!("📡 Broadcast to bus {} ({} chars)", chat_id, text.len());
        Ok(())
    }

    fn poll(&self, chat_id: i64, reader: &str, cursor: BusCursor) -> (Vec<BusRecord>, BusCursor) {
        let (buf, len) = match self.read_from(chat_id, cursor) {
            Ok(Some(read)) => read,
            Ok(None) => return (Vec::new(), cursor),
            Err(e) => {
                warn!("Failed to read bus {}: {e}", chat_id);
                return (Vec::new(), cursor);
            }
        };

        if cursor.0 > len {
            debug!("Bus {} shrank below cursor, skipping to end", chat_id);
            return (Vec::new(), BusCursor(len));
        }

        // Only consume complete lines; a half-written tail is picked up later.
        let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
            return (Vec::new(), cursor);
        };

        let mut records = Vec::new();
        for line in buf[..last_newline].split(|&b| b == b'\n') {
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<BusRecord>(line) {
                Ok(record) if record.emitter.eq_ignore_ascii_case(reader) => {}
                Ok(record) => records.push(record),
                Err(e) => debug!("Skipping malformed bus line in {}: {e}", chat_id),
            }
        }

        (records, BusCursor(cursor.0 + last_newline as u64 + 1))
    }

    fn last_message_time(&self, chat_id: i64) -> Option<f64> {
        let mut file = File::open(self.path(chat_id)).ok()?;
        let len = file.metadata().ok()?.len();
        if len == 0 {
            return None;
        }

        file.seek(SeekFrom::Start(len.saturating_sub(TAIL_BYTES))).ok()?;
        let mut tail = Vec::new();
        file.read_to_end(&mut tail).ok()?;
        let tail = String::from_utf8_lossy(&tail);

        tail.lines()
            .rev()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .find_map(|line| serde_json::from_str::<BusRecord>(line).ok())
            .map(|record| record.timestamp)
    }

    fn trim(&self, chat_id: i64, max_lines: usize) -> std::io::Result<()> {
        let path = self.path(chat_id);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        let lines: Vec<&str> = content.lines().collect();
        if lines.len() <= max_lines.saturating_mul(TRIM_SLACK) {
            return Ok(());
        }

        let mut kept = lines[lines.len() - max_lines..].join("\n");
        if !kept.is_empty() {
            kept.push('\n');
        }
        fs::write(&path, kept)?;

        debug!("✂️ Trimmed bus {} to {} lines", chat_id, max_lines);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> (tempfile::TempDir, FileBus) {
        let dir = tempfile::tempdir().unwrap();
        let bus = FileBus::new(dir.path().join("bus"));
        (dir, bus)
    }

    fn lines(bus: &FileBus, chat_id: i64) -> Vec<String> {
        fs::read_to_string(bus.path(chat_id))
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_init_creates_dir() {
        let (_dir, bus) = bus();
        assert!(!bus.dir().exists());
        bus.init().unwrap();
        bus.init().unwrap();
        assert!(bus.dir().is_dir());
    }

    #[test]
    fn test_broadcast_writes_jsonl() {
        let (_dir, bus) = bus();
        bus.broadcast(100, "bot_a", "hello", false).unwrap();

        let lines = lines(&bus, 100);
        assert_eq!(lines.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(value["bot"], "bot_a");
        assert_eq!(value["text"], "hello");
        assert!(value["ts"].as_f64().unwrap() > 0.0);
        assert!(value.get("via_bus").is_none());
    }

    #[test]
    fn test_broadcast_via_bus_flag() {
        let (_dir, bus) = bus();
        bus.broadcast(100, "bot_a", "hi", true).unwrap();

        let value: serde_json::Value = serde_json::from_str(&lines(&bus, 100)[0]).unwrap();
        assert_eq!(value["via_bus"], true);
    }

    #[test]
    fn test_poll_missing_file() {
        let (_dir, bus) = bus();
        let (records, cursor) = bus.poll(999, "bot_a", BusCursor::START);
        assert!(records.is_empty());
        assert_eq!(cursor, BusCursor::START);
    }

    #[test]
    fn test_poll_skips_own_records() {
        let (_dir, bus) = bus();
        bus.broadcast(100, "bot_a", "from a", false).unwrap();

        let (records, _) = bus.poll(100, "bot_a", BusCursor::START);
        assert!(records.is_empty());

        let (records, cursor) = bus.poll(100, "bot_b", BusCursor::START);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].emitter, "bot_a");
        assert_eq!(records[0].text, "from a");
        assert!(cursor > BusCursor::START);
    }

    #[test]
    fn test_poll_cursor_never_rereads() {
        let (_dir, bus) = bus();
        bus.broadcast(100, "bot_b", "msg1", false).unwrap();
        let (first, cursor) = bus.poll(100, "bot_a", BusCursor::START);
        assert_eq!(first.len(), 1);

        let (again, same) = bus.poll(100, "bot_a", cursor);
        assert!(again.is_empty());
        assert_eq!(same, cursor);

        bus.broadcast(100, "bot_b", "msg2", false).unwrap();
        bus.broadcast(100, "bot_c", "msg3", false).unwrap();
        let (second, next) = bus.poll(100, "bot_a", cursor);
        let texts: Vec<_> = second.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["msg2", "msg3"]);
        assert!(next > cursor);
    }

    #[test]
    fn test_poll_skips_malformed_lines() {
        let (_dir, bus) = bus();
        bus.init().unwrap();
        let ok = serde_json::json!({"bot": "bot_b", "text": "ok", "ts": 1});
        fs::write(bus.path(100), format!("not json\n{{\"bot\": 5}}\n{ok}\n")).unwrap();

        let (records, _) = bus.poll(100, "bot_a", BusCursor::START);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "ok");
        assert!(!records[0].originated_from_bus);
    }

    #[test]
    fn test_poll_leaves_partial_line_for_later() {
        let (_dir, bus) = bus();
        bus.broadcast(100, "bot_b", "complete", false).unwrap();

        let partial = r#"{"bot": "bot_b", "text": "half"#;
        let mut file = OpenOptions::new().append(true).open(bus.path(100)).unwrap();
        file.write_all(partial.as_bytes()).unwrap();

        let (records, cursor) = bus.poll(100, "bot_a", BusCursor::START);
        assert_eq!(records.len(), 1);

        file.write_all(b"\", \"ts\": 2}\n").unwrap();
        let (records, _) = bus.poll(100, "bot_a", cursor);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "half");
    }

    #[test]
    fn test_poll_after_shrink_jumps_to_end() {
        let (_dir, bus) = bus();
        for i in 0..5 {
            bus.broadcast(100, "bot_b", &format!("msg{i}"), false).unwrap();
        }
        let (_, cursor) = bus.poll(100, "bot_a", BusCursor::START);

        bus.trim(100, 1).unwrap();
        let (records, reset) = bus.poll(100, "bot_a", cursor);
        assert!(records.is_empty());
        assert!(reset < cursor);

        bus.broadcast(100, "bot_b", "fresh", false).unwrap();
        let (records, _) = bus.poll(100, "bot_a", reset);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "fresh");
    }

    #[test]
    fn test_last_message_time() {
        let (_dir, bus) = bus();
        assert_eq!(bus.last_message_time(100), None);

        bus.init().unwrap();
        let first = serde_json::json!({"bot": "a", "text": "x", "ts": 10.5});
        let second = serde_json::json!({"bot": "b", "text": "y", "ts": 20.25});
        fs::write(bus.path(100), format!("{first}\n{second}\ngarbage\n\n")).unwrap();

        assert_eq!(bus.last_message_time(100), Some(20.25));
    }

    #[test]
    fn test_last_message_time_reads_only_tail() {
        let (_dir, bus) = bus();
        for i in 0..200 {
            bus.broadcast(100, "bot_a", &format!("{i} {}", "x".repeat(100)), false).unwrap();
        }
        let file_len = fs::metadata(bus.path(100)).unwrap().len();
        assert!(file_len > TAIL_BYTES);

        let ts = bus.last_message_time(100).unwrap();
        assert!(ts > 0.0);
    }

    #[test]
    fn test_trim_keeps_tail() {
        let (_dir, bus) = bus();
        for i in 0..10 {
            bus.broadcast(100, "bot_a", &format!("msg{i}"), false).unwrap();
        }

        bus.trim(100, 3).unwrap();
        let (records, _) = bus.poll(100, "bot_b", BusCursor::START);
        let texts: Vec<_> = records.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["msg7", "msg8", "msg9"]);
    }

    #[test]
    fn test_trim_waits_for_slack() {
        let (_dir, bus) = bus();
        for i in 0..6 {
            bus.broadcast(100, "bot_a", &format!("msg{i}"), false).unwrap();
        }
        bus.trim(100, 3).unwrap();
        assert_eq!(lines(&bus, 100).len(), 6);

        bus.broadcast(100, "bot_a", "msg6", false).unwrap();
        bus.trim(100, 3).unwrap();
        assert_eq!(lines(&bus, 100).len(), 3);
    }

    #[test]
    fn test_trim_noop_when_small_or_missing() {
        let (_dir, bus) = bus();
        bus.trim(999, 5).unwrap();

        bus.broadcast(100, "bot_a", "msg1", false).unwrap();
        bus.broadcast(100, "bot_a", "msg2", false).unwrap();
        bus.trim(100, 5).unwrap();
        assert_eq!(lines(&bus, 100).len(), 2);
    }

    #[test]
    fn test_epoch_to_utc() {
        let dt = epoch_to_utc(1_700_000_000.5).unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert_eq!(dt.timestamp_subsec_millis(), 500);
        assert!(epoch_to_utc(f64::NAN).is_none());
    }
}
