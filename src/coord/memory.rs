//! In-memory claim store and bus for tests and single-process runs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::bus::{Bus, BusCursor, BusRecord, TRIM_SLACK};
use super::claim::{ClaimKey, ClaimStore};

/// Claim store holding claims in a map.
#[derive(Default)]
pub struct MemoryClaimStore {
    claims: Mutex<HashMap<ClaimKey, (String, Instant)>>,
}

impl MemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity that owns `key`, if claimed.
    pub fn owner(&self, key: &ClaimKey) -> Option<String> {
        let claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        claims.get(key).map(|(owner, _)| owner.clone())
    }
}

impl ClaimStore for MemoryClaimStore {
    fn try_claim(&self, key: &ClaimKey, identity: &str) -> bool {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        if claims.contains_key(key) {
            return false;
        }
        claims.insert(key.clone(), (identity.to_string(), Instant::now()));
        true
    }

    fn sweep(&self, max_age: Duration) -> usize {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        let before = claims.len();
        claims.retain(|_, (_, at)| at.elapsed() <= max_age);
        before - claims.len()
    }
}

/// Bus holding each chat's records in a vector; cursors are record indices.
#[derive(Default)]
pub struct MemoryBus {
    logs: Mutex<HashMap<i64, Vec<BusRecord>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records of a chat, own ones included.
    pub fn records(&self, chat_id: i64) -> Vec<BusRecord> {
        let logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        logs.get(&chat_id).cloned().unwrap_or_default()
    }
}

impl Bus for MemoryBus {
    fn broadcast(&self, chat_id: i64, emitter: &str, text: &str, via_bus: bool) -> std::io::Result<()> {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        logs.entry(chat_id)
            .or_default()
            .push(BusRecord::new(emitter, text, via_bus));
        Ok(())
    }

    fn poll(&self, chat_id: i64, reader: &str, cursor: BusCursor) -> (Vec<BusRecord>, BusCursor) {
        let logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(log) = logs.get(&chat_id) else {
            return (Vec::new(), cursor);
        };

        let start = (cursor.0 as usize).min(log.len());
        let records = log[start..]
            .iter()
            .filter(|r| !r.emitter.eq_ignore_ascii_case(reader))
            .cloned()
            .collect();
        (records, BusCursor(log.len() as u64))
    }

    fn last_message_time(&self, chat_id: i64) -> Option<f64> {
        let logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        logs.get(&chat_id)?.last().map(|r| r.timestamp)
    }

    fn trim(&self, chat_id: i64, max_lines: usize) -> std::io::Result<()> {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(log) = logs.get_mut(&chat_id)
            && log.len() > max_lines.saturating_mul(TRIM_SLACK)
        {
            let excess = log.len() - max_lines;
            log.drain(..excess);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_claims_exclusive() {
        let store = MemoryClaimStore::new();
        let key = ClaimKey::for_event(1, 1);
        assert!(store.try_claim(&key, "bot_a"));
        assert!(!store.try_claim(&key, "bot_b"));
        assert_eq!(store.owner(&key).as_deref(), Some("bot_a"));
    }

    #[test]
    fn test_memory_claims_sweep() {
        let store = MemoryClaimStore::new();
        store.try_claim(&ClaimKey::for_event(1, 1), "bot_a");
        assert_eq!(store.sweep(Duration::from_secs(60)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.sweep(Duration::ZERO), 1);
    }

    #[test]
    fn test_memory_bus_filters_and_advances() {
        let bus = MemoryBus::new();
        bus.broadcast(1, "bot_a", "one", false).unwrap();
        bus.broadcast(1, "bot_b", "two", true).unwrap();

        let (records, cursor) = bus.poll(1, "bot_a", BusCursor::START);
        assert_eq!(records.len(), 1);
        assert!(records[0].originated_from_bus);

        let (records, _) = bus.poll(1, "bot_c", cursor);
        assert!(records.is_empty());
    }

    #[test]
    fn test_memory_bus_trim() {
        let bus = MemoryBus::new();
        for i in 0..5 {
            bus.broadcast(1, "bot_a", &i.to_string(), false).unwrap();
        }
        bus.trim(1, 2).unwrap();
        let texts: Vec<_> = bus.records(1).into_iter().map(|r| r.text).collect();
        assert_eq!(texts, vec!["3", "4"]);
    }
}
