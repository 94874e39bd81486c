//! The orchestrator: turns inbound chat events, sibling bus records and the
//! clock into replies.
//!
//! Per event: observe → claim → decide → generate → commit history → send →
//! broadcast. Locks are never held across a backend or Telegram call.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, ReplyRequest};
use crate::coord::bus::{Bus, BusCursor, BusRecord, epoch_to_utc};
use crate::coord::claim::{ClaimKey, ClaimStore, claim_jitter};
use crate::coord::engagement::{
    ChatEngagementState, EngagementPolicy, EngagementRegistry, Inbound, MentionDetector,
};
use crate::coord::extract::{self, MediaKind};
use crate::coord::history::{HistoryEntry, HistoryStore};
use crate::coord::nudge::{ActiveHours, MorningPrompt, NudgeGate, NudgeSkip, PromptRotation};
use crate::telegram::Outbound;

/// Time-based nudge settings.
#[derive(Debug, Clone)]
pub struct NudgeSettings {
    pub check_interval: Duration,
    pub active_hours: ActiveHours,
    pub enabled_chats: HashSet<i64>,
    pub inactivity: TimeDelta,
    pub startup_grace: TimeDelta,
    pub prompts: Vec<String>,
    pub prompt_history: usize,
    pub morning: Option<MorningPrompt>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Lowercase bot username; claim owner and bus emitter name.
    pub identity: String,
    pub mentions: MentionDetector,
    pub voice_keywords: Vec<String>,
    /// Hint for unmentioned replies. Empty = none.
    pub chat_react_prompt: String,
    pub claim_jitter: RangeInclusive<Duration>,
    pub claim_max_age: Duration,
    pub bus_poll_interval: Duration,
    pub bus_max_lines: usize,
    pub persist_interval: Duration,
    pub max_history: usize,
    /// `None` keeps history in memory only.
    pub history_dir: Option<PathBuf>,
    pub policy: EngagementPolicy,
    pub nudge: NudgeSettings,
}

/// A user message from the chat platform.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub chat_id: i64,
    /// Platform message id, identical for every bot in the chat.
    pub message_id: Option<i64>,
    pub sender: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// What handling one event led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Replied,
    /// Decided not to answer.
    Skipped,
    /// Another process owns the event.
    ClaimDenied,
    /// Addressed to a sibling bot.
    PeerAddressed,
    BackendFailed,
    /// Backend produced nothing sendable.
    NothingToSay,
    Reset,
}

/// What started a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// A chat member's message or command. Failures are reported in the chat.
    User,
    /// The nudge timer. Failures are only logged.
    Timer,
    /// A sibling's bus record. Failures are only logged; the answer is marked `via_bus`.
    Bus,
}

/// One backend round-trip and where its answer goes.
struct ReplyJob {
    chat_id: i64,
    /// Committed together with the answer.
    user_turn: Option<HistoryEntry>,
    hint: Option<String>,
    tool_choice: Option<String>,
    reply_to: Option<i64>,
    /// Time of the event being answered; stamped as our reply time.
    at: DateTime<Utc>,
    trigger: Trigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandTarget {
    /// `/cmd` with no bot suffix.
    Everyone,
    /// `/cmd@us`.
    Us,
    /// `/cmd@somebody_else`.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Command {
    name: String,
    target: CommandTarget,
}

fn parse_command(text: &str, identity: &str) -> Option<Command> {
    let first = text.split_whitespace().next()?;
    if !first.starts_with('/') {
        return None;
    }
    let lower = first.to_lowercase();
    let (name, target) = match lower.split_once('@') {
        Some((name, bot)) if bot == identity => (name.to_string(), CommandTarget::Us),
        Some((name, _)) => (name.to_string(), CommandTarget::Other),
        None => (lower, CommandTarget::Everyone),
    };
    Some(Command { name, target })
}

pub struct Engine {
    settings: EngineSettings,
    claims: Arc<dyn ClaimStore>,
    bus: Arc<dyn Bus>,
    backend: Arc<dyn Backend>,
    outbound: Arc<dyn Outbound>,
    gate: NudgeGate,
    history: Mutex<HistoryStore>,
    engagement: Mutex<EngagementRegistry>,
    rotation: Mutex<PromptRotation>,
    cursors: Mutex<HashMap<i64, BusCursor>>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        claims: Arc<dyn ClaimStore>,
        bus: Arc<dyn Bus>,
        backend: Arc<dyn Backend>,
        outbound: Arc<dyn Outbound>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let history = match &settings.history_dir {
            Some(dir) => HistoryStore::with_dir(settings.max_history, dir),
            None => HistoryStore::new(settings.max_history),
        };
        let engagement = EngagementRegistry::new(settings.policy.clone(), started_at)
            .with_voice_keywords(settings.voice_keywords.clone());

        let nudge = &settings.nudge;
        let mut rotation = PromptRotation::new(nudge.prompts.clone(), nudge.prompt_history);
        if let Some(morning) = nudge.morning.clone() {
            rotation = rotation.with_morning(morning);
        }
        let gate = NudgeGate {
            active_hours: nudge.active_hours,
            enabled_chats: nudge.enabled_chats.clone(),
            inactivity: nudge.inactivity,
            startup_grace: nudge.startup_grace,
            started_at,
        };

        Self {
            settings,
            claims,
            bus,
            backend,
            outbound,
            gate,
            history: Mutex::new(history),
            engagement: Mutex::new(engagement),
            rotation: Mutex::new(rotation),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Load saved histories. Returns the number of chats restored.
    pub async fn restore(&self) -> usize {
        self.history.lock().await.restore()
    }

    /// Save all histories; failures are logged.
    pub async fn flush(&self) {
        self.history.lock().await.persist();
    }

    /// Snapshot of a chat's history window.
    pub async fn history(&self, chat_id: i64) -> Vec<HistoryEntry> {
        let history = self.history.lock().await;
        history.get(chat_id).map(<[HistoryEntry]>::to_vec).unwrap_or_default()
    }

    pub async fn engagement_state(&self, chat_id: i64) -> Option<ChatEngagementState> {
        self.engagement.lock().await.state(chat_id).cloned()
    }

    /// Chats with any local state.
    async fn known_chats(&self) -> BTreeSet<i64> {
        let mut chats: BTreeSet<i64> = self.engagement.lock().await.chat_ids().collect();
        chats.extend(self.history.lock().await.chat_ids());
        chats
    }

    /// Handle one user message.
    pub async fn handle_message(&self, event: InboundEvent) -> Outcome {
        let text = event.text.trim();
        if text.is_empty() {
            return Outcome::Skipped;
        }
        let chat_id = event.chat_id;

        let stale = self.engagement.lock().await.observe(chat_id, event.timestamp);
        if stale {
            info!("🕰️ Chat {} was quiet, starting fresh history", chat_id);
            self.history.lock().await.clear(chat_id);
        }

        if let Some(command) = parse_command(text, &self.settings.identity)
            && let Some(outcome) = self.handle_command(&command, &event).await
        {
            return outcome;
        }

        if self.settings.mentions.addressed_to_peer_only(text) {
            debug!("Chat {}: message for a sibling bot, not claiming", chat_id);
            return Outcome::PeerAddressed;
        }

        if !self.claim_event(&event).await {
            return Outcome::ClaimDenied;
        }

        let is_mention = self.settings.mentions.is_mention(text);
        let inbound = Inbound {
            chat_id,
            sender: &event.sender,
            text,
            is_mention,
            timestamp: event.timestamp,
        };
        let roll: f64 = rand::rng().random();
        let decision = self.engagement.lock().await.decide(&inbound, roll);
        if !decision.respond() {
            debug!("Chat {}: staying quiet ({:?})", chat_id, decision.verdict);
            return Outcome::Skipped;
        }

        let prompt = if is_mention {
            self.settings.mentions.strip_tag(text)
        } else {
            text.to_string()
        };
        let user_turn = HistoryEntry::user(format!("{}: {}", event.sender, prompt));
        let hint = (decision.is_passive() && !self.settings.chat_react_prompt.is_empty())
            .then(|| self.settings.chat_react_prompt.clone());
        let tool_choice = decision.tool_hint.map(|h| h.tool_name().to_string());

        self.reply(ReplyJob {
            chat_id,
            user_turn: Some(user_turn),
            hint,
            tool_choice,
            reply_to: event.message_id,
            at: event.timestamp,
            trigger: Trigger::User,
        })
        .await
    }

    /// Returns `None` for commands that should be treated as plain text.
    async fn handle_command(&self, command: &Command, event: &InboundEvent) -> Option<Outcome> {
        if command.name != "/nudge" && command.name != "/reset" {
            return None;
        }
        if command.target == CommandTarget::Other {
            return Some(Outcome::PeerAddressed);
        }

        let chat_id = event.chat_id;
        match command.name.as_str() {
            "/nudge" => {
                // Without @bot every bot sees it; only one may answer.
                if command.target == CommandTarget::Everyone && !self.claim_event(event).await {
                    return Some(Outcome::ClaimDenied);
                }
                info!("👉 Manual nudge in chat {} by {}", chat_id, event.sender);
                Some(
                    self.nudge_chat(chat_id, event.message_id, event.timestamp, Trigger::User)
                        .await,
                )
            }
            _ => {
                // Every bot drops its own window; one of them confirms.
                self.history.lock().await.clear(chat_id);
                if command.target == CommandTarget::Us || self.claim_event(event).await {
                    if let Err(e) = self
                        .outbound
                        .send_text(chat_id, "🧹 History cleared", event.message_id)
                        .await
                    {
                        warn!("Failed to confirm reset in chat {}: {}", chat_id, e);
                    }
                }
                Some(Outcome::Reset)
            }
        }
    }

    async fn claim_event(&self, event: &InboundEvent) -> bool {
        let key = match event.message_id {
            Some(id) => ClaimKey::for_event(event.chat_id, id),
            None => ClaimKey::for_content(event.chat_id, &event.sender, &event.text),
        };
        self.claim(&key, event.message_id).await
    }

    /// Wait a random jitter, then try to take `key`. Marks the message on success.
    async fn claim(&self, key: &ClaimKey, message_id: Option<i64>) -> bool {
        let delay = claim_jitter(&self.settings.claim_jitter);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if !self.claims.try_claim(key, &self.settings.identity) {
            debug!("Lost claim {}", key.file_name());
            return false;
        }

        if let Some(message_id) = message_id
            && let Err(e) = self.outbound.mark_claimed(key.chat_id(), message_id).await
        {
            debug!("Claim marker failed: {}", e);
        }
        true
    }

    /// Ask the backend, then commit history, send and broadcast.
    /// History is only touched when the backend succeeded.
    async fn reply(&self, job: ReplyJob) -> Outcome {
        let ReplyJob {
            chat_id,
            user_turn,
            hint,
            tool_choice,
            reply_to,
            at,
            trigger,
        } = job;

        let mut window = self.history(chat_id).await;
        window.extend(user_turn.iter().cloned());

        let request = ReplyRequest {
            chat_id,
            history: window,
            hint,
            tool_choice,
        };

        let raw = match self.backend.generate_reply(request).await {
            Ok(raw) => raw,
            Err(e) => {
                error!("Backend failed for chat {} ({:?}): {}", chat_id, trigger, e);
                if trigger == Trigger::User {
                    let notice = format!("⚠️ Backend error: {e}");
                    if let Err(e) = self.outbound.send_text(chat_id, &notice, reply_to).await {
                        warn!("Failed to report backend error in chat {}: {}", chat_id, e);
                    }
                }
                return Outcome::BackendFailed;
            }
        };

        let answer = extract::clean_reply(&raw);
        if answer.is_empty() {
            warn!("Empty reply for chat {}", chat_id);
            return Outcome::NothingToSay;
        }

        {
            let mut history = self.history.lock().await;
            if let Some(turn) = user_turn {
                history.append(chat_id, turn);
            }
            history.append(chat_id, HistoryEntry::assistant(answer.clone()));
        }
        self.engagement.lock().await.mark_replied(chat_id, at);

        let spoken = self.deliver(chat_id, &answer, reply_to).await;
        let via_bus = trigger == Trigger::Bus;
        if let Err(e) = self
            .bus
            .broadcast(chat_id, &self.settings.identity, &spoken, via_bus)
        {
            warn!("Failed to broadcast to bus {}: {}", chat_id, e);
        }

        info!("💬 Replied in chat {}", chat_id);
        Outcome::Replied
    }

    /// Send the answer, as media if it carries a media reference.
    /// Returns the text siblings should see on the bus.
    async fn deliver(&self, chat_id: i64, answer: &str, reply_to: Option<i64>) -> String {
        let Some(media) = extract::extract_media(answer) else {
            if let Err(e) = self.outbound.send_text(chat_id, answer, reply_to).await {
                error!("Failed to send reply to chat {}: {}", chat_id, e);
            }
            return answer.to_string();
        };

        let label = match media.kind {
            MediaKind::Image => "[image]",
            MediaKind::Voice => "[voice]",
        };

        if let Err(e) = self.outbound.send_media(chat_id, &media, reply_to).await {
            error!("Failed to send {} to chat {}: {}", label, chat_id, e);
            if !media.caption.is_empty()
                && let Err(e) = self.outbound.send_text(chat_id, &media.caption, reply_to).await
            {
                error!("Failed to send caption to chat {}: {}", chat_id, e);
            }
        }

        format!("{} {}", label, media.caption).trim().to_string()
    }

    /// Clear the chat's window and post a nudge prompt's answer.
    async fn nudge_chat(
        &self,
        chat_id: i64,
        reply_to: Option<i64>,
        at: DateTime<Utc>,
        trigger: Trigger,
    ) -> Outcome {
        let local = self.gate.active_hours.local_time(at);
        let prompt = {
            let mut rotation = self.rotation.lock().await;
            rotation.select(local, &mut rand::rng())
        };
        let Some(prompt) = prompt else {
            warn!("No nudge prompts configured");
            return Outcome::NothingToSay;
        };

        self.history.lock().await.clear(chat_id);
        info!("👋 Nudging chat {}", chat_id);
        self.reply(ReplyJob {
            chat_id,
            user_turn: None,
            hint: Some(prompt),
            tool_choice: None,
            reply_to,
            at,
            trigger,
        })
        .await
    }

    /// Latest activity from local observation and the bus.
    async fn last_activity(&self, chat_id: i64) -> Option<DateTime<Utc>> {
        let local = self
            .engagement
            .lock()
            .await
            .state(chat_id)
            .and_then(|s| s.last_activity_at);
        let shared = self.bus.last_message_time(chat_id).and_then(epoch_to_utc);
        local.max(shared)
    }

    /// One pass of the nudge loop. Returns the chats that were nudged.
    pub async fn nudge_tick(&self, now: DateTime<Utc>) -> Vec<i64> {
        if self.engagement.lock().await.maybe_reset_counters(now) {
            debug!("Reset unmentioned reply counters");
        }

        let mut chats = self.known_chats().await;
        chats.extend(self.gate.enabled_chats.iter().copied());

        let mut due = Vec::new();
        for chat_id in chats {
            let last = self.last_activity(chat_id).await;
            match self.gate.check(chat_id, last, now) {
                Ok(()) => due.push((chat_id, last)),
                Err(NudgeSkip::OutsideActiveHours) => {
                    debug!("Outside active hours, no nudges");
                    return Vec::new();
                }
                Err(reason) => debug!("Chat {}: no nudge ({:?})", chat_id, reason),
            }
        }

        let results = join_all(due.into_iter().map(|(chat_id, last)| async move {
            // Siblings see the same quiet period; one nudge per period.
            let since = last.map(|t| t.timestamp()).unwrap_or_default();
            let key = ClaimKey::for_content(chat_id, "nudge", &since.to_string());
            let nudged = self.claim(&key, None).await
                && self.nudge_chat(chat_id, None, now, Trigger::Timer).await == Outcome::Replied;
            nudged.then_some(chat_id)
        }))
        .await;
        results.into_iter().flatten().collect()
    }

    /// One pass of the bus watcher. Chats are polled concurrently; records
    /// within a chat are handled in order.
    pub async fn bus_tick(&self) {
        let chats = self.known_chats().await;
        join_all(chats.into_iter().map(|chat_id| self.poll_bus(chat_id))).await;
    }

    async fn poll_bus(&self, chat_id: i64) {
        let identity = &self.settings.identity;
        let cursor = self.cursors.lock().await.get(&chat_id).copied();

        let records = match cursor {
            Some(cursor) => {
                let (records, next) = self.bus.poll(chat_id, identity, cursor);
                self.cursors.lock().await.insert(chat_id, next);
                records
            }
            None => {
                // First look at this chat: old traffic is not ours to answer.
                let (backlog, end) = self.bus.poll(chat_id, identity, BusCursor::START);
                debug!("Bus {}: skipping {} old record(s)", chat_id, backlog.len());
                self.cursors.lock().await.insert(chat_id, end);
                return;
            }
        };

        for record in records {
            self.on_bus_record(chat_id, record).await;
        }
    }

    async fn on_bus_record(&self, chat_id: i64, record: BusRecord) {
        let at = record.time().unwrap_or_else(Utc::now);
        self.history
            .lock()
            .await
            .inject_external(chat_id, &record.emitter, &record.text);
        self.engagement.lock().await.touch(chat_id, at);

        if record.originated_from_bus || !self.settings.mentions.is_mention(&record.text) {
            return;
        }

        let key = ClaimKey::for_content(chat_id, &record.emitter, &record.text);
        if !self.claim(&key, None).await {
            return;
        }

        info!("📡 @{} addressed us in chat {}", record.emitter, chat_id);
        self.reply(ReplyJob {
            chat_id,
            user_turn: None,
            hint: None,
            tool_choice: None,
            reply_to: None,
            at,
            trigger: Trigger::Bus,
        })
        .await;
    }

    /// Save histories, sweep old claims and trim bus files.
    pub async fn persist_tick(&self) {
        self.flush().await;

        let swept = self.claims.sweep(self.settings.claim_max_age);
        if swept > 0 {
            debug!("Swept {} claim(s)", swept);
        }

        for chat_id in self.known_chats().await {
            if let Err(e) = self.bus.trim(chat_id, self.settings.bus_max_lines) {
                warn!("Failed to trim bus {}: {}", chat_id, e);
            }
        }
    }

    pub async fn run_nudge_loop(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            "⏰ Nudge loop started (every {:?}, chats {:?})",
            self.settings.nudge.check_interval, self.settings.nudge.enabled_chats
        );
        let mut interval = tokio::time::interval(self.settings.nudge.check_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let nudged = self.nudge_tick(Utc::now()).await;
                    if !nudged.is_empty() {
                        info!("Nudged {:?}", nudged);
                    }
                }
            }
        }
        self.flush().await;
        info!("Nudge loop stopped");
    }

    pub async fn run_bus_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.bus_poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.bus_tick().await,
            }
        }
        info!("Bus watcher stopped");
    }

    pub async fn run_persist_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.persist_interval);
        // The first tick fires immediately; nothing to save yet.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.persist_tick().await,
            }
        }
        self.flush().await;
        info!("Persistence loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::coord::extract::{MediaReply, MediaSource};
    use crate::coord::history::Role;
    use crate::coord::memory::{MemoryBus, MemoryClaimStore};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedBackend {
        replies: StdMutex<VecDeque<Result<String, String>>>,
        requests: StdMutex<Vec<ReplyRequest>>,
    }

    impl ScriptedBackend {
        fn push(&self, reply: Result<&str, &str>) {
            let reply = reply.map(str::to_string).map_err(str::to_string);
            self.replies.lock().unwrap().push_back(reply);
        }

        fn requests(&self) -> Vec<ReplyRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        async fn generate_reply(&self, request: ReplyRequest) -> Result<String, BackendError> {
            self.requests.lock().unwrap().push(request);
            match self.replies.lock().unwrap().pop_front() {
                Some(Ok(text)) => Ok(text),
                Some(Err(body)) => Err(BackendError::Api { status: 500, body }),
                None => Ok("ok".to_string()),
            }
        }
    }

    /// Answers after a delay, tracking how many calls overlap.
    #[derive(Default)]
    struct SlowBackend {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Backend for SlowBackend {
        async fn generate_reply(&self, _request: ReplyRequest) -> Result<String, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok("ok".to_string())
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Text(i64, String),
        Media(i64, MediaReply),
        Marked(i64, i64),
    }

    #[derive(Default)]
    struct Recorder {
        sent: StdMutex<Vec<Sent>>,
    }

    impl Recorder {
        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }

        fn texts(&self) -> Vec<String> {
            self.sent()
                .into_iter()
                .filter_map(|s| match s {
                    Sent::Text(_, t) => Some(t),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Outbound for Recorder {
        async fn send_text(&self, chat_id: i64, text: &str, _reply_to: Option<i64>) -> Result<i64, String> {
            self.sent.lock().unwrap().push(Sent::Text(chat_id, text.to_string()));
            Ok(1)
        }

        async fn send_media(&self, chat_id: i64, media: &MediaReply, _reply_to: Option<i64>) -> Result<i64, String> {
            self.sent.lock().unwrap().push(Sent::Media(chat_id, media.clone()));
            Ok(2)
        }

        async fn mark_claimed(&self, chat_id: i64, message_id: i64) -> Result<(), String> {
            self.sent.lock().unwrap().push(Sent::Marked(chat_id, message_id));
            Ok(())
        }
    }

    struct Harness {
        engine: Engine,
        backend: Arc<ScriptedBackend>,
        outbound: Arc<Recorder>,
        claims: Arc<MemoryClaimStore>,
        bus: Arc<MemoryBus>,
    }

    fn settings(probabilities: [f64; 5]) -> EngineSettings {
        EngineSettings {
            identity: "bot_a".to_string(),
            mentions: MentionDetector::new("bot_a", None, &["bot_b".to_string()]),
            voice_keywords: vec!["voice".to_string()],
            chat_react_prompt: "react".to_string(),
            claim_jitter: Duration::ZERO..=Duration::ZERO,
            claim_max_age: Duration::from_secs(300),
            bus_poll_interval: Duration::from_secs(5),
            bus_max_lines: 200,
            persist_interval: Duration::from_secs(300),
            max_history: 20,
            history_dir: None,
            policy: EngagementPolicy {
                response_probabilities: probabilities,
                ..EngagementPolicy::default()
            },
            nudge: NudgeSettings {
                check_interval: Duration::from_secs(60),
                active_hours: ActiveHours {
                    start: chrono::NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                    end: chrono::NaiveTime::from_hms_opt(21, 0, 0).unwrap(),
                    tz: chrono_tz::UTC,
                },
                enabled_chats: HashSet::from([1]),
                inactivity: TimeDelta::minutes(120),
                startup_grace: TimeDelta::minutes(5),
                prompts: vec!["say something".to_string()],
                prompt_history: 3,
                morning: None,
            },
        }
    }

    fn harness(probabilities: [f64; 5]) -> Harness {
        let backend = Arc::new(ScriptedBackend::default());
        let outbound = Arc::new(Recorder::default());
        let claims = Arc::new(MemoryClaimStore::new());
        let bus = Arc::new(MemoryBus::new());
        let engine = Engine::new(
            settings(probabilities),
            claims.clone(),
            bus.clone(),
            backend.clone(),
            outbound.clone(),
            noon() - TimeDelta::hours(2),
        );
        Harness {
            engine,
            backend,
            outbound,
            claims,
            bus,
        }
    }

    fn noon() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-07-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn event(id: i64, text: &str, at: DateTime<Utc>) -> InboundEvent {
        InboundEvent {
            chat_id: 1,
            message_id: Some(id),
            sender: "alice".to_string(),
            text: text.to_string(),
            timestamp: at,
        }
    }

    const ALWAYS: [f64; 5] = [1.0; 5];
    const NEVER: [f64; 5] = [0.0; 5];

    #[test]
    fn test_parse_command() {
        let cmd = parse_command("/nudge", "bot_a").unwrap();
        assert_eq!(cmd.name, "/nudge");
        assert_eq!(cmd.target, CommandTarget::Everyone);

        let cmd = parse_command("/Nudge@Bot_A now please", "bot_a").unwrap();
        assert_eq!(cmd.name, "/nudge");
        assert_eq!(cmd.target, CommandTarget::Us);

        let cmd = parse_command("/reset@bot_b", "bot_a").unwrap();
        assert_eq!(cmd.target, CommandTarget::Other);

        assert!(parse_command("hello /nudge", "bot_a").is_none());
    }

    #[tokio::test]
    async fn test_mention_reply_commits_history_and_broadcasts() {
        let h = harness(NEVER);
        h.backend.push(Ok("hi alice 【1:2†notes.json】"));

        let outcome = h.engine.handle_message(event(10, "@bot_a hello", noon())).await;
        assert_eq!(outcome, Outcome::Replied);

        let history = h.engine.history(1).await;
        assert_eq!(history, vec![HistoryEntry::user("alice: hello"), HistoryEntry::assistant("hi alice")]);

        assert_eq!(
            h.outbound.sent(),
            vec![Sent::Marked(1, 10), Sent::Text(1, "hi alice".to_string())]
        );
        let records = h.bus.records(1);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].emitter, "bot_a");
        assert!(!records[0].originated_from_bus);
        assert_eq!(h.claims.owner(&ClaimKey::for_event(1, 10)).as_deref(), Some("bot_a"));
    }

    #[tokio::test]
    async fn test_backend_failure_does_not_touch_history() {
        let h = harness(NEVER);
        h.backend.push(Err("boom"));

        let outcome = h.engine.handle_message(event(1, "@bot_a hello", noon())).await;
        assert_eq!(outcome, Outcome::BackendFailed);
        assert!(h.engine.history(1).await.is_empty());
        assert!(h.outbound.texts()[0].starts_with("⚠️"));
        assert!(h.bus.records(1).is_empty());
    }

    #[tokio::test]
    async fn test_passive_skip_and_reply() {
        let quiet = harness(NEVER);
        let outcome = quiet.engine.handle_message(event(1, "nice weather", noon())).await;
        assert_eq!(outcome, Outcome::Skipped);
        assert!(quiet.backend.requests().is_empty());

        let chatty = harness(ALWAYS);
        let outcome = chatty.engine.handle_message(event(1, "nice weather", noon())).await;
        assert_eq!(outcome, Outcome::Replied);
        let request = &chatty.backend.requests()[0];
        assert_eq!(request.hint.as_deref(), Some("react"));
        assert_eq!(request.history, vec![HistoryEntry::user("alice: nice weather")]);
        assert_eq!(chatty.engine.engagement_state(1).await.unwrap().unmentioned_reply_count, 1);
    }

    #[tokio::test]
    async fn test_claim_denied_when_already_taken() {
        let h = harness(ALWAYS);
        h.claims.try_claim(&ClaimKey::for_event(1, 5), "bot_b");

        let outcome = h.engine.handle_message(event(5, "@bot_a hi", noon())).await;
        assert_eq!(outcome, Outcome::ClaimDenied);
        assert!(h.outbound.sent().is_empty());
        // Still counted as activity.
        assert_eq!(h.engine.engagement_state(1).await.unwrap().last_activity_at, Some(noon()));
    }

    #[tokio::test]
    async fn test_peer_addressed_not_claimed() {
        let h = harness(ALWAYS);
        let outcome = h.engine.handle_message(event(6, "@bot_b your turn", noon())).await;
        assert_eq!(outcome, Outcome::PeerAddressed);
        assert!(h.claims.owner(&ClaimKey::for_event(1, 6)).is_none());
    }

    #[tokio::test]
    async fn test_voice_keyword_sets_tool_choice() {
        let h = harness(NEVER);
        h.engine.handle_message(event(1, "@bot_a voice: sing", noon())).await;
        assert_eq!(h.backend.requests()[0].tool_choice.as_deref(), Some("generate_voice"));
    }

    #[tokio::test]
    async fn test_stale_history_cleared_before_reply() {
        let h = harness(NEVER);
        h.engine.handle_message(event(1, "@bot_a first", noon())).await;
        assert_eq!(h.engine.history(1).await.len(), 2);

        let later = noon() + TimeDelta::minutes(45);
        h.engine.handle_message(event(2, "@bot_a again", later)).await;
        let history = h.engine.history(1).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], HistoryEntry::user("alice: again"));
    }

    #[tokio::test]
    async fn test_media_reply_sent_as_media() {
        let h = harness(NEVER);
        h.backend.push(Ok(r#"{"image_url": "https://x.org/cat.png", "caption": "a cat"}"#));

        h.engine.handle_message(event(1, "@bot_a show a cat", noon())).await;

        let media = h
            .outbound
            .sent()
            .into_iter()
            .find_map(|s| match s {
                Sent::Media(_, m) => Some(m),
                _ => None,
            })
            .unwrap();
        assert_eq!(media.source, MediaSource::Url("https://x.org/cat.png".to_string()));
        assert_eq!(h.bus.records(1)[0].text, "[image] a cat");
    }

    #[tokio::test]
    async fn test_reset_command() {
        let h = harness(NEVER);
        h.engine.handle_message(event(1, "@bot_a hi", noon())).await;
        assert!(!h.engine.history(1).await.is_empty());

        let outcome = h.engine.handle_message(event(2, "/reset", noon())).await;
        assert_eq!(outcome, Outcome::Reset);
        assert!(h.engine.history(1).await.is_empty());
        assert_eq!(h.outbound.texts().last().unwrap(), "🧹 History cleared");

        let outcome = h.engine.handle_message(event(3, "/reset@bot_b", noon())).await;
        assert_eq!(outcome, Outcome::PeerAddressed);
    }

    #[tokio::test]
    async fn test_nudge_command_bypasses_gate() {
        let h = harness(NEVER);
        let outcome = h.engine.handle_message(event(1, "/nudge@bot_a", noon())).await;
        assert_eq!(outcome, Outcome::Replied);

        let request = &h.backend.requests()[0];
        assert_eq!(request.hint.as_deref(), Some("say something"));
        assert!(request.history.is_empty());
        assert_eq!(h.engine.history(1).await, vec![HistoryEntry::assistant("ok")]);
    }

    #[tokio::test]
    async fn test_nudge_tick_after_inactivity() {
        let h = harness(NEVER);
        let quiet_since = noon() - TimeDelta::hours(3);
        h.engine.handle_message(event(1, "anyone?", quiet_since)).await;

        assert!(h.engine.nudge_tick(noon() - TimeDelta::hours(2)).await.is_empty());

        assert_eq!(h.engine.nudge_tick(noon()).await, vec![1]);
        let history = h.engine.history(1).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::Assistant);

        // Our own nudge counts as activity.
        assert!(h.engine.nudge_tick(noon()).await.is_empty());
    }

    #[tokio::test]
    async fn test_nudge_tick_respects_bus_activity() {
        let h = harness(NEVER);
        h.engine.handle_message(event(1, "anyone?", noon() - TimeDelta::hours(3))).await;
        h.bus.broadcast(1, "bot_b", "I'm here", false).unwrap();

        // The bus record carries the real clock, later than the simulated noon.
        assert!(h.engine.nudge_tick(noon()).await.is_empty());
        assert!(h.backend.requests().is_empty());
    }

    #[tokio::test]
    async fn test_bus_injects_and_answers_mentions() {
        let h = harness(NEVER);
        h.engine.handle_message(event(1, "hello", noon())).await;
        h.bus.broadcast(1, "bot_b", "old news", false).unwrap();

        // First poll skips the backlog.
        h.engine.bus_tick().await;
        assert!(h.engine.history(1).await.is_empty());

        h.bus.broadcast(1, "bot_b", "@bot_a what do you think?", false).unwrap();
        h.bus.broadcast(1, "bot_b", "@bot_a and this?", true).unwrap();
        h.engine.bus_tick().await;

        let history = h.engine.history(1).await;
        assert_eq!(history[0], HistoryEntry::user("bot_b: @bot_a what do you think?"));
        assert_eq!(history[1], HistoryEntry::assistant("ok"));
        assert_eq!(history[2], HistoryEntry::user("bot_b: @bot_a and this?"));

        // Only the first record started a reply, and that reply is marked.
        assert_eq!(h.backend.requests().len(), 1);
        let ours: Vec<_> = h.bus.records(1).into_iter().filter(|r| r.emitter == "bot_a").collect();
        assert_eq!(ours.len(), 1);
        assert!(ours[0].originated_from_bus);
    }

    #[tokio::test]
    async fn test_reply_stamped_with_event_time() {
        let h = harness(NEVER);
        h.engine.handle_message(event(1, "@bot_a hi", noon())).await;

        let state = h.engine.engagement_state(1).await.unwrap();
        assert_eq!(state.last_bot_reply_at, Some(noon()));
        assert_eq!(state.last_activity_at, Some(noon()));
    }

    #[tokio::test]
    async fn test_nudge_failure_not_posted() {
        let h = harness(NEVER);
        h.engine.handle_message(event(1, "anyone?", noon() - TimeDelta::hours(3))).await;
        h.backend.push(Err("down"));

        assert!(h.engine.nudge_tick(noon()).await.is_empty());
        assert_eq!(h.backend.requests().len(), 1);
        assert!(h.outbound.texts().is_empty());
        assert!(h.bus.records(1).is_empty());
    }

    #[tokio::test]
    async fn test_manual_nudge_failure_reported() {
        let h = harness(NEVER);
        h.backend.push(Err("down"));

        let outcome = h.engine.handle_message(event(1, "/nudge@bot_a", noon())).await;
        assert_eq!(outcome, Outcome::BackendFailed);
        assert!(h.outbound.texts()[0].starts_with("⚠️"));
    }

    #[tokio::test]
    async fn test_bus_reply_failure_not_posted() {
        let h = harness(NEVER);
        h.engine.handle_message(event(1, "hello", noon())).await;
        h.engine.bus_tick().await;

        h.bus.broadcast(1, "bot_b", "@bot_a thoughts?", false).unwrap();
        h.backend.push(Err("down"));
        h.engine.bus_tick().await;

        assert_eq!(h.backend.requests().len(), 1);
        assert!(h.outbound.texts().is_empty());
        assert_eq!(h.engine.history(1).await, vec![HistoryEntry::user("bot_b: @bot_a thoughts?")]);
    }

    #[tokio::test]
    async fn test_bus_tick_handles_chats_concurrently() {
        let backend = Arc::new(SlowBackend::default());
        let bus = Arc::new(MemoryBus::new());
        let engine = Engine::new(
            settings(NEVER),
            Arc::new(MemoryClaimStore::new()),
            bus.clone(),
            backend.clone(),
            Arc::new(Recorder::default()),
            noon() - TimeDelta::hours(2),
        );

        for chat_id in 1..=3 {
            let mut msg = event(chat_id, "hello", noon());
            msg.chat_id = chat_id;
            engine.handle_message(msg).await;
        }
        engine.bus_tick().await;

        for chat_id in 1..=3 {
            bus.broadcast(chat_id, "bot_b", "@bot_a ping", false).unwrap();
        }
        engine.bus_tick().await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(backend.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_persist_tick_trims_bus() {
        let h = harness(NEVER);
        h.engine.handle_message(event(1, "hi", noon())).await;
        for i in 0..450 {
            h.bus.broadcast(1, "bot_b", &i.to_string(), false).unwrap();
        }
        h.engine.persist_tick().await;
        assert_eq!(h.bus.records(1).len(), 200);
    }
}
