//! Per-chat engagement decisions.
//!
//! A mention is always answered. Anything else is answered with a probability
//! that grows with the number of user messages since our last reply, unless
//! we already answered too many unmentioned messages in a row.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use tracing::{debug, info};

/// Tunables of the decision function.
#[derive(Debug, Clone, PartialEq)]
pub struct EngagementPolicy {
    /// Passive reply probability after 0, 1, 2, 3 and 4+ user messages.
    pub response_probabilities: [f64; 5],
    /// A passive message this soon after our own reply is always answered.
    pub recent_activity: TimeDelta,
    /// Passive replies allowed between two mentions.
    pub max_unmentioned_replies: u32,
    /// Silence after which an incoming message starts a fresh history.
    pub stale_history_after: TimeDelta,
    /// How often the unmentioned reply counters are zeroed.
    pub counter_reset_interval: TimeDelta,
}

impl Default for EngagementPolicy {
    fn default() -> Self {
        Self {
            response_probabilities: [0.10, 0.25, 0.50, 0.75, 1.00],
            recent_activity: TimeDelta::seconds(30),
            max_unmentioned_replies: 3,
            stale_history_after: TimeDelta::minutes(30),
            counter_reset_interval: TimeDelta::seconds(300),
        }
    }
}

impl EngagementPolicy {
    /// Step function over messages since our last reply; saturates at the last entry.
    pub fn response_probability(&self, messages_since_reply: u32) -> f64 {
        let last = self.response_probabilities.len() - 1;
        self.response_probabilities[(messages_since_reply as usize).min(last)]
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatEngagementState {
    pub last_activity_at: Option<DateTime<Utc>>,
    pub last_bot_reply_at: Option<DateTime<Utc>>,
    pub unmentioned_reply_count: u32,
    pub messages_since_bot_reply: u32,
}

/// One inbound user message as seen by the scheduler.
#[derive(Debug, Clone)]
pub struct Inbound<'a> {
    pub chat_id: i64,
    pub sender: &'a str,
    pub text: &'a str,
    pub is_mention: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolHint {
    Voice,
}

impl ToolHint {
    /// Backend tool name.
    pub fn tool_name(self) -> &'static str {
        match self {
            ToolHint::Voice => "generate_voice",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipReason {
    UnmentionedLimit,
    Probability { probability: f64, roll: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Mention,
    Passive { probability: f64 },
    Skip(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub verdict: Verdict,
    pub tool_hint: Option<ToolHint>,
}

impl Decision {
    pub fn respond(&self) -> bool {
        !matches!(self.verdict, Verdict::Skip(_))
    }

    pub fn is_passive(&self) -> bool {
        matches!(self.verdict, Verdict::Passive { .. })
    }
}

/// Engagement state of every chat this process has seen.
pub struct EngagementRegistry {
    policy: EngagementPolicy,
    voice_keywords: Vec<String>,
    chats: HashMap<i64, ChatEngagementState>,
    last_reset: DateTime<Utc>,
}

impl EngagementRegistry {
    pub fn new(policy: EngagementPolicy, now: DateTime<Utc>) -> Self {
        Self {
            policy,
            voice_keywords: Vec::new(),
            chats: HashMap::new(),
            last_reset: now,
        }
    }

    /// Words starting with any of these (lowercase) request a voice reply.
    pub fn with_voice_keywords(mut self, keywords: Vec<String>) -> Self {
        self.voice_keywords = keywords;
        self
    }

    pub fn state(&self, chat_id: i64) -> Option<&ChatEngagementState> {
        self.chats.get(&chat_id)
    }

    pub fn chat_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.chats.keys().copied()
    }

    /// Record an inbound user message. Called for every message, claimed or
    /// not. Returns true when the chat had been silent long enough that its
    /// history should be dropped before handling this message.
    pub fn observe(&mut self, chat_id: i64, at: DateTime<Utc>) -> bool {
        let stale_after = self.policy.stale_history_after;
        let state = self.chats.entry(chat_id).or_default();

        let stale = state
            .last_activity_at
            .is_some_and(|last| at - last >= stale_after);

        state.last_activity_at = Some(at);
        state.messages_since_bot_reply = state.messages_since_bot_reply.saturating_add(1);
        stale
    }

    /// Record activity that isn't a user message to us (a sibling bot's post).
    pub fn touch(&mut self, chat_id: i64, at: DateTime<Utc>) {
        let state = self.chats.entry(chat_id).or_default();
        if state.last_activity_at.is_none_or(|last| last < at) {
            state.last_activity_at = Some(at);
        }
    }

    /// Decide whether to answer a message already passed to [`observe`].
    /// `roll` is a uniform sample in `[0, 1)`.
    ///
    /// The probability step is indexed by the message count including this
    /// one, so the first message after our reply already rolls against the
    /// second step.
    ///
    /// [`observe`]: EngagementRegistry::observe
    pub fn decide(&mut self, msg: &Inbound<'_>, roll: f64) -> Decision {
        let tool_hint = (msg.is_mention && wants_voice(msg.text, &self.voice_keywords))
            .then_some(ToolHint::Voice);
        let policy = &self.policy;
        let state = self.chats.entry(msg.chat_id).or_default();

        if msg.is_mention {
            state.unmentioned_reply_count = 0;
            return Decision {
                verdict: Verdict::Mention,
                tool_hint,
            };
        }

        if state.unmentioned_reply_count >= policy.max_unmentioned_replies {
            debug!(
                "Chat {}: {} unmentioned replies already, staying quiet",
                msg.chat_id, state.unmentioned_reply_count
            );
            return Decision {
                verdict: Verdict::Skip(SkipReason::UnmentionedLimit),
                tool_hint: None,
            };
        }

        let recent = state
            .last_bot_reply_at
            .is_some_and(|at| msg.timestamp - at <= policy.recent_activity);
        let probability = if recent {
            1.0
        } else {
            policy.response_probability(state.messages_since_bot_reply)
        };

        if roll < probability {
            state.unmentioned_reply_count += 1;
            info!(
                "🎲 Passive reply in chat {} to {} (p={:.2})",
                msg.chat_id, msg.sender, probability
            );
            Decision {
                verdict: Verdict::Passive { probability },
                tool_hint: None,
            }
        } else {
            Decision {
                verdict: Verdict::Skip(SkipReason::Probability { probability, roll }),
                tool_hint: None,
            }
        }
    }

    /// Record that we posted in the chat.
    pub fn mark_replied(&mut self, chat_id: i64, at: DateTime<Utc>) {
        let state = self.chats.entry(chat_id).or_default();
        state.last_activity_at = Some(at);
        state.last_bot_reply_at = Some(at);
        state.messages_since_bot_reply = 0;
    }

    /// Zero every unmentioned reply counter once per reset interval.
    /// Returns true when a reset happened.
    pub fn maybe_reset_counters(&mut self, now: DateTime<Utc>) -> bool {
        if now - self.last_reset < self.policy.counter_reset_interval {
            return false;
        }
        for state in self.chats.values_mut() {
            state.unmentioned_reply_count = 0;
        }
        self.last_reset = now;
        true
    }
}

fn wants_voice(text: &str, keywords: &[String]) -> bool {
    let lower = text.to_lowercase();
    lower
        .split_whitespace()
        .any(|word| keywords.iter().any(|k| word.starts_with(k.as_str())))
}

/// Recognizes messages addressed to this bot or to one of its siblings.
#[derive(Debug, Clone)]
pub struct MentionDetector {
    tag: String,
    name_pattern: Option<Regex>,
    peer_tags: Vec<String>,
}

impl MentionDetector {
    pub fn new(bot_username: &str, name_pattern: Option<Regex>, peers: &[String]) -> Self {
        Self {
            tag: format!("@{}", bot_username.trim_start_matches('@').to_ascii_lowercase()),
            name_pattern,
            peer_tags: peers
                .iter()
                .map(|p| format!("@{}", p.trim_start_matches('@').to_ascii_lowercase()))
                .collect(),
        }
    }

    /// `@username` or a configured nickname appears in the text.
    pub fn is_mention(&self, text: &str) -> bool {
        text.to_ascii_lowercase().contains(&self.tag)
            || self.name_pattern.as_ref().is_some_and(|re| re.is_match(text))
    }

    /// The text tags a sibling bot and not us.
    pub fn addressed_to_peer_only(&self, text: &str) -> bool {
        if self.is_mention(text) {
            return false;
        }
        let lower = text.to_ascii_lowercase();
        self.peer_tags.iter().any(|tag| lower.contains(tag.as_str()))
    }

    /// Remove the first `@username` occurrence and trim.
    pub fn strip_tag(&self, text: &str) -> String {
        let lower = text.to_ascii_lowercase();
        match lower.find(&self.tag) {
            Some(start) => {
                let mut out = String::with_capacity(text.len());
                out.push_str(&text[..start]);
                out.push_str(&text[start + self.tag.len()..]);
                out.trim().to_string()
            }
            None => text.trim().to_string(),
        }
    }
}
