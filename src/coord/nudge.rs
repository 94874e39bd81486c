//! Time-based nudges: when a chat has gone quiet, one bot starts talking.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use chrono_tz::Tz;
use rand::Rng;
use rand::seq::IndexedRandom;

/// Daily window in a fixed timezone. `start > end` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub tz: Tz,
}

impl ActiveHours {
    pub fn local_time(&self, now: DateTime<Utc>) -> NaiveTime {
        now.with_timezone(&self.tz).time()
    }

    /// Whether `now` falls inside the window, both bounds inclusive.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let t = self.local_time(now);
        if self.start <= self.end {
            self.start <= t && t <= self.end
        } else {
            t >= self.start || t <= self.end
        }
    }
}

/// Why a chat was not nudged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NudgeSkip {
    OutsideActiveHours,
    NotEnabled,
    StartupGrace,
    /// Nothing observed in the chat since start-up.
    NoActivity,
    NotInactiveLongEnough { idle: TimeDelta },
}

/// Conditions that must all hold before a nudge fires.
#[derive(Debug, Clone)]
pub struct NudgeGate {
    pub active_hours: ActiveHours,
    pub enabled_chats: HashSet<i64>,
    pub inactivity: TimeDelta,
    pub startup_grace: TimeDelta,
    pub started_at: DateTime<Utc>,
}

impl NudgeGate {
    pub fn check(
        &self,
        chat_id: i64,
        last_activity: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), NudgeSkip> {
        if !self.active_hours.contains(now) {
            return Err(NudgeSkip::OutsideActiveHours);
        }
        if !self.enabled_chats.contains(&chat_id) {
            return Err(NudgeSkip::NotEnabled);
        }
        if now - self.started_at < self.startup_grace {
            return Err(NudgeSkip::StartupGrace);
        }
        let Some(last) = last_activity else {
            return Err(NudgeSkip::NoActivity);
        };
        let idle = now - last;
        if idle < self.inactivity {
            return Err(NudgeSkip::NotInactiveLongEnough { idle });
        }
        Ok(())
    }
}

/// Prompt used instead of the rotation during a morning window.
#[derive(Debug, Clone, PartialEq)]
pub struct MorningPrompt {
    pub prompt: String,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Random nudge prompt selection that avoids the last few picks.
#[derive(Debug, Clone)]
pub struct PromptRotation {
    prompts: Vec<String>,
    recent: VecDeque<String>,
    history_len: usize,
    morning: Option<MorningPrompt>,
}

impl PromptRotation {
    pub fn new(prompts: Vec<String>, history_len: usize) -> Self {
        Self {
            prompts,
            recent: VecDeque::new(),
            history_len,
            morning: None,
        }
    }

    pub fn with_morning(mut self, morning: MorningPrompt) -> Self {
        self.morning = Some(morning);
        self
    }

    pub fn recent(&self) -> impl Iterator<Item = &str> {
        self.recent.iter().map(String::as_str)
    }

    /// Pick the next prompt for local time `now`. `None` if no prompts are configured.
    pub fn select<R: Rng + ?Sized>(&mut self, now: NaiveTime, rng: &mut R) -> Option<String> {
        if let Some(morning) = &self.morning
            && morning.start <= now
            && now < morning.end
        {
            return Some(morning.prompt.clone());
        }

        let mut available: Vec<&String> = self
            .prompts
            .iter()
            .filter(|p| !self.recent.contains(p))
            .collect();

        if available.is_empty() {
            // Everything was used recently: forget all but the last pick.
            while self.recent.len() > 1 {
                self.recent.pop_front();
            }
            available = self
                .prompts
                .iter()
                .filter(|p| !self.recent.contains(p))
                .collect();
        }
        if available.is_empty() {
            available = self.prompts.iter().collect();
        }

        let prompt = (*available.choose(rng)?).clone();

        self.recent.push_back(prompt.clone());
        while self.recent.len() > self.history_len {
            self.recent.pop_front();
        }
        Some(prompt)
    }
}
