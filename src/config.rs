use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveTime, TimeDelta};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::coord::engagement::{EngagementPolicy, MentionDetector};
use crate::coord::nudge::{ActiveHours, MorningPrompt};
use crate::engine::{EngineSettings, NudgeSettings};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", path.display())]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file '{}': {source}", path.display())]
    ParseJson { path: PathBuf, source: serde_json::Error },
    #[error("invalid regex pattern '{pattern}': {source}")]
    InvalidRegex { pattern: String, source: regex::Error },
    #[error("invalid time '{value}' for {field} (expected HH:MM)")]
    InvalidTime { field: &'static str, value: String },
    #[error("unknown timezone '{0}'")]
    InvalidTimezone(String),
    #[error("config validation error: {0}")]
    Validation(String),
}

#[derive(Deserialize)]
#[serde(default)]
struct ConfigFile {
    telegram_bot_token: String,
    /// This bot's username, with or without the leading @.
    bot_username: String,
    /// Usernames of sibling bots sharing the chats.
    peer_bots: Vec<String>,
    openai_api_key: String,
    openai_model: String,
    openai_base_url: String,
    /// Tool definitions passed through to the Responses API.
    openai_tools: Vec<Value>,
    system_prompt: String,
    /// Hint attached to unmentioned replies.
    chat_react_prompt: String,
    /// Nicknames that count as a mention (regex, case-insensitive).
    name_mention_patterns: Vec<String>,
    voice_keywords: Vec<String>,
    /// Directory for state files (logs, history). Defaults to current directory.
    data_dir: Option<String>,
    claim_dir: String,
    bus_dir: String,
    history_dir: Option<String>,
    max_history: usize,
    claim_jitter_ms: [u64; 2],
    claim_max_age_secs: u64,
    bus_poll_secs: u64,
    bus_max_lines: usize,
    persist_interval_secs: u64,
    nudge_minutes: i64,
    stale_history_minutes: i64,
    nudge_check_secs: u64,
    startup_grace_secs: i64,
    active_start: String,
    active_end: String,
    timezone: String,
    nudge_enabled_chats: Vec<i64>,
    nudge_prompts: Vec<String>,
    nudge_prompt_history: usize,
    /// Use the first nudge prompt during the morning window.
    first_nudge_enabled: bool,
    first_nudge_start: String,
    first_nudge_end: String,
    response_probabilities: Vec<f64>,
    recent_activity_secs: i64,
    max_unmentioned_replies: u32,
    counter_reset_secs: i64,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            telegram_bot_token: String::new(),
            bot_username: String::new(),
            peer_bots: Vec::new(),
            openai_api_key: String::new(),
            openai_model: "gpt-5.1".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_tools: Vec::new(),
            system_prompt: String::new(),
            chat_react_prompt: String::new(),
            name_mention_patterns: Vec::new(),
            voice_keywords: vec!["голос".to_string(), "voice".to_string()],
            data_dir: None,
            claim_dir: "/tmp/chorus_claims".to_string(),
            bus_dir: "/tmp/chorus_bus".to_string(),
            history_dir: None,
            max_history: 20,
            claim_jitter_ms: [500, 3000],
            claim_max_age_secs: 300,
            bus_poll_secs: 5,
            bus_max_lines: 200,
            persist_interval_secs: 300,
            nudge_minutes: 120,
            stale_history_minutes: 30,
            nudge_check_secs: 60,
            startup_grace_secs: 300,
            active_start: "10:00".to_string(),
            active_end: "21:00".to_string(),
            timezone: "Europe/Riga".to_string(),
            nudge_enabled_chats: Vec::new(),
            nudge_prompts: Vec::new(),
            nudge_prompt_history: 3,
            first_nudge_enabled: false,
            first_nudge_start: "10:00".to_string(),
            first_nudge_end: "12:00".to_string(),
            response_probabilities: vec![0.10, 0.25, 0.50, 0.75, 1.00],
            recent_activity_secs: 30,
            max_unmentioned_replies: 3,
            counter_reset_secs: 300,
        }
    }
}

pub struct Config {
    pub telegram_bot_token: String,
    /// Lowercase, without @.
    pub bot_username: String,
    /// Lowercase, without @.
    pub peer_bots: Vec<String>,
    pub openai_api_key: String,
    pub openai_model: String,
    pub openai_base_url: String,
    pub openai_tools: Vec<Value>,
    pub system_prompt: String,
    pub chat_react_prompt: String,
    /// All name patterns joined into one case-insensitive alternation.
    pub name_pattern: Option<Regex>,
    /// Lowercase.
    pub voice_keywords: Vec<String>,
    /// Directory for state files (logs, history).
    pub data_dir: PathBuf,
    pub claim_dir: PathBuf,
    pub bus_dir: PathBuf,
    pub history_dir: PathBuf,
    pub max_history: usize,
    pub claim_jitter: RangeInclusive<Duration>,
    pub claim_max_age: Duration,
    pub bus_poll_interval: Duration,
    pub bus_max_lines: usize,
    pub persist_interval: Duration,
    pub nudge_check_interval: Duration,
    pub nudge_inactivity: TimeDelta,
    pub startup_grace: TimeDelta,
    pub active_hours: ActiveHours,
    pub nudge_enabled_chats: HashSet<i64>,
    pub nudge_prompts: Vec<String>,
    pub nudge_prompt_history: usize,
    pub morning_prompt: Option<MorningPrompt>,
    pub policy: EngagementPolicy,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation("telegram_bot_token is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into()
            ));
        }

        let bot_username = normalize_username(&file.bot_username);
        if bot_username.is_empty() {
            return Err(ConfigError::Validation("bot_username is required".into()));
        }
        if file.openai_api_key.is_empty() {
            return Err(ConfigError::Validation("openai_api_key is required".into()));
        }

        let probabilities: [f64; 5] = file.response_probabilities.as_slice().try_into().map_err(|_| {
            ConfigError::Validation("response_probabilities must have exactly 5 entries".into())
        })?;
        if probabilities.iter().any(|p| !(0.0..=1.0).contains(p)) {
            return Err(ConfigError::Validation("response_probabilities must be within [0, 1]".into()));
        }
        if probabilities.windows(2).any(|w| w[0] > w[1]) {
            return Err(ConfigError::Validation("response_probabilities must be non-decreasing".into()));
        }

        let [jitter_min, jitter_max] = file.claim_jitter_ms;
        if jitter_min > jitter_max {
            return Err(ConfigError::Validation("claim_jitter_ms must be [min, max] with min <= max".into()));
        }

        let tz: Tz = file
            .timezone
            .parse()
            .map_err(|_| ConfigError::InvalidTimezone(file.timezone.clone()))?;
        let active_hours = ActiveHours {
            start: parse_time("active_start", &file.active_start)?,
            end: parse_time("active_end", &file.active_end)?,
            tz,
        };

        let morning_prompt = if file.first_nudge_enabled {
            let start = parse_time("first_nudge_start", &file.first_nudge_start)?;
            let end = parse_time("first_nudge_end", &file.first_nudge_end)?;
            file.nudge_prompts.first().map(|prompt| MorningPrompt {
                prompt: prompt.clone(),
                start,
                end,
            })
        } else {
            None
        };

        let name_pattern = compile_name_patterns(&file.name_mention_patterns)?;

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let history_dir = file
            .history_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("chat_history"));

        let nudge_inactivity = time_delta("nudge_minutes", file.nudge_minutes, TimeDelta::try_minutes)?;
        let startup_grace = time_delta("startup_grace_secs", file.startup_grace_secs, TimeDelta::try_seconds)?;
        let policy = EngagementPolicy {
            response_probabilities: probabilities,
            recent_activity: time_delta("recent_activity_secs", file.recent_activity_secs, TimeDelta::try_seconds)?,
            max_unmentioned_replies: file.max_unmentioned_replies,
            stale_history_after: time_delta(
                "stale_history_minutes",
                file.stale_history_minutes,
                TimeDelta::try_minutes,
            )?,
            counter_reset_interval: time_delta("counter_reset_secs", file.counter_reset_secs, TimeDelta::try_seconds)?,
        };

        Ok(Self {
            telegram_bot_token: file.telegram_bot_token,
            bot_username,
            peer_bots: file.peer_bots.iter().map(|s| normalize_username(s)).collect(),
            openai_api_key: file.openai_api_key,
            openai_model: file.openai_model,
            openai_base_url: file.openai_base_url,
            openai_tools: file.openai_tools,
            system_prompt: file.system_prompt,
            chat_react_prompt: file.chat_react_prompt,
            name_pattern,
            voice_keywords: file.voice_keywords.iter().map(|k| k.to_lowercase()).collect(),
            data_dir,
            claim_dir: PathBuf::from(file.claim_dir),
            bus_dir: PathBuf::from(file.bus_dir),
            history_dir,
            max_history: file.max_history.max(1),
            claim_jitter: Duration::from_millis(jitter_min)..=Duration::from_millis(jitter_max),
            claim_max_age: Duration::from_secs(file.claim_max_age_secs),
            bus_poll_interval: Duration::from_secs(file.bus_poll_secs.max(1)),
            bus_max_lines: file.bus_max_lines,
            persist_interval: Duration::from_secs(file.persist_interval_secs.max(1)),
            nudge_check_interval: Duration::from_secs(file.nudge_check_secs.max(1)),
            nudge_inactivity,
            startup_grace,
            active_hours,
            nudge_enabled_chats: file.nudge_enabled_chats.into_iter().collect(),
            nudge_prompts: file.nudge_prompts,
            nudge_prompt_history: file.nudge_prompt_history,
            morning_prompt,
            policy,
        })
    }

    /// Runtime settings for the engine.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            identity: self.bot_username.clone(),
            mentions: MentionDetector::new(&self.bot_username, self.name_pattern.clone(), &self.peer_bots),
            voice_keywords: self.voice_keywords.clone(),
            chat_react_prompt: self.chat_react_prompt.clone(),
            claim_jitter: self.claim_jitter.clone(),
            claim_max_age: self.claim_max_age,
            bus_poll_interval: self.bus_poll_interval,
            bus_max_lines: self.bus_max_lines,
            persist_interval: self.persist_interval,
            max_history: self.max_history,
            history_dir: Some(self.history_dir.clone()),
            policy: self.policy.clone(),
            nudge: NudgeSettings {
                check_interval: self.nudge_check_interval,
                active_hours: self.active_hours,
                enabled_chats: self.nudge_enabled_chats.clone(),
                inactivity: self.nudge_inactivity,
                startup_grace: self.startup_grace,
                prompts: self.nudge_prompts.clone(),
                prompt_history: self.nudge_prompt_history,
                morning: self.morning_prompt.clone(),
            },
        }
    }
}

fn normalize_username(name: &str) -> String {
    name.trim().trim_start_matches('@').to_lowercase()
}

/// Non-negative count of `unit`s; rejects values chrono can't represent.
fn time_delta(field: &str, value: i64, unit: fn(i64) -> Option<TimeDelta>) -> Result<TimeDelta, ConfigError> {
    if value < 0 {
        return Err(ConfigError::Validation(format!("{field} must not be negative (got {value})")));
    }
    unit(value).ok_or_else(|| ConfigError::Validation(format!("{field} is out of range (got {value})")))
}

fn parse_time(field: &'static str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|_| ConfigError::InvalidTime {
        field,
        value: value.to_string(),
    })
}

fn compile_name_patterns(patterns: &[String]) -> Result<Option<Regex>, ConfigError> {
    let patterns: Vec<&String> = patterns.iter().filter(|p| !p.trim().is_empty()).collect();
    if patterns.is_empty() {
        return Ok(None);
    }

    // Check each on its own so the error names the bad one.
    for p in &patterns {
        Regex::new(p).map_err(|e| ConfigError::InvalidRegex { pattern: p.to_string(), source: e })?;
    }

    let joined = patterns
        .iter()
        .map(|p| format!("(?:{p})"))
        .collect::<Vec<_>>()
        .join("|");
    let combined = format!("(?i){joined}");
    Regex::new(&combined)
        .map(Some)
        .map_err(|e| ConfigError::InvalidRegex { pattern: combined, source: e })
}
