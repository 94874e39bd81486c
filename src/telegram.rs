//! Telegram delivery using teloxide.

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{InputFile, MessageId, ParseMode, ReactionType, ReplyParameters};
use tracing::{debug, info, warn};

use crate::coord::extract::{MediaKind, MediaReply, MediaSource};

/// Reaction that marks a message as taken by this bot.
pub const CLAIM_REACTION: &str = "👀";

/// Everything the engine sends to a chat.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str, reply_to: Option<i64>) -> Result<i64, String>;

    async fn send_media(&self, chat_id: i64, media: &MediaReply, reply_to: Option<i64>) -> Result<i64, String>;

    /// Visible marker on a claimed message. Purely cosmetic.
    async fn mark_claimed(&self, chat_id: i64, message_id: i64) -> Result<(), String>;
}

/// Telegram API client.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    fn input_file(media: &MediaReply) -> Result<InputFile, String> {
        let file_name = match media.kind {
            MediaKind::Image => "image.png",
            MediaKind::Voice => "voice.ogg",
        };

        Ok(match &media.source {
            MediaSource::Bytes(data) => InputFile::memory(data.clone()).file_name(file_name),
            MediaSource::Url(url) => {
                let url = reqwest::Url::parse(url).map_err(|e| format!("Bad media URL {url}: {e}"))?;
                InputFile::url(url)
            }
            MediaSource::Path(path) => InputFile::file(path),
        })
    }
}

fn reply_params(reply_to: Option<i64>) -> Option<ReplyParameters> {
    reply_to.map(|id| ReplyParameters::new(MessageId(id as i32)))
}

#[async_trait]
impl Outbound for TelegramClient {
    async fn send_text(&self, chat_id: i64, text: &str, reply_to: Option<i64>) -> Result<i64, String> {
        let mut request = self
            .bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html);
        if let Some(params) = reply_params(reply_to) {
            request = request.reply_parameters(params);
        }

        match request.await {
            Ok(msg) => Ok(msg.id.0 as i64),
            Err(e) => {
                // Model output is not always valid HTML; retry as plain text.
                debug!("HTML send failed in chat {}: {e}, retrying plain", chat_id);
                let mut request = self.bot.send_message(ChatId(chat_id), text);
                if let Some(params) = reply_params(reply_to) {
                    request = request.reply_parameters(params);
                }
                request.await.map(|msg| msg.id.0 as i64).map_err(|e| {
                    let msg = format!("Failed to send: {e}");
                    warn!("{}", msg);
                    msg
                })
            }
        }
    }

    async fn send_media(&self, chat_id: i64, media: &MediaReply, reply_to: Option<i64>) -> Result<i64, String> {
        let file = Self::input_file(media).inspect_err(|e| warn!("{}", e))?;
        let caption = Some(media.caption.as_str()).filter(|c| !c.is_empty());

        let result = match media.kind {
            MediaKind::Image => {
                info!("📷 Sending image to chat {}", chat_id);
                let mut request = self.bot.send_photo(ChatId(chat_id), file);
                if let Some(cap) = caption {
                    request = request.caption(cap).parse_mode(ParseMode::Html);
                }
                if let Some(params) = reply_params(reply_to) {
                    request = request.reply_parameters(params);
                }
                request.await
            }
            MediaKind::Voice => {
                info!("🔊 Sending voice to chat {}", chat_id);
                let mut request = self.bot.send_voice(ChatId(chat_id), file);
                if let Some(cap) = caption {
                    request = request.caption(cap);
                }
                if let Some(params) = reply_params(reply_to) {
                    request = request.reply_parameters(params);
                }
                request.await
            }
        };

        result.map(|msg| msg.id.0 as i64).map_err(|e| {
            let msg = format!("Failed to send media: {e}");
            warn!("{}", msg);
            msg
        })
    }

    async fn mark_claimed(&self, chat_id: i64, message_id: i64) -> Result<(), String> {
        let reaction = ReactionType::Emoji {
            emoji: CLAIM_REACTION.to_string(),
        };

        self.bot
            .set_message_reaction(ChatId(chat_id), MessageId(message_id as i32))
            .reaction(vec![reaction])
            .await
            .map(|_| ())
            .map_err(|e| format!("Failed to add reaction: {e}"))
    }
}
