//! Post-processing of backend replies.
//!
//! Replies may carry file-search citation markers and, when a tool produced
//! an image or a voice clip, a JSON payload or a file path pointing at it.
//! Media detection runs an ordered chain of matchers; the first hit wins.

use std::path::Path;
use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use serde_json::{Map, Value};

static CITATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\{【]\d+:[^】}]+[】\}]").expect("valid citation regex"));
static JSON_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid json block regex"));
static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+").expect("valid url regex"));
static IMAGE_EXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(?:jpe?g|png|gif)(?:\?|$)").expect("valid image ext regex"));
static AUDIO_EXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(?:mp3|ogg|oga|opus|wav|m4a)(?:\?|$)").expect("valid audio ext regex"));
static TMP_IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/tmp/\S+\.(?:jpe?g|png|gif)").expect("valid tmp image regex"));
static TMP_AUDIO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/tmp/\S+\.(?:mp3|ogg|wav|m4a)").expect("valid tmp audio regex"));

/// Strip citation markers such as `【4:5†file.json】` or `{24:0†x}`.
pub fn clean_reply(text: &str) -> String {
    CITATION_RE.replace_all(text, "").trim().to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaSource {
    Bytes(Vec<u8>),
    Url(String),
    Path(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Voice,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaReply {
    pub kind: MediaKind,
    pub source: MediaSource,
    /// Text to send along with (or after) the media.
    pub caption: String,
}

/// A JSON object found in a reply, plus any text after it.
struct Payload {
    data: Map<String, Value>,
    trailing: String,
}

impl Payload {
    fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Explicit `caption` field, falling back to the trailing text.
    fn caption(&self) -> String {
        match self.data.get("caption") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(v) if !v.is_null() && !v.is_string() => v.to_string(),
            _ => self.trailing.clone(),
        }
    }
}

type Matcher = fn(&str, Option<&Payload>) -> Option<MediaReply>;

const MATCHERS: &[Matcher] = &[
    voice_payload,
    voice_tmp_path,
    image_payload,
    image_bare_url,
    image_tmp_path,
];

/// Find a media reference in a backend reply.
pub fn extract_media(reply: &str) -> Option<MediaReply> {
    let payload = find_payload(reply);
    MATCHERS.iter().find_map(|m| m(reply, payload.as_ref()))
}

fn find_payload(reply: &str) -> Option<Payload> {
    let (value, trailing) = match serde_json::from_str::<Value>(reply.trim()) {
        // A JSON string holding JSON.
        Ok(Value::String(inner)) => (serde_json::from_str::<Value>(&inner).ok()?, String::new()),
        Ok(value) => (value, String::new()),
        Err(_) => {
            let m = JSON_BLOCK_RE.find(reply)?;
            let value = serde_json::from_str::<Value>(m.as_str()).ok()?;
            (value, reply[m.end()..].trim().to_string())
        }
    };

    let Value::Object(mut data) = value else {
        return None;
    };

    // `{"type": "text", "text": "<json>"}` wrapper around the real payload.
    if data.get("type").and_then(Value::as_str) == Some("text")
        && let Some(Ok(Value::Object(inner))) = data
            .get("text")
            .and_then(Value::as_str)
            .map(serde_json::from_str::<Value>)
    {
        data = inner;
    }

    Some(Payload { data, trailing })
}

fn has_block(reply: &str) -> bool {
    JSON_BLOCK_RE.is_match(reply)
}

fn existing(path: &str) -> bool {
    Path::new(path).exists()
}

fn voice_payload(_reply: &str, payload: Option<&Payload>) -> Option<MediaReply> {
    let p = payload?;
    let voice = |source| {
        Some(MediaReply {
            kind: MediaKind::Voice,
            source,
            caption: p.caption(),
        })
    };

    if let Some(val) = p.str_field("voice") {
        if val.starts_with("http") {
            return voice(MediaSource::Url(val.to_string()));
        }
        if existing(val) {
            return voice(MediaSource::Path(val.to_string()));
        }
        return voice(MediaSource::Bytes(STANDARD.decode(val).ok()?));
    }

    let url = p
        .str_field("voice_url")
        .or_else(|| p.str_field("url").filter(|u| AUDIO_EXT_RE.is_match(u)));
    if let Some(url) = url {
        return voice(MediaSource::Url(url.to_string()));
    }

    match p.str_field("path") {
        Some(path) if existing(path) => voice(MediaSource::Path(path.to_string())),
        _ => None,
    }
}

fn voice_tmp_path(reply: &str, payload: Option<&Payload>) -> Option<MediaReply> {
    if payload.is_some() || has_block(reply) {
        return None;
    }
    let m = TMP_AUDIO_RE.find(reply)?;
    let path = m.as_str().trim_end_matches([')', '.', ',', '\'', '"']);
    if !existing(path) {
        return None;
    }
    let text = format!("{}{}", &reply[..m.start()], &reply[m.end()..]);
    Some(MediaReply {
        kind: MediaKind::Voice,
        source: MediaSource::Path(path.to_string()),
        caption: text.trim().to_string(),
    })
}

fn image_payload(_reply: &str, payload: Option<&Payload>) -> Option<MediaReply> {
    let p = payload?;
    let image = |source| {
        Some(MediaReply {
            kind: MediaKind::Image,
            source,
            caption: p.caption(),
        })
    };

    if let Some(val) = p.data.get("image") {
        let val = val.as_str()?;
        if val.starts_with("http") {
            return image(MediaSource::Url(val.to_string()));
        }
        return image(MediaSource::Bytes(STANDARD.decode(val).ok()?));
    }

    let url = p
        .str_field("image_url")
        .filter(|u| !u.is_empty())
        .or_else(|| p.str_field("url"))?;
    image(MediaSource::Url(url.to_string()))
}

fn image_bare_url(reply: &str, payload: Option<&Payload>) -> Option<MediaReply> {
    if payload.is_some() || has_block(reply) {
        return None;
    }
    let m = URL_RE.find(reply)?;
    let url = m.as_str().trim_end_matches([')', '.', ',', '\'', '"']);
    if !IMAGE_EXT_RE.is_match(url) {
        return None;
    }
    Some(MediaReply {
        kind: MediaKind::Image,
        source: MediaSource::Url(url.to_string()),
        caption: reply[m.end()..].trim().to_string(),
    })
}

fn image_tmp_path(reply: &str, payload: Option<&Payload>) -> Option<MediaReply> {
    if payload.is_some() || has_block(reply) {
        return None;
    }
    let m = TMP_IMAGE_RE.find(reply)?;
    if !existing(m.as_str()) {
        return None;
    }
    Some(MediaReply {
        kind: MediaKind::Image,
        source: MediaSource::Path(m.as_str().to_string()),
        caption: reply[m.end()..].trim().to_string(),
    })
}
