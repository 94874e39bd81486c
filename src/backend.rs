//! Language-model backend.
//!
//! The engine only needs one call: given a chat's window and an optional
//! one-off hint, produce reply text. `OpenAiBackend` implements it over the
//! OpenAI Responses API.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::coord::history::{self, HistoryEntry};

/// One generation request.
#[derive(Debug, Clone, Default)]
pub struct ReplyRequest {
    pub chat_id: i64,
    /// Conversation window, oldest first, including the turn being answered.
    pub history: Vec<HistoryEntry>,
    /// Ephemeral system instruction for this call only.
    pub hint: Option<String>,
    /// Tool the model must call.
    pub tool_choice: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("Failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Response contained no text")]
    Empty,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn generate_reply(&self, request: ReplyRequest) -> Result<String, BackendError>;
}

pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    instructions: String,
    tools: Vec<Value>,
}

#[derive(Serialize, Debug)]
struct ResponsesRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    instructions: &'a str,
    input: Vec<Value>,
    #[serde(skip_serializing_if = "<[Value]>::is_empty")]
    tools: &'a [Value],
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
}

#[derive(Deserialize, Debug)]
struct ResponsesResponse {
    #[serde(default)]
    output: Vec<OutputItem>,
    error: Option<ApiError>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

#[derive(Deserialize, Debug)]
struct OutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Vec<OutputContent>,
}

#[derive(Deserialize, Debug)]
struct OutputContent {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

impl OpenAiBackend {
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        instructions: String,
        tools: Vec<Value>,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            instructions,
            tools,
        })
    }

    fn build_body(&self, request: &ReplyRequest) -> Result<Value, BackendError> {
        let mut input = history::normalize(&request.history)
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(hint) = request.hint.as_deref().filter(|h| !h.is_empty()) {
            input.push(serde_json::json!({"role": "system", "content": hint}));
        }

        // Forcing a tool only makes sense when tools are declared.
        let tool_choice = request
            .tool_choice
            .as_deref()
            .filter(|_| !self.tools.is_empty())
            .map(|name| serde_json::json!({"type": "function", "name": name}));

        let body = ResponsesRequest {
            model: &self.model,
            instructions: &self.instructions,
            input,
            tools: &self.tools,
            tool_choice,
        };
        Ok(serde_json::to_value(body)?)
    }
}

/// Concatenate the text of every assistant message in a Responses payload.
fn parse_output(body: &str) -> Result<String, BackendError> {
    let parsed: ResponsesResponse = serde_json::from_str(body)?;

    if let Some(error) = parsed.error {
        return Err(BackendError::Api {
            status: 200,
            body: error.message,
        });
    }

    let text = parsed
        .output
        .iter()
        .filter(|item| item.kind == "message")
        .flat_map(|item| item.content.iter())
        .filter(|c| c.kind == "output_text")
        .filter_map(|c| c.text.as_deref())
        .collect::<Vec<_>>()
        .join("");

    if text.trim().is_empty() {
        return Err(BackendError::Empty);
    }
    Ok(text)
}

#[async_trait]
impl Backend for OpenAiBackend {
    async fn generate_reply(&self, request: ReplyRequest) -> Result<String, BackendError> {
        let body = self.build_body(&request)?;
        info!(
            "🧠 Asking {} for chat {} ({} history entries)",
            self.model,
            request.chat_id,
            request.history.len()
        );

        let response = self
            .client
            .post(format!("{}/responses", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        debug!("Responses API status: {status}");

        if !status.is_success() {
            return Err(BackendError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        parse_output(&text)
    }
}
