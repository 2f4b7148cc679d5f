//! LINE Messaging API: webhook payload shapes and the push-message client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::LineConfig;
use crate::platform::{Delivery, IncomingMessage, Messenger};

/// LINE rejects text messages longer than this.
const MAX_TEXT_LEN: usize = 5000;
/// LINE accepts at most this many messages per push request.
const MAX_MESSAGES_PER_PUSH: usize = 5;

/// Body of a webhook delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    /// Bot user id the events were sent to
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub events: Vec<Event>,
}

/// One webhook event. Only the fields the relay reads are modelled.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// "message", "follow", "unfollow", "postback", ...
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub source: Option<Source>,
    #[serde(default)]
    pub message: Option<EventMessage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventMessage {
    /// "text", "sticker", "image", "location", ...
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl Event {
    /// Sender's user id, if the source carries one.
    pub fn user_id(&self) -> Option<&str> {
        self.source
            .as_ref()
            .and_then(|s| s.user_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// Message text, for text-message events only.
    pub fn text(&self) -> Option<&str> {
        if self.kind != "message" {
            return None;
        }
        self.message
            .as_ref()
            .filter(|m| m.kind == "text")
            .and_then(|m| m.text.as_deref())
    }

    pub fn incoming(&self) -> Option<IncomingMessage> {
        Some(IncomingMessage {
            user_id: self.user_id()?.to_string(),
            text: self.text()?.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    to: &'a str,
    messages: Vec<TextMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct TextMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

/// Split long messages for LINE's per-message length limit
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        // A single char wider than max_len still goes out as its own chunk
        if end == start {
            end = start + text[start..].chars().next().map_or(1, char::len_utf8);
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

/// Client for `POST /v2/bot/message/push`.
pub struct LineClient {
    client: reqwest::Client,
    access_token: String,
    base_url: String,
}

impl LineClient {
    pub fn new(config: &LineConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            access_token: config.channel_access_token.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Push `text` to `to`, splitting it across as many messages and
    /// requests as LINE's limits require.
    pub async fn push_text(&self, to: &str, text: &str) -> Result<()> {
        let url = format!("{}/v2/bot/message/push", self.base_url);
        let chunks = split_message(text, MAX_TEXT_LEN);

        for batch in chunks.chunks(MAX_MESSAGES_PER_PUSH) {
            let request = PushRequest {
                to,
                messages: batch
                    .iter()
                    .map(|chunk| TextMessage {
                        kind: "text",
                        text: chunk,
                    })
                    .collect(),
            };

            debug!("Pushing {} message(s) to {}", batch.len(), to);

            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.access_token)
                .json(&request)
                .send()
                .await
                .context("Failed to send request to LINE push API")?;

            let status = response.status();
            if !status.is_success() {
                let error_body = response.text().await.unwrap_or_default();
                anyhow::bail!("LINE push API error ({}): {}", status, error_body);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Messenger for LineClient {
    async fn push(&self, user_id: &str, text: &str) -> Delivery {
        match self.push_text(user_id, text).await {
            Ok(()) => Delivery::Sent,
            Err(e) => {
                error!("Failed to push message to {}: {:#}", user_id, e);
                Delivery::Failed(format!("{:#}", e))
            }
        }
    }
}
