use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::LlmConfig;

/// Sent to the user in place of a reading when the completion API fails.
pub const FALLBACK_READING: &str =
    "Sorry, I'm unable to provide a reading at this time. Please try again later.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.into()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

/// Produces a reading for a user's message.
///
/// Never fails: implementations substitute a fallback text when the
/// upstream model is unavailable, so callers always have something to relay.
#[async_trait]
pub trait Completer: Send + Sync {
    async fn reading(&self, user_text: &str) -> String;
}

pub struct CompletionClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl CompletionClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// One chat-completion round trip: fixed system prompt plus a single user turn.
    pub async fn chat(&self, user_text: &str) -> Result<String> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage::system(self.config.system_prompt.clone()),
                ChatMessage::user(user_text),
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        debug!("Sending request to completion API: {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to completion API")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("Completion API error ({}): {}", status, error_body);
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .context("Failed to parse completion API response")?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .context("No content in completion API response")
    }
}

#[async_trait]
impl Completer for CompletionClient {
    async fn reading(&self, user_text: &str) -> String {
        match self.chat(user_text).await {
            Ok(text) => text,
            Err(e) => {
                error!("Completion request failed: {:#}", e);
                FALLBACK_READING.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: String) -> LlmConfig {
        LlmConfig {
            api_key: "sk-test".to_string(),
            base_url,
            ..LlmConfig::default()
        }
    }

    fn completion_body(text: &str) -> serde_json::Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": text },
                "finish_reason": "stop"
            }]
        })
    }

    #[tokio::test]
    async fn test_chat_sends_prompt_and_returns_content() {
        let server = MockServer::start().await;
        let prompt = LlmConfig::default().system_prompt;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "gpt-3.5-turbo",
                "max_tokens": 100,
                "messages": [
                    { "role": "system", "content": prompt },
                    { "role": "user", "content": "Will I be lucky today?" }
                ]
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(completion_body("  Fortune smiles on you.  ")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = CompletionClient::new(config(server.uri()));
        let text = client.chat("Will I be lucky today?").await.unwrap();
        assert_eq!(text, "Fortune smiles on you.");
    }

    #[tokio::test]
    async fn test_request_carries_temperature() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("ok")))
            .mount(&server)
            .await;

        let client = CompletionClient::new(config(server.uri()));
        client.chat("hi").await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        let temperature = body["temperature"].as_f64().unwrap();
        assert!((temperature - 0.7).abs() < 1e-6);
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_chat_surfaces_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let client = CompletionClient::new(config(server.uri()));
        let err = client.chat("hello").await.unwrap_err().to_string();
        assert!(err.contains("500"));
    }

    #[tokio::test]
    async fn test_reading_falls_back_on_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = CompletionClient::new(config(server.uri()));
        assert_eq!(client.reading("hello").await, FALLBACK_READING);
    }

    #[tokio::test]
    async fn test_reading_falls_back_on_empty_choices() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
            .mount(&server)
            .await;

        let client = CompletionClient::new(config(server.uri()));
        assert_eq!(client.reading("hello").await, FALLBACK_READING);
    }

    #[tokio::test]
    async fn test_reading_falls_back_on_network_error() {
        // Nothing listens on port 9 locally; the connection is refused.
        let client = CompletionClient::new(config("http://127.0.0.1:9".to_string()));
        assert_eq!(client.reading("hello").await, FALLBACK_READING);
    }
}
