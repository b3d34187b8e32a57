//! The downstream chat-completion call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("Completion API returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("Completion request failed: {0}")]
    Transport(String),
    #[error("Malformed completion response: {0}")]
    MalformedResponse(String),
}

impl From<reqwest::Error> for CompletionError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Sends a prompt to a language model and returns the JSON document it answered with.
#[async_trait(?Send)]
pub trait CompletionClient {
    async fn complete(&self, prompt: &str) -> Result<serde_json::Value, CompletionError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// A [CompletionClient] for OpenAI compatible `/chat/completions` endpoints.
#[derive(Clone)]
pub struct ChatCompletionClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    system_prompt: Option<String>,
    temperature: f32,
}

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

impl ChatCompletionClient {
    pub fn builder(api_key: &str) -> ChatCompletionClientBuilder {
        ChatCompletionClientBuilder {
            base_url: DEFAULT_BASE_URL.to_owned(),
            api_key: api_key.to_owned(),
            model: DEFAULT_MODEL.to_owned(),
            system_prompt: None,
            temperature: 0.7,
            timeout: None,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait(?Send)]
impl CompletionClient for ChatCompletionClient {
    async fn complete(&self, prompt: &str) -> Result<serde_json::Value, CompletionError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system_prompt {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            log::warn!("Completion API responded with {status}");
            return Err(upstream_error(status.as_u16(), response.text().await));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::MalformedResponse(e.to_string()))?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CompletionError::MalformedResponse("no content".to_string()))?;
        parse_content(&content)
    }
}

pub struct ChatCompletionClientBuilder {
    base_url: String,
    api_key: String,
    model: String,
    system_prompt: Option<String>,
    temperature: f32,
    timeout: Option<Duration>,
}

impl ChatCompletionClientBuilder {
    pub fn base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_owned();
        self
    }

    pub fn model(mut self, model: &str) -> Self {
        self.model = model.to_owned();
        self
    }

    /// Instructions sent ahead of every prompt.
    pub fn system_prompt(mut self, system_prompt: Option<&str>) -> Self {
        self.system_prompt = system_prompt.map(ToOwned::to_owned);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Give up on the downstream call after this long. Not retried.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ChatCompletionClient, CompletionError> {
        let mut client = reqwest::Client::builder();
        if let Some(timeout) = self.timeout {
            client = client.timeout(timeout);
        }
        Ok(ChatCompletionClient {
            client: client.build()?,
            base_url: self.base_url,
            api_key: self.api_key,
            model: self.model,
            system_prompt: self.system_prompt,
            temperature: self.temperature,
        })
    }
}

/// A [CompletionError::Upstream] carrying the error body, or the reason it could not be read.
fn upstream_error<E: std::fmt::Display>(status: u16, body: Result<String, E>) -> CompletionError {
    let body = body.unwrap_or_else(|e| {
        log::warn!("Unable to read the {status} response body: {e}");
        format!("unreadable response body: {e}")
    });
    CompletionError::Upstream { status, body }
}

/// Strip a surrounding markdown code fence, if there is one.
///
/// Models often answer with ```` ```json ... ``` ```` even when asked for bare JSON.
pub fn extract_json(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let after = &trimmed[start + 3..];
    // Skip the info string, e.g. `json`
    let body = match after.find('\n') {
        Some(newline) => &after[newline + 1..],
        None => after,
    };
    match body.rfind("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

fn parse_content(content: &str) -> Result<serde_json::Value, CompletionError> {
    serde_json::from_str(extract_json(content))
        .map_err(|e| CompletionError::MalformedResponse(format!("content is not JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_json() {
        assert_eq!(extract_json(r#" {"a": 1} "#), r#"{"a": 1}"#);
        assert_eq!(extract_json("```json\n{\"a\": 1}\n```"), r#"{"a": 1}"#);
        assert_eq!(extract_json("```\n[1, 2]\n```\n"), "[1, 2]");
        assert_eq!(
            extract_json("Here you go:\n```json\n{\"a\": 1}\n```\nAnything else?"),
            r#"{"a": 1}"#
        );
        // Unterminated fence
        assert_eq!(extract_json("```json\n{\"a\": 1}"), r#"{"a": 1}"#);
    }

    #[test]
    fn test_parse_content() {
        assert_eq!(
            parse_content("```json\n{\"skinType\": \"dry\"}\n```").unwrap(),
            json!({"skinType": "dry"})
        );
        assert!(matches!(
            parse_content("I cannot help with that."),
            Err(CompletionError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_upstream_error_body() {
        let err = upstream_error::<String>(429, Ok("slow down".to_string()));
        assert!(matches!(
            err,
            CompletionError::Upstream { status: 429, ref body } if body == "slow down"
        ));

        let err = upstream_error(502, Err("connection reset"));
        match err {
            CompletionError::Upstream { status, body } => {
                assert_eq!(status, 502);
                assert_eq!(body, "unreadable response body: connection reset");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_endpoint() {
        let client = ChatCompletionClient::builder("key")
            .base_url("http://localhost:9000/v1/")
            .build()
            .unwrap();
        assert_eq!(client.endpoint(), "http://localhost:9000/v1/chat/completions");
    }

    #[test]
    fn test_request_body() {
        let request = ChatRequest {
            model: "m",
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "be brief",
                },
                ChatMessage {
                    role: "user",
                    content: "hi",
                },
            ],
            temperature: 0.5,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "model": "m",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hi"}
                ],
                "temperature": 0.5
            })
        );
    }

    #[test]
    fn test_response_body() {
        let body: ChatResponse = serde_json::from_value(json!({
            "id": "x",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "{}"}}]
        }))
        .unwrap();
        assert_eq!(body.choices[0].message.content.as_deref(), Some("{}"));
    }
}
