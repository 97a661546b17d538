//! Anthropic chat adapter.
//!
//! Speaks the `/v1/messages` API with `x-api-key` and `anthropic-version` headers. The
//! canonical system prompt maps to the top-level `system` field rather than a message.

use crate::config::get_config;
use crate::llm::{ChatClient, ChatRequest, ChatResponse, LlmError, Role};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Chat client for the Anthropic Messages API.
pub struct AnthropicChatClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl AnthropicChatClient {
    /// Build a client from the process configuration.
    pub fn from_config() -> Result<Self, LlmError> {
        let api_key = get_config().anthropic_api_key.clone().ok_or_else(|| {
            LlmError::Configuration("ANTHROPIC_API_KEY is not configured".into())
        })?;
        Self::with_endpoint(ANTHROPIC_BASE_URL.to_string(), api_key)
    }

    /// Build a client against an explicit endpoint (used by tests).
    pub fn with_endpoint(base_url: String, api_key: String) -> Result<Self, LlmError> {
        let http = Client::builder()
            .user_agent("archon/chat")
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| LlmError::Configuration(error.to_string()))?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[async_trait]
impl ChatClient for AnthropicChatClient {
    async fn complete(
        &self,
        model: &str,
        request: &ChatRequest,
    ) -> Result<ChatResponse, LlmError> {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|message| {
                let role = match message.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                json!({ "role": role, "content": message.content })
            })
            .collect();

        let mut payload = json!({
            "model": model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if let Some(system) = &request.system {
            payload
                .as_object_mut()
                .expect("payload should remain an object")
                .insert("system".into(), json!(system));
        }

        let response = self
            .http
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                LlmError::Transport(format!(
                    "failed to reach Anthropic at {}: {error}",
                    self.base_url
                ))
            })?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let body = response.text().await.unwrap_or_default();
                return Err(LlmError::Auth(body));
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let body = response.text().await.unwrap_or_default();
                return Err(LlmError::RateLimited(body));
            }
            status if status.is_server_error() => {
                let body = response.text().await.unwrap_or_default();
                return Err(LlmError::Transport(format!("{status}: {body}")));
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                return Err(LlmError::InvalidResponse(format!("{status}: {body}")));
            }
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|error| LlmError::InvalidResponse(error.to_string()))?;

        let content: String = parsed
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");
        if content.is_empty() {
            return Err(LlmError::InvalidResponse(
                "reply carried no text blocks".into(),
            ));
        }

        let (prompt_tokens, completion_tokens) = parsed
            .usage
            .map(|usage| (usage.input_tokens, usage.output_tokens))
            .unwrap_or((None, None));

        Ok(ChatResponse {
            content,
            prompt_tokens,
            completion_tokens,
        })
    }
}
