//! Ollama chat adapter.

use crate::config::get_config;
use crate::llm::{ChatClient, ChatRequest, ChatResponse, LlmError, Role};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Chat client backed by a local Ollama runtime.
pub struct OllamaChatClient {
    http: Client,
    base_url: String,
}

impl OllamaChatClient {
    /// Build a client from the process configuration.
    pub fn from_config() -> Result<Self, LlmError> {
        let base_url = get_config()
            .ollama_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
        Self::with_base_url(base_url)
    }

    /// Build a client against an explicit runtime URL (used by tests).
    pub fn with_base_url(base_url: String) -> Result<Self, LlmError> {
        let http = Client::builder()
            .user_agent("archon/chat")
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| LlmError::Configuration(error.to_string()))?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    content: String,
}

#[async_trait]
impl ChatClient for OllamaChatClient {
    async fn complete(
        &self,
        model: &str,
        request: &ChatRequest,
    ) -> Result<ChatResponse, LlmError> {
        let mut messages: Vec<Value> = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for message in &request.messages {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            messages.push(json!({ "role": role, "content": message.content }));
        }

        let payload = json!({
            "model": model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            }
        });

        let response = self
            .http
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                LlmError::Transport(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(LlmError::Configuration(format!(
                    "model '{model}' is not available on the Ollama runtime"
                )));
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

        let parsed: OllamaChatResponse = response
            .json()
            .await
            .map_err(|error| LlmError::InvalidResponse(error.to_string()))?;

        Ok(ChatResponse {
            content: parsed.message.content,
            prompt_tokens: parsed.prompt_eval_count,
            completion_tokens: parsed.eval_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;
    use httpmock::{Method::POST, MockServer};

    #[tokio::test]
    async fn system_prompt_is_prepended() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/chat")
                    .json_body_partial(
                        json!({
                            "messages": [
                                { "role": "system", "content": "be brief" },
                                { "role": "user", "content": "summarise" }
                            ]
                        })
                        .to_string(),
                    );
                then.status(200).json_body(json!({
                    "message": { "role": "assistant", "content": "short answer" },
                    "prompt_eval_count": 12,
                    "eval_count": 4
                }));
            })
            .await;

        let client = OllamaChatClient::with_base_url(server.base_url()).expect("client");
        let response = client
            .complete(
                "llama3.1",
                &ChatRequest {
                    system: Some("be brief".into()),
                    messages: vec![ChatMessage::user("summarise")],
                    max_tokens: 64,
                    temperature: 0.1,
                },
            )
            .await
            .expect("completion");

        mock.assert();
        assert_eq!(response.content, "short answer");
        assert_eq!(response.prompt_tokens, Some(12));
        assert_eq!(response.completion_tokens, Some(4));
    }
}
