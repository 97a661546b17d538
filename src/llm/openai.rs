//! OpenAI-compatible chat adapter.
//!
//! One client covers three deployments that share the `/v1/chat/completions` shape: the
//! hosted OpenAI API, a local LM Studio server, and AWS Bedrock's OpenAI-compatible
//! endpoint (bearer API key, regional base URL).

use crate::config::get_config;
use crate::llm::{ChatClient, ChatRequest, ChatResponse, LlmError, Role};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_LMSTUDIO_URL: &str = "http://127.0.0.1:1234";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Chat client for OpenAI-compatible `/v1/chat/completions` endpoints.
pub struct OpenAiChatClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiChatClient {
    /// Build a client for the hosted OpenAI API.
    pub fn for_openai() -> Result<Self, LlmError> {
        let config = get_config();
        let api_key = config
            .openai_api_key
            .clone()
            .ok_or_else(|| LlmError::Configuration("OPENAI_API_KEY is not configured".into()))?;
        let base_url = config
            .openai_base_url
            .clone()
            .unwrap_or_else(|| OPENAI_BASE_URL.to_string());
        Self::with_endpoint(base_url, Some(api_key))
    }

    /// Build a client for a local LM Studio server.
    pub fn for_lmstudio() -> Result<Self, LlmError> {
        let base_url = get_config()
            .lmstudio_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_LMSTUDIO_URL.to_string());
        Self::with_endpoint(base_url, None)
    }

    /// Build a client for Bedrock's OpenAI-compatible endpoint.
    pub fn for_bedrock() -> Result<Self, LlmError> {
        let config = get_config();
        let api_key = config
            .bedrock_api_key
            .clone()
            .ok_or_else(|| LlmError::Configuration("BEDROCK_API_KEY is not configured".into()))?;
        let region = config
            .bedrock_region
            .clone()
            .ok_or_else(|| LlmError::Configuration("BEDROCK_REGION is not configured".into()))?;
        let base_url = format!("https://bedrock-runtime.{region}.amazonaws.com/openai");
        Self::with_endpoint(base_url, Some(api_key))
    }

    /// Build a client against an explicit endpoint (used by tests).
    pub fn with_endpoint(base_url: String, api_key: Option<String>) -> Result<Self, LlmError> {
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
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

#[async_trait]
impl ChatClient for OpenAiChatClient {
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

        let mut http_request = self.http.post(self.endpoint()).json(&json!({
            "model": model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        }));
        if let Some(key) = &self.api_key {
            http_request = http_request.bearer_auth(key);
        }

        let response = http_request.send().await.map_err(|error| {
            LlmError::Transport(format!(
                "failed to reach chat endpoint {}: {error}",
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

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|error| LlmError::InvalidResponse(error.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("completion carried no content".into()))?;

        let (prompt_tokens, completion_tokens) = parsed
            .usage
            .map(|usage| (usage.prompt_tokens, usage.completion_tokens))
            .unwrap_or((None, None));

        Ok(ChatResponse {
            content,
            prompt_tokens,
            completion_tokens,
        })
    }
}
