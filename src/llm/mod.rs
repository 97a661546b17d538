//! Chat-completion client abstraction and adapters.
//!
//! The pipeline uses chat completions for two things only: a short contextual prefix per
//! chunk (flag-gated) and one summary per source. Both are best-effort; callers fall back
//! to templated text when the provider misbehaves, so every adapter surfaces failures as
//! values instead of panicking.
//!
//! One canonical request shape (`system`, `messages`, `max_tokens`, `temperature`) is
//! translated by each adapter to its vendor's native API: Ollama `/api/chat`, the
//! OpenAI-compatible `/v1/chat/completions` family (OpenAI, LM Studio, Bedrock's
//! OpenAI-compatible endpoint), and Anthropic `/v1/messages`.

mod anthropic;
mod ollama;
mod openai;

pub use anthropic::AnthropicChatClient;
pub use ollama::OllamaChatClient;
pub use openai::OpenAiChatClient;

use crate::config::{ProviderKind, get_config};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by chat providers.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Provider cannot be built from the current configuration.
    #[error("Chat provider misconfigured: {0}")]
    Configuration(String),
    /// Provider rejected the configured credentials.
    #[error("Chat provider rejected credentials: {0}")]
    Auth(String),
    /// Provider asked us to slow down (HTTP 429).
    #[error("Chat provider rate limited: {0}")]
    RateLimited(String),
    /// Network-level failure or 5xx; retryable.
    #[error("Chat transport failed: {0}")]
    Transport(String),
    /// Provider answered with something we could not use.
    #[error("Chat provider returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// Speaker of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// End-user content.
    User,
    /// Prior assistant content.
    Assistant,
}

/// One turn of the canonical conversation shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who produced the content.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Convenience constructor for a user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Canonical chat-completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Optional system prompt.
    pub system: Option<String>,
    /// Conversation turns, oldest first.
    pub messages: Vec<ChatMessage>,
    /// Completion token budget.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

/// Canonical chat-completion reply.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Assistant text.
    pub content: String,
    /// Tokens consumed by the prompt, when reported.
    pub prompt_tokens: Option<u64>,
    /// Tokens produced by the completion, when reported.
    pub completion_tokens: Option<u64>,
}

/// Interface implemented by chat backends.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Run one chat completion with the given model.
    async fn complete(&self, model: &str, request: &ChatRequest)
    -> Result<ChatResponse, LlmError>;
}

/// Build a chat client for the configured provider.
///
/// Missing credentials surface as a configuration error for the calling operation only;
/// they never abort the process.
pub fn get_chat_client() -> Result<Box<dyn ChatClient>, LlmError> {
    let config = get_config();
    match config.llm_provider {
        ProviderKind::Ollama => Ok(Box::new(OllamaChatClient::from_config()?)),
        ProviderKind::OpenAI => Ok(Box::new(OpenAiChatClient::for_openai()?)),
        ProviderKind::LMStudio => Ok(Box::new(OpenAiChatClient::for_lmstudio()?)),
        ProviderKind::Bedrock => Ok(Box::new(OpenAiChatClient::for_bedrock()?)),
        ProviderKind::Anthropic => Ok(Box::new(AnthropicChatClient::from_config()?)),
    }
}

/// Default chat model for the configured provider, honouring `RAG_AGENT_MODEL`.
pub fn default_chat_model() -> String {
    let config = get_config();
    if let Some(model) = &config.rag_agent_model {
        return model.clone();
    }
    match config.llm_provider {
        ProviderKind::Ollama => "llama3.1".to_string(),
        ProviderKind::OpenAI => "gpt-4o-mini".to_string(),
        ProviderKind::Anthropic => "claude-3-5-haiku-latest".to_string(),
        ProviderKind::Bedrock => "anthropic.claude-3-5-haiku-20241022-v1:0".to_string(),
        ProviderKind::LMStudio => "local-model".to_string(),
    }
}

/// Templated fallback used whenever summary generation fails or is unavailable.
pub fn fallback_source_summary(source_id: &str, pages_crawled: usize) -> String {
    format!("Documentation from {source_id} — {pages_crawled} pages crawled")
}

/// Prompt asking for a short summary of an entire source.
pub fn build_source_summary_prompt(title: &str, sample: &str) -> ChatRequest {
    ChatRequest {
        system: Some(
            "You summarise technical documentation collections in two or three sentences. \
             Mention the main technology and what a reader can learn. Reply with the summary \
             only."
                .to_string(),
        ),
        messages: vec![ChatMessage::user(format!(
            "Collection title: {title}\n\nRepresentative excerpt:\n{sample}"
        ))],
        max_tokens: 200,
        temperature: 0.2,
    }
}

/// Prompt asking for a one-line contextual prefix situating a chunk inside its page.
pub fn build_contextual_prefix_prompt(page_excerpt: &str, chunk: &str) -> ChatRequest {
    ChatRequest {
        system: Some(
            "Given a document and one chunk of it, write a single short sentence that \
             situates the chunk within the document for retrieval. Reply with the sentence \
             only."
                .to_string(),
        ),
        messages: vec![ChatMessage::user(format!(
            "<document>\n{page_excerpt}\n</document>\n<chunk>\n{chunk}\n</chunk>"
        ))],
        max_tokens: 80,
        temperature: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_summary_matches_template() {
        assert_eq!(
            fallback_source_summary("docs.example.com", 12),
            "Documentation from docs.example.com — 12 pages crawled"
        );
    }

    #[test]
    fn summary_prompt_carries_title_and_sample() {
        let request = build_source_summary_prompt("Example Docs", "Alpha beta");
        assert!(request.system.is_some());
        assert_eq!(request.messages.len(), 1);
        assert!(request.messages[0].content.contains("Example Docs"));
        assert!(request.messages[0].content.contains("Alpha beta"));
    }
}
