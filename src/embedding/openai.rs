//! OpenAI-compatible embedding adapter.
//!
//! Covers the hosted OpenAI API and LM Studio, which both expose the `/v1/embeddings`
//! shape. Responses carry an `index` per datum; missing indices are reported as per-item
//! failures rather than failing the batch.

use crate::config::get_config;
use crate::embedding::{
    EmbeddingClient, EmbeddingError, EmbeddingFailure, EmbeddingOutcome, EmbeddingVector,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_LMSTUDIO_URL: &str = "http://127.0.0.1:1234";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Embedding client for OpenAI-compatible `/v1/embeddings` endpoints.
pub struct OpenAiEmbeddingClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiEmbeddingClient {
    /// Build a client for the hosted OpenAI API.
    pub fn for_openai() -> Result<Self, EmbeddingError> {
        let config = get_config();
        let api_key = config.openai_api_key.clone().ok_or_else(|| {
            EmbeddingError::Configuration("OPENAI_API_KEY is not configured".into())
        })?;
        let base_url = config
            .openai_base_url
            .clone()
            .unwrap_or_else(|| OPENAI_BASE_URL.to_string());
        Self::with_endpoint(base_url, Some(api_key))
    }

    /// Build a client for a local LM Studio server (no credentials).
    pub fn for_lmstudio() -> Result<Self, EmbeddingError> {
        let base_url = get_config()
            .lmstudio_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_LMSTUDIO_URL.to_string());
        Self::with_endpoint(base_url, None)
    }

    /// Build a client against an explicit endpoint (used by tests).
    pub fn with_endpoint(
        base_url: String,
        api_key: Option<String>,
    ) -> Result<Self, EmbeddingError> {
        let http = Client::builder()
            .user_agent("archon/embed")
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| EmbeddingError::Configuration(error.to_string()))?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbeddingClient {
    async fn embed_batch(
        &self,
        texts: &[String],
        model: &str,
    ) -> Result<EmbeddingOutcome, EmbeddingError> {
        if texts.is_empty() {
            return Ok(EmbeddingOutcome::default());
        }

        let mut request = self.http.post(self.endpoint()).json(&json!({
            "model": model,
            "input": texts,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|error| {
            EmbeddingError::Transport(format!(
                "failed to reach embedding endpoint {}: {error}",
                self.base_url
            ))
        })?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let body = response.text().await.unwrap_or_default();
                return Err(EmbeddingError::Auth(body));
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let body = response.text().await.unwrap_or_default();
                return Err(EmbeddingError::RateLimited(body));
            }
            status if status.is_server_error() => {
                let body = response.text().await.unwrap_or_default();
                return Err(EmbeddingError::Transport(format!("{status}: {body}")));
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                return Err(EmbeddingError::InvalidResponse(format!("{status}: {body}")));
            }
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|error| EmbeddingError::InvalidResponse(error.to_string()))?;

        let mut slots: Vec<Option<EmbeddingVector>> = vec![None; texts.len()];
        for datum in parsed.data {
            if datum.index >= slots.len() {
                tracing::warn!(index = datum.index, "Embedding index out of range; skipping");
                continue;
            }
            let dimension = datum.embedding.len();
            slots[datum.index] = Some(EmbeddingVector {
                values: datum.embedding,
                dimension,
            });
        }

        let failures = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| EmbeddingFailure::new(index, "no embedding returned for item"))
            .collect();

        Ok(EmbeddingOutcome {
            embeddings: slots,
            failures,
        })
    }
}
