//! Ollama embedding adapter.
//!
//! Talks to the Ollama runtime's `/api/embed` endpoint, which accepts a list of inputs and
//! returns the embeddings in order. Ollama does not report per-item errors, so an empty
//! vector in the response is translated into a per-index failure.

use crate::config::get_config;
use crate::embedding::{
    EmbeddingClient, EmbeddingError, EmbeddingFailure, EmbeddingOutcome, EmbeddingVector,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Embedding client backed by a local Ollama runtime.
pub struct OllamaEmbeddingClient {
    http: Client,
    base_url: String,
}

impl OllamaEmbeddingClient {
    /// Build a client from the process configuration.
    pub fn from_config() -> Result<Self, EmbeddingError> {
        let base_url = get_config()
            .ollama_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
        Self::with_base_url(base_url)
    }

    /// Build a client against an explicit runtime URL (used by tests).
    pub fn with_base_url(base_url: String) -> Result<Self, EmbeddingError> {
        let http = Client::builder()
            .user_agent("archon/embed")
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| EmbeddingError::Configuration(error.to_string()))?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/embed", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingClient for OllamaEmbeddingClient {
    async fn embed_batch(
        &self,
        texts: &[String],
        model: &str,
    ) -> Result<EmbeddingOutcome, EmbeddingError> {
        if texts.is_empty() {
            return Ok(EmbeddingOutcome::default());
        }

        let payload = json!({
            "model": model,
            "input": texts,
        });

        let response = self
            .http
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                EmbeddingError::Transport(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(EmbeddingError::Configuration(format!(
                    "model '{model}' is not available on the Ollama runtime"
                )));
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

        let parsed: OllamaEmbedResponse = response
            .json()
            .await
            .map_err(|error| EmbeddingError::InvalidResponse(error.to_string()))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }

        let mut outcome = EmbeddingOutcome::default();
        for (index, values) in parsed.embeddings.into_iter().enumerate() {
            if values.is_empty() {
                outcome
                    .failures
                    .push(EmbeddingFailure::new(index, "empty embedding returned"));
                outcome.embeddings.push(None);
            } else {
                let dimension = values.len();
                outcome
                    .embeddings
                    .push(Some(EmbeddingVector { values, dimension }));
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    #[tokio::test]
    async fn maps_embeddings_in_order() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(200).json_body(json!({
                    "embeddings": [[0.1, 0.2], [0.3, 0.4]]
                }));
            })
            .await;

        let client = OllamaEmbeddingClient::with_base_url(server.base_url()).expect("client");
        let outcome = client
            .embed_batch(&["alpha".into(), "beta".into()], "nomic-embed-text")
            .await
            .expect("batch");

        mock.assert();
        assert_eq!(outcome.embeddings.len(), 2);
        assert_eq!(outcome.embeddings[0].as_ref().unwrap().dimension, 2);
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test]
    async fn empty_vectors_become_item_failures() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(200).json_body(json!({
                    "embeddings": [[0.1, 0.2], []]
                }));
            })
            .await;

        let client = OllamaEmbeddingClient::with_base_url(server.base_url()).expect("client");
        let outcome = client
            .embed_batch(&["alpha".into(), "beta".into()], "nomic-embed-text")
            .await
            .expect("batch");

        assert!(outcome.embeddings[0].is_some());
        assert!(outcome.embeddings[1].is_none());
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].index, 1);
    }

    #[tokio::test]
    async fn unknown_model_is_a_configuration_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(404).body("model not found");
            })
            .await;

        let client = OllamaEmbeddingClient::with_base_url(server.base_url()).expect("client");
        let error = client
            .embed_batch(&["alpha".into()], "missing-model")
            .await
            .unwrap_err();
        assert!(matches!(error, EmbeddingError::Configuration(_)));
    }
}
