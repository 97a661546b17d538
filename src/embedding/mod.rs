//! Batch embedding client abstraction and adapters.
//!
//! The pipeline embeds chunks through a pluggable [`EmbeddingClient`]. The canonical
//! contract is batch-in, batch-out with explicit per-item failure reporting: a partial
//! failure never raises, it shows up in [`EmbeddingOutcome::failures`] with a redacted
//! message, so one poisoned chunk cannot sink a whole batch. Whole-call errors (transport,
//! auth, rate limiting) do raise and are retried by [`embed_batch_with_retry`].
//!
//! Adapters are hand-rolled reqwest clients, one per provider family: Ollama's `/api/embed`
//! and the OpenAI-compatible `/v1/embeddings` shape (OpenAI, LM Studio).

mod ollama;
mod openai;

pub use ollama::OllamaEmbeddingClient;
pub use openai::OpenAiEmbeddingClient;

use crate::config::{ProviderKind, get_config};
use crate::errors::redact_secrets;
use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by embedding providers for whole-call failures.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Provider cannot be built from the current configuration.
    #[error("Embedding provider misconfigured: {0}")]
    Configuration(String),
    /// Provider rejected the configured credentials.
    #[error("Embedding provider rejected credentials: {0}")]
    Auth(String),
    /// Provider asked us to slow down (HTTP 429).
    #[error("Embedding provider rate limited: {0}")]
    RateLimited(String),
    /// Network-level failure or 5xx; retryable.
    #[error("Embedding transport failed: {0}")]
    Transport(String),
    /// Provider answered with something we could not use.
    #[error("Embedding provider returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// One successfully embedded item.
#[derive(Debug, Clone)]
pub struct EmbeddingVector {
    /// The embedding values.
    pub values: Vec<f32>,
    /// Width of the vector, as reported by the provider.
    pub dimension: usize,
}

/// A per-index failure inside an otherwise successful batch.
#[derive(Debug, Clone)]
pub struct EmbeddingFailure {
    /// Index of the failed input within the batch.
    pub index: usize,
    /// Redacted description of the failure.
    pub error: String,
}

impl EmbeddingFailure {
    /// Build a failure record, redacting key-shaped substrings up front.
    pub fn new(index: usize, error: &str) -> Self {
        Self {
            index,
            error: redact_secrets(error),
        }
    }
}

/// Result of one batch call: a slot per input plus the failure list.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingOutcome {
    /// Parallel to the input texts; `None` where the item failed.
    pub embeddings: Vec<Option<EmbeddingVector>>,
    /// Per-index failures with redacted messages.
    pub failures: Vec<EmbeddingFailure>,
}

/// Interface implemented by embedding backends.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed a batch of texts with the given model.
    ///
    /// Implementations must not raise on partial failure; individual items are reported in
    /// the outcome while the call succeeds.
    async fn embed_batch(
        &self,
        texts: &[String],
        model: &str,
    ) -> Result<EmbeddingOutcome, EmbeddingError>;

    /// Discover the vector width the model produces by embedding a probe string.
    async fn discover_dimension(&self, model: &str) -> Result<usize, EmbeddingError> {
        let probe = ["dimension probe".to_string()];
        let outcome = self.embed_batch(&probe, model).await?;
        outcome
            .embeddings
            .first()
            .and_then(|slot| slot.as_ref())
            .map(|vector| vector.dimension)
            .ok_or_else(|| {
                EmbeddingError::InvalidResponse("probe embedding was not returned".into())
            })
    }
}

/// Build an embedding client for the configured provider.
pub fn get_embedding_client() -> Result<Box<dyn EmbeddingClient>, EmbeddingError> {
    let config = get_config();
    match config.embedding_provider {
        ProviderKind::Ollama => Ok(Box::new(OllamaEmbeddingClient::from_config()?)),
        ProviderKind::OpenAI => Ok(Box::new(OpenAiEmbeddingClient::for_openai()?)),
        ProviderKind::LMStudio => Ok(Box::new(OpenAiEmbeddingClient::for_lmstudio()?)),
        other => Err(EmbeddingError::Configuration(format!(
            "provider '{}' cannot produce embeddings",
            other.as_str()
        ))),
    }
}

/// Embed one batch, retrying the full batch once on transport error.
///
/// Rate limiting and auth failures are not retried here; the caller decides whether to back
/// off or mark the operation failed.
pub async fn embed_batch_with_retry(
    client: &dyn EmbeddingClient,
    texts: &[String],
    model: &str,
) -> Result<EmbeddingOutcome, EmbeddingError> {
    match client.embed_batch(texts, model).await {
        Err(EmbeddingError::Transport(first)) => {
            tracing::warn!(error = %first, "Embedding batch transport failure; retrying once");
            client.embed_batch(texts, model).await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyClient {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingClient for FlakyClient {
        async fn embed_batch(
            &self,
            texts: &[String],
            _model: &str,
        ) -> Result<EmbeddingOutcome, EmbeddingError> {
            let call = self
                .calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if call == 0 {
                return Err(EmbeddingError::Transport("connection reset".into()));
            }
            Ok(EmbeddingOutcome {
                embeddings: texts
                    .iter()
                    .map(|_| {
                        Some(EmbeddingVector {
                            values: vec![0.1; 768],
                            dimension: 768,
                        })
                    })
                    .collect(),
                failures: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn retry_recovers_from_transport_error() {
        let client = FlakyClient {
            calls: std::sync::atomic::AtomicUsize::new(0),
        };
        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let outcome = embed_batch_with_retry(&client, &texts, "test-model")
            .await
            .expect("second attempt succeeds");
        assert_eq!(outcome.embeddings.len(), 2);
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test]
    async fn rate_limits_are_not_retried() {
        struct RateLimited;
        #[async_trait]
        impl EmbeddingClient for RateLimited {
            async fn embed_batch(
                &self,
                _texts: &[String],
                _model: &str,
            ) -> Result<EmbeddingOutcome, EmbeddingError> {
                Err(EmbeddingError::RateLimited("slow down".into()))
            }
        }

        let error = embed_batch_with_retry(&RateLimited, &["a".to_string()], "m")
            .await
            .unwrap_err();
        assert!(matches!(error, EmbeddingError::RateLimited(_)));
    }

    #[test]
    fn failure_messages_are_redacted() {
        let failure = EmbeddingFailure::new(3, "bad key sk-abcdefghijklmnopqrstuvwxyz");
        assert!(failure.error.contains("[REDACTED]"));
    }
}
