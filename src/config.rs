//! Environment-driven configuration for Archon.
//!
//! This module loads and validates settings once at startup (via `init_config`) and exposes
//! a global, read-only view through `get_config`. The configuration powers the HTTP API, the
//! ingestion pipeline and the JSON-RPC tool bridge and includes:
//!
//! - Store connectivity (`STORE_URL`, `STORE_SERVICE_KEY?`, `QDRANT_URL?`, `QDRANT_API_KEY?`).
//! - Provider selection (`LLM_PROVIDER`, `EMBEDDING_PROVIDER`, `EMBEDDING_MODEL`,
//!   `RAG_AGENT_MODEL?`) plus per-provider credentials (`OLLAMA_BASE_URL?`, `OPENAI_API_KEY?`,
//!   `ANTHROPIC_API_KEY?`, `BEDROCK_API_KEY?`/`BEDROCK_REGION?`, `LMSTUDIO_BASE_URL?`).
//! - Pipeline tuning (`EMBEDDING_BATCH_SIZE`, `CHUNK_SIZE?`, `CODE_MIN_LENGTH?`,
//!   `CONCURRENT_CRAWL_LIMIT?`, `USE_CONTEXTUAL_EMBEDDINGS?`).
//! - Search capabilities (`USE_HYBRID_SEARCH?`, `USE_RERANKING?`, `RERANKER_URL?`,
//!   `MAX_PAGE_CHARS?`).
//! - Server surface (`SERVER_PORT?`, `ALLOWED_ORIGINS`, `API_TOKEN`,
//!   `MCP_SESSION_TIMEOUT_SECONDS?`, `ENCRYPTION_KEY`).
//!
//! Most fields are optional with sensible defaults; invalid combinations are flagged early with
//! descriptive errors so misconfiguration is easy to diagnose. `ENCRYPTION_KEY` is mandatory:
//! the credential store cannot operate without it, so startup fails fast when it is missing.

use serde::Deserialize;
use std::env;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Bounds applied to `EMBEDDING_BATCH_SIZE`.
const MIN_EMBEDDING_BATCH: usize = 20;
/// Upper bound applied to `EMBEDDING_BATCH_SIZE`.
const MAX_EMBEDDING_BATCH: usize = 200;

/// Runtime configuration for the Archon server.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Base URL of the columnar SQL store's REST surface.
    pub store_url: String,
    /// Optional service key sent to the store on every request.
    pub store_service_key: Option<String>,
    /// Optional base URL of a Qdrant instance (alternative vector backend).
    pub qdrant_url: Option<String>,
    /// Optional API key required to access Qdrant.
    pub qdrant_api_key: Option<String>,
    /// Chat-completion provider used for enrichment and summaries.
    pub llm_provider: ProviderKind,
    /// Embedding provider used to vectorise chunks and queries.
    pub embedding_provider: ProviderKind,
    /// Embedding model identifier passed to the provider.
    pub embedding_model: String,
    /// Batch size for embedding requests, clamped to `[20, 200]`.
    pub embedding_batch_size: usize,
    /// Optional chat model override for agent-facing summaries.
    pub rag_agent_model: Option<String>,
    /// Base URL of the Ollama runtime (chat and embeddings).
    pub ollama_base_url: Option<String>,
    /// OpenAI API key.
    pub openai_api_key: Option<String>,
    /// Optional OpenAI-compatible base URL override.
    pub openai_base_url: Option<String>,
    /// Anthropic API key.
    pub anthropic_api_key: Option<String>,
    /// Bedrock API key (bearer auth on the OpenAI-compatible endpoint).
    pub bedrock_api_key: Option<String>,
    /// AWS region hosting the Bedrock runtime.
    pub bedrock_region: Option<String>,
    /// Base URL of an LM Studio server.
    pub lmstudio_base_url: Option<String>,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
    /// Origins allowed by CORS; `*` is rejected because credentials are enabled.
    pub allowed_origins: Vec<String>,
    /// Bearer token required on every API call.
    pub api_token: String,
    /// Key protecting persisted credentials; startup fails without it.
    pub encryption_key: String,
    /// Page bodies above this many characters are placeholder-replaced in responses.
    pub max_page_chars: usize,
    /// Maximum simultaneous ingest jobs.
    pub concurrent_crawl_limit: usize,
    /// Idle timeout for tool-bridge sessions, in seconds.
    pub session_timeout_seconds: u64,
    /// Target chunk size in characters for the markdown chunker.
    pub chunk_size: usize,
    /// Minimum length for stored code examples, in characters.
    pub code_min_length: usize,
    /// Prepend an AI-generated page summary to each chunk before embedding.
    pub use_contextual_embeddings: bool,
    /// Combine keyword matches with vector similarity at query time.
    pub use_hybrid_search: bool,
    /// Re-order top candidates with an external cross-encoder.
    pub use_reranking: bool,
    /// Base URL of the cross-encoder scoring service.
    pub reranker_url: Option<String>,
}

/// Model providers understood by the chat and embedding adapters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local Ollama runtime.
    Ollama,
    /// Hosted OpenAI API.
    OpenAI,
    /// Hosted Anthropic API.
    Anthropic,
    /// AWS Bedrock runtime (OpenAI-compatible endpoint).
    Bedrock,
    /// Local LM Studio server (OpenAI-compatible endpoint).
    LMStudio,
}

impl ProviderKind {
    /// Stable lowercase label used in logs and stored metadata.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::Bedrock => "bedrock",
            Self::LMStudio => "lmstudio",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAI),
            "anthropic" => Ok(Self::Anthropic),
            "bedrock" => Ok(Self::Bedrock),
            "lmstudio" | "lm_studio" => Ok(Self::LMStudio),
            _ => Err(()),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let allowed_origins = parse_allowed_origins(&load_env("ALLOWED_ORIGINS")?)?;

        let embedding_batch_size = load_usize_with_default("EMBEDDING_BATCH_SIZE", 100)?
            .clamp(MIN_EMBEDDING_BATCH, MAX_EMBEDDING_BATCH);

        let max_page_chars = load_usize_with_default("MAX_PAGE_CHARS", 20_000)?;
        let concurrent_crawl_limit = load_usize_with_default("CONCURRENT_CRAWL_LIMIT", 3)?;
        if concurrent_crawl_limit == 0 {
            return Err(ConfigError::InvalidValue(
                "CONCURRENT_CRAWL_LIMIT must be at least 1".into(),
            ));
        }

        let chunk_size = load_usize_with_default("CHUNK_SIZE", 5_000)?;
        if chunk_size == 0 {
            return Err(ConfigError::InvalidValue(
                "CHUNK_SIZE must be at least 1".into(),
            ));
        }

        Ok(Self {
            store_url: load_env("STORE_URL")?,
            store_service_key: load_env_optional("STORE_SERVICE_KEY"),
            qdrant_url: load_env_optional("QDRANT_URL"),
            qdrant_api_key: load_env_optional("QDRANT_API_KEY"),
            llm_provider: load_env("LLM_PROVIDER")?
                .parse()
                .map_err(|()| ConfigError::InvalidValue("LLM_PROVIDER".into()))?,
            embedding_provider: load_env("EMBEDDING_PROVIDER")?
                .parse()
                .map_err(|()| ConfigError::InvalidValue("EMBEDDING_PROVIDER".into()))?,
            embedding_model: load_env("EMBEDDING_MODEL")?,
            embedding_batch_size,
            rag_agent_model: load_env_optional("RAG_AGENT_MODEL"),
            ollama_base_url: load_env_optional("OLLAMA_BASE_URL"),
            openai_api_key: load_env_optional("OPENAI_API_KEY"),
            openai_base_url: load_env_optional("OPENAI_BASE_URL"),
            anthropic_api_key: load_env_optional("ANTHROPIC_API_KEY"),
            bedrock_api_key: load_env_optional("BEDROCK_API_KEY"),
            bedrock_region: load_env_optional("BEDROCK_REGION"),
            lmstudio_base_url: load_env_optional("LMSTUDIO_BASE_URL"),
            server_port: load_env_optional("SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?,
            allowed_origins,
            api_token: load_env("API_TOKEN")?,
            encryption_key: load_env("ENCRYPTION_KEY")?,
            max_page_chars,
            concurrent_crawl_limit,
            session_timeout_seconds: load_u64_with_default("MCP_SESSION_TIMEOUT_SECONDS", 3_600)?,
            chunk_size,
            code_min_length: load_usize_with_default("CODE_MIN_LENGTH", 250)?,
            use_contextual_embeddings: load_bool_with_default("USE_CONTEXTUAL_EMBEDDINGS", false)?,
            use_hybrid_search: load_bool_with_default("USE_HYBRID_SEARCH", false)?,
            use_reranking: load_bool_with_default("USE_RERANKING", false)?,
            reranker_url: load_env_optional("RERANKER_URL"),
        })
    }
}

/// Split and validate the `ALLOWED_ORIGINS` list.
///
/// Credentials are always enabled on the API surface, so a wildcard origin would let any
/// site replay the bearer token; the combination is rejected outright.
fn parse_allowed_origins(raw: &str) -> Result<Vec<String>, ConfigError> {
    let origins: Vec<String> = raw
        .split(',')
        .map(|origin| origin.trim().to_string())
        .filter(|origin| !origin.is_empty())
        .collect();

    if origins.is_empty() {
        return Err(ConfigError::InvalidValue(
            "ALLOWED_ORIGINS must list at least one origin".into(),
        ));
    }
    if origins.iter().any(|origin| origin == "*") {
        return Err(ConfigError::InvalidValue(
            "ALLOWED_ORIGINS must not be '*' while credentials are enabled".into(),
        ));
    }
    Ok(origins)
}

fn load_usize_with_default(key: &str, default: usize) -> Result<usize, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

fn load_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

fn load_bool_with_default(key: &str, default: bool) -> Result<bool, ConfigError> {
    match load_env_optional(key) {
        Some(value) => match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue(key.to_string())),
        },
        None => Ok(default),
    }
}

fn load_env(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingVariable(key.to_string()))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() {
    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("Failed to load config from environment");
    tracing::debug!(
        store_url = %config.store_url,
        qdrant_url = ?config.qdrant_url,
        llm_provider = ?config.llm_provider,
        embedding_provider = ?config.embedding_provider,
        embedding_model = %config.embedding_model,
        embedding_batch_size = config.embedding_batch_size,
        concurrent_crawl_limit = config.concurrent_crawl_limit,
        max_page_chars = config.max_page_chars,
        session_timeout_seconds = config.session_timeout_seconds,
        use_contextual_embeddings = config.use_contextual_embeddings,
        use_hybrid_search = config.use_hybrid_search,
        use_reranking = config.use_reranking,
        "Loaded configuration"
    );
    CONFIG.set(config).expect("Failed to set config");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_origins_rejects_wildcard() {
        let error = parse_allowed_origins("*").unwrap_err();
        assert!(matches!(error, ConfigError::InvalidValue(_)));

        let error = parse_allowed_origins("https://app.example.com, *").unwrap_err();
        assert!(matches!(error, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn allowed_origins_splits_and_trims() {
        let origins =
            parse_allowed_origins(" https://app.example.com , http://localhost:3737 ").unwrap();
        assert_eq!(
            origins,
            vec![
                "https://app.example.com".to_string(),
                "http://localhost:3737".to_string()
            ]
        );
    }

    #[test]
    fn provider_kind_parses_known_names() {
        assert_eq!("ollama".parse::<ProviderKind>(), Ok(ProviderKind::Ollama));
        assert_eq!("OpenAI".parse::<ProviderKind>(), Ok(ProviderKind::OpenAI));
        assert_eq!(
            "lm_studio".parse::<ProviderKind>(),
            Ok(ProviderKind::LMStudio)
        );
        assert!("mystery".parse::<ProviderKind>().is_err());
    }
}
