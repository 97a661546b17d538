//! Vendor-neutral error kinds shared across the API surface.
//!
//! Component modules raise their own `thiserror` enums; at the HTTP and RPC boundary those
//! collapse into [`ApiError`], which controls the status code and the externally visible
//! message. Internal failures are logged with a correlation id and surfaced without detail.
//! Every message that could embed a provider response passes through [`redact_secrets`]
//! before it is logged or returned.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Boundary error emitted by HTTP handlers and RPC methods.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Bad input: malformed body, dangerous URL, invalid glob pattern.
    #[error("{0}")]
    Validation(String),
    /// The requested record does not exist.
    #[error("{0}")]
    NotFound(String),
    /// Bearer token missing or mismatched.
    #[error("Unauthorized")]
    Unauthorized,
    /// Provider rejected the configured credentials.
    #[error("Provider authentication failed: {0}")]
    ProviderAuth(String),
    /// A conflicting operation is already running.
    #[error("{0}")]
    Conflict(String),
    /// The backing store failed after its retry budget.
    #[error("Store request failed: {0}")]
    Store(String),
    /// Anything unexpected; details stay in the logs.
    #[error("Internal error")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::ProviderAuth(_) => StatusCode::BAD_GATEWAY,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Store(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Internal(detail) => {
                let correlation_id = Uuid::new_v4();
                tracing::error!(
                    %correlation_id,
                    detail = %redact_secrets(detail),
                    "Internal error"
                );
                json!({
                    "error": "Internal error",
                    "correlation_id": correlation_id.to_string(),
                })
            }
            other => json!({ "error": redact_secrets(&other.to_string()) }),
        };
        (status, Json(body)).into_response()
    }
}

/// API-key prefixes that mark the start of a secret-shaped token.
const KEY_PREFIXES: [&str; 6] = ["sk-ant-", "sk-proj-", "sk-or-", "sk-", "AKIA", "gsk_"];

/// Minimum run of key-body characters after a prefix before we treat it as a secret.
const MIN_KEY_BODY: usize = 20;

/// Replace API-key-shaped substrings with `[REDACTED]`.
///
/// A secret is a known provider prefix followed by at least twenty key-body characters
/// (alphanumerics, `-` or `_`). Shorter runs are left alone so ordinary words that happen
/// to start with `sk-` survive.
pub fn redact_secrets(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut output = String::with_capacity(input.len());
    let mut index = 0;

    'outer: while index < bytes.len() {
        for prefix in KEY_PREFIXES {
            if input[index..].starts_with(prefix) {
                let body_start = index + prefix.len();
                let body_len = input[body_start..]
                    .bytes()
                    .take_while(|byte| byte.is_ascii_alphanumeric() || *byte == b'-' || *byte == b'_')
                    .count();
                if body_len >= MIN_KEY_BODY {
                    output.push_str("[REDACTED]");
                    index = body_start + body_len;
                    continue 'outer;
                }
            }
        }
        // Advance one full character, not one byte.
        let ch = input[index..].chars().next().expect("index on char boundary");
        output.push(ch);
        index += ch.len_utf8();
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_openai_style_keys() {
        let message = "401 from provider: invalid key sk-proj-abcdefghijklmnopqrstuvwx supplied";
        let cleaned = redact_secrets(message);
        assert!(cleaned.contains("[REDACTED]"));
        assert!(!cleaned.contains("abcdefghijklmnopqrstuvwx"));
    }

    #[test]
    fn redacts_anthropic_style_keys() {
        let message = "x-api-key sk-ant-REDACTED rejected";
        let cleaned = redact_secrets(message);
        assert_eq!(cleaned, "x-api-key [REDACTED] rejected");
    }

    #[test]
    fn leaves_short_tokens_alone() {
        let message = "the sk-latest flag is unrelated";
        assert_eq!(redact_secrets(message), message);
    }

    #[test]
    fn handles_multiple_secrets() {
        let message = "first sk-aaaaaaaaaaaaaaaaaaaaaaaa then sk-bbbbbbbbbbbbbbbbbbbbbbbb";
        let cleaned = redact_secrets(message);
        assert_eq!(cleaned.matches("[REDACTED]").count(), 2);
    }
}
