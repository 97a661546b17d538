//! JSON-RPC 2.0 tool bridge for external AI clients.
//!
//! `POST /rpc` exposes a fixed tool vocabulary: RAG queries, code search, source listing,
//! and thin project/task/document CRUD. Every call is associated with a session id carried
//! in the `mcp-session-id` header; expired sessions are discarded and a fresh id is issued
//! on the response. Error objects use vendor-neutral JSON-RPC codes and never leak
//! internal exception detail.

use crate::api::AppState;
use crate::errors::redact_secrets;
use crate::search::{ReturnMode, SearchError, SearchRequest};
use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use uuid::Uuid;

/// Header carrying the tool session id in both directions.
pub const SESSION_HEADER: &str = "mcp-session-id";

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const SERVER_ERROR: i64 = -32000;

/// Handle one JSON-RPC request envelope.
pub async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let supplied_session = headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value).ok());
    // The idle sweep runs on every inbound request.
    let session_id = state.sessions.resolve(supplied_session).await;

    let reply = match serde_json::from_str::<Value>(&body) {
        Ok(request) => dispatch(&state, request).await,
        Err(_) => error_response(Value::Null, PARSE_ERROR, "Parse error"),
    };

    let mut response = axum::Json(reply).into_response();
    if let Ok(header_value) = HeaderValue::from_str(&session_id.to_string()) {
        response.headers_mut().insert(SESSION_HEADER, header_value);
    }
    response
}

async fn dispatch(state: &AppState, request: Value) -> Value {
    let id = request.get("id").cloned().unwrap_or(Value::Null);

    if request.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return error_response(id, INVALID_REQUEST, "Invalid request: jsonrpc must be \"2.0\"");
    }
    let Some(method) = request.get("method").and_then(Value::as_str) else {
        return error_response(id, INVALID_REQUEST, "Invalid request: method is required");
    };
    let params = request
        .get("params")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let result = match method {
        "perform_rag_query" => perform_rag_query(state, &params).await,
        "search_code_examples" => search_code_examples(state, &params).await,
        "get_available_sources" => get_available_sources(state).await,
        "manage_project" => manage_crud(state, "projects", &params).await,
        "manage_document" => manage_crud(state, "project_documents", &params).await,
        "manage_task" => manage_crud(state, "tasks", &params).await,
        other => {
            return error_response(id, METHOD_NOT_FOUND, &format!("Unknown tool: {other}"));
        }
    };

    match result {
        Ok(result) => json!({ "jsonrpc": "2.0", "result": result, "id": id }),
        Err(error) => error_response(id, error.code, &error.message),
    }
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: message.into(),
        }
    }

    fn server_error(detail: &str) -> Self {
        tracing::error!(detail = %redact_secrets(detail), "Tool call failed");
        Self {
            code: SERVER_ERROR,
            message: "Tool execution failed".to_string(),
        }
    }
}

impl From<SearchError> for RpcError {
    fn from(error: SearchError) -> Self {
        match error {
            SearchError::Validation(message) => Self::invalid_params(message),
            other => Self::server_error(&other.to_string()),
        }
    }
}

async fn perform_rag_query(
    state: &AppState,
    params: &Map<String, Value>,
) -> Result<Value, RpcError> {
    let query = required_str(params, "query")?;
    let response = state
        .search
        .search(SearchRequest {
            query,
            match_count: optional_count(params),
            source_filter: optional_str(params, "source").or_else(|| optional_str(params, "source_id")),
            return_mode: ReturnMode::Chunks,
        })
        .await?;
    serde_json::to_value(response).map_err(|error| RpcError::server_error(&error.to_string()))
}

async fn search_code_examples(
    state: &AppState,
    params: &Map<String, Value>,
) -> Result<Value, RpcError> {
    let query = required_str(params, "query")?;
    let response = state
        .search
        .search_code_examples(SearchRequest {
            query,
            match_count: optional_count(params),
            source_filter: optional_str(params, "source_id").or_else(|| optional_str(params, "source")),
            return_mode: ReturnMode::Chunks,
        })
        .await?;
    serde_json::to_value(response).map_err(|error| RpcError::server_error(&error.to_string()))
}

async fn get_available_sources(state: &AppState) -> Result<Value, RpcError> {
    let sources = state
        .store
        .list_sources()
        .await
        .map_err(|error| RpcError::server_error(&error.to_string()))?;
    let count = sources.len();
    Ok(json!({ "success": true, "sources": sources, "count": count }))
}

/// Thin CRUD over a collaborator table: `action` selects the verb, everything else is
/// passed through as row data or filters.
async fn manage_crud(
    state: &AppState,
    table: &str,
    params: &Map<String, Value>,
) -> Result<Value, RpcError> {
    let action = required_str(params, "action")?;
    let mut rest = params.clone();
    rest.remove("action");

    let outcome = match action.as_str() {
        "create" => {
            state
                .store
                .insert_row(table, &Value::Object(rest))
                .await
        }
        "list" => {
            let filters: Vec<(String, String)> = rest
                .iter()
                .filter_map(|(key, value)| {
                    value.as_str().map(|value| (key.clone(), value.to_string()))
                })
                .collect();
            state.store.list_rows(table, &filters).await
        }
        "update" => {
            let id = required_str(&rest, "id")?;
            rest.remove("id");
            state.store.update_row(table, &id, &Value::Object(rest)).await
        }
        "delete" => {
            let id = required_str(&rest, "id")?;
            state.store.delete_row(table, &id).await.map(|()| json!({ "deleted": id }))
        }
        other => {
            return Err(RpcError::invalid_params(format!(
                "unknown action '{other}'; expected create, list, update or delete"
            )));
        }
    };

    match outcome {
        Ok(result) => Ok(json!({ "success": true, "result": result })),
        Err(error) => Err(RpcError::server_error(&error.to_string())),
    }
}

fn required_str(params: &Map<String, Value>, key: &str) -> Result<String, RpcError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(|value| value.to_string())
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| RpcError::invalid_params(format!("'{key}' is required")))
}

fn optional_str(params: &Map<String, Value>, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(|value| value.to_string())
        .filter(|value| !value.trim().is_empty())
}

fn optional_count(params: &Map<String, Value>) -> Option<usize> {
    params
        .get("match_count")
        .and_then(Value::as_u64)
        .map(|value| value as usize)
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": { "code": code, "message": redact_secrets(message) },
        "id": id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_shape_is_json_rpc() {
        let reply = error_response(json!(7), METHOD_NOT_FOUND, "Unknown tool: frobnicate");
        assert_eq!(reply["jsonrpc"], "2.0");
        assert_eq!(reply["error"]["code"], json!(METHOD_NOT_FOUND));
        assert_eq!(reply["id"], json!(7));
        assert!(reply.get("result").is_none());
    }

    #[test]
    fn required_str_rejects_blank_values() {
        let mut params = Map::new();
        params.insert("query".into(), json!("   "));
        assert!(required_str(&params, "query").is_err());

        params.insert("query".into(), json!("docker compose"));
        assert_eq!(required_str(&params, "query").unwrap(), "docker compose");
    }

    #[test]
    fn error_messages_are_redacted() {
        let reply = error_response(
            Value::Null,
            SERVER_ERROR,
            "provider rejected sk-abcdefghijklmnopqrstuvwxyz",
        );
        let message = reply["error"]["message"].as_str().unwrap();
        assert!(message.contains("[REDACTED]"));
    }
}
