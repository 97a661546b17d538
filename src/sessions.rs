//! In-memory session registry for the tool bridge.
//!
//! Every inbound RPC call is associated with a session id so clients can reconnect after
//! server restarts without re-negotiating. Sessions are plain in-memory records; a session
//! whose last activity is older than the configured timeout is treated as absent, and an
//! idle sweep runs on each incoming request.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

/// One active tool-bridge session.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSession {
    /// Session identifier handed back to the client.
    pub session_id: Uuid,
    /// Client-supplied identity, when provided.
    pub client_id: String,
    /// Seconds since the session was created.
    pub connected_seconds: u64,
    /// Seconds since the last call.
    pub idle_seconds: u64,
    /// Number of tool calls serviced in this session.
    pub tools_called: u64,
}

#[derive(Debug, Clone)]
struct SessionState {
    client_id: String,
    connected_at: Instant,
    last_activity: Instant,
    tools_called: u64,
}

/// Registry of live sessions with idle expiry.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<Mutex<HashMap<Uuid, SessionState>>>,
    timeout: Duration,
}

impl SessionManager {
    /// Create a registry with the given idle timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Create a fresh session and return its id.
    pub async fn create_session(&self, client_id: Option<String>) -> Uuid {
        let session_id = Uuid::new_v4();
        let now = Instant::now();
        self.sessions.lock().await.insert(
            session_id,
            SessionState {
                client_id: client_id.unwrap_or_else(|| "anonymous".to_string()),
                connected_at: now,
                last_activity: now,
                tools_called: 0,
            },
        );
        tracing::info!(%session_id, "Created tool session");
        session_id
    }

    /// Validate a session id, refreshing its activity clock and call counter.
    ///
    /// Expired sessions are removed and reported as absent, so the caller issues a new id.
    pub async fn touch(&self, session_id: Uuid) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&session_id) {
            Some(state) if state.last_activity.elapsed() <= self.timeout => {
                state.last_activity = Instant::now();
                state.tools_called += 1;
                true
            }
            Some(_) => {
                sessions.remove(&session_id);
                tracing::info!(%session_id, "Session expired and removed");
                false
            }
            None => false,
        }
    }

    /// Resolve the session for a request: touch the supplied id or mint a new one.
    pub async fn resolve(&self, supplied: Option<Uuid>) -> Uuid {
        self.sweep().await;
        if let Some(session_id) = supplied
            && self.touch(session_id).await
        {
            return session_id;
        }
        self.create_session(None).await
    }

    /// Remove every expired session; returns how many were dropped.
    pub async fn sweep(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        let timeout = self.timeout;
        sessions.retain(|_, state| state.last_activity.elapsed() <= timeout);
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!(removed, "Swept expired tool sessions");
        }
        removed
    }

    /// Snapshot of live sessions, sweeping first.
    pub async fn active_sessions(&self) -> Vec<ToolSession> {
        self.sweep().await;
        self.sessions
            .lock()
            .await
            .iter()
            .map(|(session_id, state)| ToolSession {
                session_id: *session_id,
                client_id: state.client_id.clone(),
                connected_seconds: state.connected_at.elapsed().as_secs(),
                idle_seconds: state.last_activity.elapsed().as_secs(),
                tools_called: state.tools_called,
            })
            .collect()
    }
}
