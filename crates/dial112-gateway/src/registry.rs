//! Session registry: stream id → live call session.
//!
//! Only the media-socket handler inserts and removes entries. The registry
//! itself never touches session state; it holds what other tasks need to see
//! (identity, start time, cancellation) and enforces the concurrent call cap.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use dial112_core::error::{DispatchError, Result};

#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub call_id: String,
    pub caller_id: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Cancelling stops the session's socket loop, which then finalizes.
    pub cancel: CancellationToken,
}

/// Listing view for `/health` and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveCall {
    pub stream_sid: String,
    pub call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    max_calls: usize,
}

impl SessionRegistry {
    pub fn new(max_calls: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_calls,
        }
    }

    /// Register a new session. Fails with a call-setup error when the stream
    /// id is already live or the call cap is reached.
    pub async fn register(&self, stream_sid: &str, handle: SessionHandle) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(stream_sid) {
            return Err(DispatchError::SessionSetup(format!(
                "stream {stream_sid} already has a session"
            )));
        }
        if sessions.len() >= self.max_calls {
            return Err(DispatchError::SessionSetup(format!(
                "call limit of {} reached",
                self.max_calls
            )));
        }
        info!(stream_sid, call_id = %handle.call_id, active = sessions.len() + 1, "Session registered");
        sessions.insert(stream_sid.to_string(), handle);
        Ok(())
    }

    /// Remove a session. Returns `None` if it was already removed.
    pub async fn remove(&self, stream_sid: &str) -> Option<SessionHandle> {
        let removed = self.sessions.write().await.remove(stream_sid);
        if removed.is_some() {
            debug!(stream_sid, "Session removed");
        }
        removed
    }

    pub async fn contains(&self, stream_sid: &str) -> bool {
        self.sessions.read().await.contains_key(stream_sid)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn active_calls(&self) -> Vec<ActiveCall> {
        let sessions = self.sessions.read().await;
        let mut calls: Vec<ActiveCall> = sessions
            .iter()
            .map(|(sid, h)| ActiveCall {
                stream_sid: sid.clone(),
                call_id: h.call_id.clone(),
                caller_id: h.caller_id.clone(),
                started_at: h.started_at,
            })
            .collect();
        calls.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        calls
    }

    /// Ask every live session to wind down. Each finalizes and removes itself.
    pub async fn cancel_all(&self) -> usize {
        let sessions = self.sessions.read().await;
        for handle in sessions.values() {
            handle.cancel.cancel();
        }
        sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(call_id: &str) -> SessionHandle {
        SessionHandle {
            call_id: call_id.into(),
            caller_id: None,
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_register_and_remove_once() {
        let registry = SessionRegistry::new(4);
        registry.register("MZ1", handle("MZ1_1")).await.unwrap();
        assert!(registry.contains("MZ1").await);
        assert_eq!(registry.len().await, 1);

        assert!(registry.remove("MZ1").await.is_some());
        assert!(registry.remove("MZ1").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_stream_is_setup_failure() {
        let registry = SessionRegistry::new(4);
        registry.register("MZ1", handle("MZ1_1")).await.unwrap();
        let err = registry.register("MZ1", handle("MZ1_2")).await.unwrap_err();
        assert!(matches!(err, DispatchError::SessionSetup(_)));
        assert_eq!(registry.active_calls().await[0].call_id, "MZ1_1");
    }

    #[tokio::test]
    async fn test_call_cap() {
        let registry = SessionRegistry::new(1);
        registry.register("MZ1", handle("a")).await.unwrap();
        assert!(matches!(
            registry.register("MZ2", handle("b")).await,
            Err(DispatchError::SessionSetup(_))
        ));
        registry.remove("MZ1").await;
        registry.register("MZ2", handle("b")).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let registry = SessionRegistry::new(4);
        let a = handle("a");
        let b = handle("b");
        let (ta, tb) = (a.cancel.clone(), b.cancel.clone());
        registry.register("MZ1", a).await.unwrap();
        registry.register("MZ2", b).await.unwrap();
        assert_eq!(registry.cancel_all().await, 2);
        assert!(ta.is_cancelled() && tb.is_cancelled());
    }
}
