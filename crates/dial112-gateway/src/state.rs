//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use dial112_core::config::{Config, EndpointConfig};
use dial112_core::recording_store::RecordingStore;
use dial112_media::playback::PlaybackScheduler;
use dial112_services::Collaborators;

use crate::orchestrator::TurnOrchestrator;
use crate::registry::SessionRegistry;

/// Caller numbers reported by `/incoming-call`, keyed by call SID, waiting
/// for the matching media stream to start.
#[derive(Default)]
pub struct CallerDirectory {
    callers: RwLock<HashMap<String, String>>,
}

impl CallerDirectory {
    pub async fn record(&self, call_sid: &str, caller: &str) {
        self.callers
            .write()
            .await
            .insert(call_sid.to_string(), caller.to_string());
    }

    /// Take the caller for `call_sid`; each entry is used by one stream.
    pub async fn take(&self, call_sid: &str) -> Option<String> {
        self.callers.write().await.remove(call_sid)
    }

    pub async fn len(&self) -> usize {
        self.callers.read().await.len()
    }
}

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub collaborators: Collaborators,
    pub orchestrator: Arc<TurnOrchestrator>,
    pub registry: SessionRegistry,
    pub callers: CallerDirectory,
    pub recordings: Arc<RecordingStore>,
    pub scheduler: PlaybackScheduler,
    pub endpoint: EndpointConfig,
    /// Cancelled on server shutdown; every session listens to a child token.
    pub shutdown: CancellationToken,
    #[cfg(feature = "metrics")]
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, collaborators: Collaborators) -> Self {
        let recordings = Arc::new(RecordingStore::new(config.recordings_dir()));
        let orchestrator = Arc::new(TurnOrchestrator::new(
            collaborators.clone(),
            config.dialogue().fallback_reply,
        ));

        Self {
            registry: SessionRegistry::new(config.max_calls()),
            callers: CallerDirectory::default(),
            recordings,
            orchestrator,
            scheduler: PlaybackScheduler::new(config.playback_frame_ms()),
            endpoint: config.endpoint(),
            shutdown: CancellationToken::new(),
            #[cfg(feature = "metrics")]
            metrics: None,
            collaborators,
            config,
        }
    }

    /// Use `store` instead of the configured recordings directory.
    pub fn with_recordings(mut self, store: RecordingStore) -> Self {
        self.recordings = Arc::new(store);
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_caller_directory_take_once() {
        let directory = CallerDirectory::default();
        directory.record("CA1", "+15550100").await;
        assert_eq!(directory.len().await, 1);
        assert_eq!(directory.take("CA1").await.as_deref(), Some("+15550100"));
        assert_eq!(directory.take("CA1").await, None);
    }
}
