//! Axum HTTP/WebSocket server.

use std::future::Future;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::connection::handle_media_stream;
use crate::state::GatewayState;
use crate::twiml::{self, MEDIA_STREAM_PATH};

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    let router = Router::new()
        .route(
            "/incoming-call",
            get(twiml::incoming_call_get).post(twiml::incoming_call_post),
        )
        .route(MEDIA_STREAM_PATH, get(media_stream_handler))
        .route("/health", get(health_handler))
        .route("/recordings", get(list_recordings_handler))
        .route("/recordings/{call_id}", get(get_recording_handler));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_handler));

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind the configured address and serve until Ctrl-C.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let addr = format!("{}:{port}", state.config.bind_addr());
    let listener = TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");

    let signal_state = state.clone();
    serve(listener, state, async move {
        shutdown_signal().await;
        let active = signal_state.registry.cancel_all().await;
        info!(active, "Shutting down, closing active calls");
        signal_state.shutdown.cancel();
    })
    .await
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<GatewayState>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn media_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_media_stream(state, socket))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    let calls = state.registry.active_calls().await;

    Json(json!({
        "status": "ok",
        "version": version,
        "active_calls": calls.len(),
        "calls": calls,
    }))
}

async fn list_recordings_handler(State(state): State<Arc<GatewayState>>) -> Response {
    match state.recordings.list().await {
        Ok(summaries) => Json(summaries).into_response(),
        Err(e) => {
            error!(%e, "Failed to list recordings");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

async fn get_recording_handler(
    State(state): State<Arc<GatewayState>>,
    Path(call_id): Path<String>,
) -> Response {
    match state.recordings.load(&call_id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "recording not found"),
        Err(dial112_core::error::DispatchError::Recording(msg)) => {
            error_response(StatusCode::BAD_REQUEST, &msg)
        }
        Err(e) => {
            error!(%e, call_id = %call_id, "Failed to load recording");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => error_response(StatusCode::NOT_FOUND, "metrics not enabled"),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, header};
    use tower::ServiceExt;

    use dial112_core::config::Config;
    use dial112_core::record::{ConversationRecord, Speaker, TranscriptEntry};
    use dial112_core::recording_store::RecordingStore;
    use dial112_services::{
        Collaborators, DialogueAgent, ServiceError, SpeechRecognizer, SpeechSynthesizer,
        SynthesizedAudio, Transcript,
    };

    struct Unused;

    #[async_trait]
    impl SpeechRecognizer for Unused {
        fn id(&self) -> &str {
            "unused"
        }
        fn sample_rate(&self) -> u32 {
            16000
        }
        async fn transcribe(&self, _pcm: &[i16], _rate: u32) -> Result<Transcript, ServiceError> {
            Err(ServiceError::NotConfigured("recognizer".into()))
        }
    }

    #[async_trait]
    impl DialogueAgent for Unused {
        async fn respond(&self, _text: &str, _key: &str) -> Result<String, ServiceError> {
            Err(ServiceError::NotConfigured("dialogue".into()))
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for Unused {
        async fn synthesize(&self, _text: &str) -> Result<SynthesizedAudio, ServiceError> {
            Err(ServiceError::NotConfigured("synthesis".into()))
        }
    }

    fn state(config: &str, dir: &std::path::Path) -> Arc<GatewayState> {
        let collaborators = Collaborators {
            recognizer: Arc::new(Unused),
            dialogue: Arc::new(Unused),
            synthesizer: Arc::new(Unused),
            intake: None,
        };
        let config = Config::parse(config).unwrap();
        Arc::new(
            GatewayState::new(Arc::new(config), collaborators)
                .with_recordings(RecordingStore::new(dir.to_path_buf())),
        )
    }

    async fn body_string(resp: Response) -> String {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state("{}", dir.path()));
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_calls"], 0);
    }

    #[tokio::test]
    async fn test_incoming_call_post_records_caller() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(r#"{ gateway: { public_url: "calls.example.org" } }"#, dir.path());
        let app = router(state.clone());

        let resp = app
            .oneshot(
                Request::post("/incoming-call")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("From=%2B15550100&To=112&CallSid=CA9"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/xml");
        let xml = body_string(resp).await;
        assert!(xml.contains(r#"<Stream url="wss://calls.example.org/media-stream"/>"#));
        assert_eq!(state.callers.take("CA9").await.as_deref(), Some("+15550100"));
    }

    #[tokio::test]
    async fn test_incoming_call_get_uses_host_header() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state("{}", dir.path()));
        let resp = app
            .oneshot(
                Request::get("/incoming-call?CallSid=CA1")
                    .header(header::HOST, "gw.local:8000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let xml = body_string(resp).await;
        assert!(xml.contains("wss://gw.local:8000/media-stream"));
    }

    #[tokio::test]
    async fn test_recordings_routes() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::new(dir.path().to_path_buf());
        let now = chrono::Utc::now();
        store
            .save(&ConversationRecord {
                call_id: "MZ1_1".into(),
                stream_sid: "MZ1".into(),
                caller_id: None,
                start_time: now,
                end_time: now,
                duration_seconds: 0.0,
                conversation_recording: None,
                ticket_id: None,
                conversation: vec![TranscriptEntry::new(Speaker::Caller, "hello there")],
            })
            .await
            .unwrap();

        let app = router(state("{}", dir.path()));

        let resp = app
            .clone()
            .oneshot(Request::get("/recordings").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let list: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(list[0]["call_id"], "MZ1_1");

        let resp = app
            .clone()
            .oneshot(Request::get("/recordings/MZ1_1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::get("/recordings/MZ404_1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
