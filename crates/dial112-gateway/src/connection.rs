//! Media-stream WebSocket lifecycle: read loop, send task, session hand-off.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dial112_core::protocol::{InboundEvent, StartMeta, parse_inbound};

use crate::orchestrator::SessionUpdate;
use crate::session::CallSession;
use crate::state::GatewayState;

/// Custom stream parameters that may carry the caller number.
const CALLER_PARAMS: [&str; 2] = ["From", "caller"];

enum Flow {
    Continue,
    Close,
}

/// Per-socket state: the call session appears on `start`.
struct Connection {
    conn_id: String,
    outbound: mpsc::UnboundedSender<String>,
    session: Option<CallSession>,
    updates: Option<mpsc::UnboundedReceiver<SessionUpdate>>,
}

/// Handle one provider media-stream socket until stop, disconnect or shutdown.
pub async fn handle_media_stream(state: Arc<GatewayState>, ws: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "Media stream connected");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    let mut conn = Connection {
        conn_id: conn_id.clone(),
        outbound: out_tx,
        session: None,
        updates: None,
    };

    loop {
        let cancel = match &conn.session {
            Some(session) => session.cancel_token().clone(),
            None => state.shutdown.clone(),
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(conn_id = %conn_id, "Media stream cancelled");
                break;
            }
            Some(update) = next_update(&mut conn.updates) => {
                if let Some(session) = conn.session.as_mut() {
                    session.apply(update);
                }
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Flow::Close = conn.handle_text(&state, text.as_str()).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(conn_id = %conn_id, "Provider closed the socket");
                    break;
                }
                Some(Err(e)) => {
                    warn!(conn_id = %conn_id, %e, "WebSocket error");
                    break;
                }
                // Axum answers pings itself; binary frames are not part of the protocol.
                Some(Ok(_)) => {}
            }
        }
    }

    conn.close(&state).await;
    send_task.abort();
    info!(conn_id = %conn_id, "Media stream closed");
}

async fn next_update(
    updates: &mut Option<mpsc::UnboundedReceiver<SessionUpdate>>,
) -> Option<SessionUpdate> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Stream id of a `start`: the metadata's own, else the envelope's.
fn start_stream_sid(outer: Option<String>, start: &StartMeta) -> Option<String> {
    if !start.stream_sid.is_empty() {
        return Some(start.stream_sid.clone());
    }
    outer.filter(|sid| !sid.is_empty())
}

/// Caller number passed as a custom stream parameter, if any.
pub fn caller_hint(start: &StartMeta) -> Option<String> {
    CALLER_PARAMS
        .iter()
        .find_map(|key| start.custom_parameters.get(*key))
        .filter(|v| !v.trim().is_empty())
        .cloned()
}

impl Connection {
    async fn handle_text(&mut self, state: &Arc<GatewayState>, text: &str) -> Flow {
        let event = match parse_inbound(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(conn_id = %self.conn_id, %e, "Dropping malformed message");
                #[cfg(feature = "metrics")]
                crate::metrics::record_error(e.kind());
                return Flow::Continue;
            }
        };

        match event {
            InboundEvent::Connected { protocol, .. } => {
                debug!(conn_id = %self.conn_id, protocol = protocol.as_deref().unwrap_or("-"), "Provider connected");
            }
            InboundEvent::Start { stream_sid, start } => {
                if self.session.is_some() {
                    warn!(conn_id = %self.conn_id, "Second start on one socket ignored");
                    return Flow::Continue;
                }
                let Some(sid) = start_stream_sid(stream_sid, &start) else {
                    warn!(conn_id = %self.conn_id, "Start without stream id ignored");
                    return Flow::Continue;
                };

                let hint = caller_hint(&start);
                match CallSession::open(state, &sid, &start.call_sid, hint, self.outbound.clone())
                    .await
                {
                    Ok((mut session, updates)) => {
                        session.greet(state);
                        self.session = Some(session);
                        self.updates = Some(updates);
                    }
                    Err(e) => {
                        error!(conn_id = %self.conn_id, stream_sid = %sid, %e, "Call setup failed");
                        #[cfg(feature = "metrics")]
                        crate::metrics::record_error(e.kind());
                        return Flow::Close;
                    }
                }
            }
            InboundEvent::Media { media, .. } => {
                let Some(session) = self.session.as_mut() else {
                    debug!(conn_id = %self.conn_id, "Media before start ignored");
                    return Flow::Continue;
                };
                match media.decode() {
                    Ok(audio) => session.ingest(state, &audio),
                    Err(e) => {
                        debug!(stream_sid = %session.stream_sid(), %e, "Dropping undecodable media");
                        session.drop_message();
                    }
                }
            }
            InboundEvent::Mark { mark, .. } => {
                debug!(conn_id = %self.conn_id, name = %mark.name, "Playback mark acknowledged");
            }
            InboundEvent::Stop { .. } => {
                info!(conn_id = %self.conn_id, "Stream stopped by provider");
                return Flow::Close;
            }
            InboundEvent::Unknown => {
                debug!(conn_id = %self.conn_id, "Unknown event ignored");
            }
        }
        Flow::Continue
    }

    /// Apply what the turn tasks already reported, then finalize.
    async fn close(&mut self, state: &Arc<GatewayState>) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Some(mut updates) = self.updates.take() {
            while let Ok(update) = updates.try_recv() {
                session.apply(update);
            }
        }
        session.finalize(state).await;
    }
}
