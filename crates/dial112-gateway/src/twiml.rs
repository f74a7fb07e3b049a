//! `/incoming-call` webhook: remember who is calling and tell the provider
//! where to stream the call's media.

use std::sync::Arc;

use axum::extract::{Form, Query, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{info, warn};

use crate::state::GatewayState;

/// Path of the media-stream WebSocket route.
pub const MEDIA_STREAM_PATH: &str = "/media-stream";

const FALLBACK_MESSAGE: &str =
    "We are sorry, your call cannot be connected right now. Please try again.";

/// Webhook parameters, from the query string (GET) or form body (POST).
#[derive(Debug, Default, Deserialize)]
pub struct IncomingCall {
    #[serde(rename = "From")]
    pub from: Option<String>,
    #[serde(rename = "To")]
    pub to: Option<String>,
    #[serde(rename = "CallSid")]
    pub call_sid: Option<String>,
}

/// `wss://` URL of the media stream, from the configured public host or
/// else the request's `Host` header.
pub fn stream_url(public_url: Option<&str>, host: Option<&str>) -> Option<String> {
    let raw = public_url.or(host)?.trim();
    let host = raw
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(raw)
        .trim_end_matches('/');
    if host.is_empty() {
        return None;
    }
    Some(format!("wss://{host}{MEDIA_STREAM_PATH}"))
}

pub fn connect_twiml(stream_url: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><Response><Connect><Stream url="{}"/></Connect></Response>"#,
        xml_escape(stream_url)
    )
}

pub fn say_twiml(message: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><Response><Say>{}</Say></Response>"#,
        xml_escape(message)
    )
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn xml_response(body: String) -> Response {
    ([(header::CONTENT_TYPE, "application/xml")], body).into_response()
}

pub async fn incoming_call_get(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(call): Query<IncomingCall>,
) -> Response {
    incoming_call(&state, &headers, call).await
}

pub async fn incoming_call_post(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Form(call): Form<IncomingCall>,
) -> Response {
    incoming_call(&state, &headers, call).await
}

async fn incoming_call(state: &GatewayState, headers: &HeaderMap, call: IncomingCall) -> Response {
    info!(
        call_sid = call.call_sid.as_deref().unwrap_or("-"),
        from = call.from.as_deref().unwrap_or("-"),
        to = call.to.as_deref().unwrap_or("-"),
        "Incoming call"
    );

    if let (Some(sid), Some(from)) = (&call.call_sid, &call.from) {
        if !from.trim().is_empty() {
            state.callers.record(sid, from.trim()).await;
        }
    }

    let host = headers.get(header::HOST).and_then(|h| h.to_str().ok());
    match stream_url(state.config.public_url(), host) {
        Some(url) => xml_response(connect_twiml(&url)),
        None => {
            warn!("No public host or Host header; cannot build stream URL");
            xml_response(say_twiml(FALLBACK_MESSAGE))
        }
    }
}
