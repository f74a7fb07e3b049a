//! Complaint intake: hands the finished conversation to the ticketing
//! service as one JSON POST.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use dial112_core::config::IntakeConfig;

use crate::{IntakeRequest, IntakeService, ServiceError, check_status, http_client};

/// `AUDIO_<caller>`, the origin label intake uses to tell voice calls apart.
pub fn source_label(caller_id: Option<&str>) -> String {
    format!("AUDIO_{}", caller_id.unwrap_or("unknown"))
}

/// Suggested ticket number: `YYYYmmddHHMMSS` followed by three digits.
pub fn ticket_hint(now: DateTime<Utc>, suffix: u16) -> String {
    format!("{}{:03}", now.format("%Y%m%d%H%M%S"), suffix % 1000)
}

pub struct HttpIntake {
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpIntake {
    pub fn new(config: &IntakeConfig) -> Self {
        Self {
            url: config.url.clone(),
            api_key: config.resolve_api_key(),
            client: http_client(config.timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IntakeResponse {
    #[serde(default, alias = "ticket", alias = "id")]
    ticket_id: Option<serde_json::Value>,
}

/// Read the ticket id from the intake reply, falling back to the hint when
/// the service accepts the hint without echoing it.
pub fn parse_ticket(body: &str, hint: &str) -> Result<String, ServiceError> {
    if body.trim().is_empty() {
        return Ok(hint.to_string());
    }
    let parsed: IntakeResponse = serde_json::from_str(body)
        .map_err(|e| ServiceError::InvalidResponse(format!("intake: {e}")))?;
    Ok(match parsed.ticket_id {
        Some(serde_json::Value::String(s)) if !s.is_empty() => s,
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => hint.to_string(),
    })
}

#[async_trait]
impl IntakeService for HttpIntake {
    async fn submit(&self, request: &IntakeRequest) -> Result<String, ServiceError> {
        debug!(
            call_id = %request.call_id,
            source = %request.source,
            transcript_len = request.transcript.len(),
            "Submitting conversation to intake"
        );

        let mut req = self.client.post(&self.url).json(request);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = check_status("intake", req.send().await?).await?;
        let ticket = parse_ticket(&resp.text().await?, &request.ticket_hint)?;
        info!(call_id = %request.call_id, ticket_id = %ticket, "Intake ticket filed");
        Ok(ticket)
    }
}
