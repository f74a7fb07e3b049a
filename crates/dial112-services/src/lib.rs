//! External collaborators of the call pipeline.
//!
//! Each collaborator is a trait so the gateway can run against real HTTP
//! services in production and in-process stubs in tests. All of them are slow
//! and fallible; timeouts are enforced by the HTTP clients here, not by the
//! pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use dial112_core::config::Config;

pub mod dialogue;
pub mod intake;
pub mod recognition;
pub mod synthesis;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0} is not configured")]
    NotConfigured(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} returned {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("audio error: {0}")]
    Codec(String),
}

/// Recognizer output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// 0.0..=1.0, when the recognizer reports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl Transcript {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// Linear PCM16 mono audio at an arbitrary rate.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

/// Everything the intake service needs to open a ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeRequest {
    pub call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
    /// Origin label, `AUDIO_<caller>`.
    pub source: String,
    /// Suggested ticket number; the service may assign its own.
    pub ticket_hint: String,
    /// The whole conversation as one `"speaker: text"` paragraph.
    pub transcript: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Speech-to-text.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    fn id(&self) -> &str;

    /// Rate the recognizer wants its input resampled to.
    fn sample_rate(&self) -> u32;

    async fn transcribe(&self, pcm: &[i16], sample_rate: u32) -> Result<Transcript, ServiceError>;
}

/// Produces the assistant's next line.
#[async_trait]
pub trait DialogueAgent: Send + Sync {
    /// `session_key` identifies the conversation: the caller number when
    /// known, otherwise the call id.
    async fn respond(&self, text: &str, session_key: &str) -> Result<String, ServiceError>;
}

/// Text-to-speech.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio, ServiceError>;
}

/// Downstream complaint intake. Returns the ticket id.
#[async_trait]
pub trait IntakeService: Send + Sync {
    async fn submit(&self, request: &IntakeRequest) -> Result<String, ServiceError>;
}

/// The set of collaborators a gateway runs with.
#[derive(Clone)]
pub struct Collaborators {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub dialogue: Arc<dyn DialogueAgent>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    /// Absent when no intake service is configured; records are still saved.
    pub intake: Option<Arc<dyn IntakeService>>,
}

impl Collaborators {
    /// Build the HTTP-backed collaborators described by `config`.
    pub fn from_config(config: &Config) -> Self {
        let intake = match &config.intake {
            Some(intake) => Some(Arc::new(intake::HttpIntake::new(intake)) as Arc<dyn IntakeService>),
            None => {
                warn!("No intake service configured; tickets will not be filed");
                None
            }
        };

        Self {
            recognizer: Arc::new(recognition::WhisperRecognizer::new(&config.recognition())),
            dialogue: Arc::new(dialogue::ChatDialogue::new(&config.dialogue())),
            synthesizer: synthesis::from_config(&config.synthesis()),
            intake,
        }
    }
}

/// Turn a non-success response into [`ServiceError::Status`].
pub(crate) async fn check_status(
    service: &'static str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, ServiceError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(ServiceError::Status {
        service,
        status,
        body,
    })
}

pub(crate) fn http_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
