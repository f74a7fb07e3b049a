//! Whisper-style speech recognition over an OpenAI-compatible
//! `/audio/transcriptions` endpoint (Groq, OpenAI, or self-hosted).

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use dial112_core::config::RecognitionConfig;
use dial112_media::{dsp, wav};

use crate::{SpeechRecognizer, ServiceError, Transcript, check_status, http_client};

const GROQ_URL: &str = "https://api.groq.com/openai/v1/audio/transcriptions";
const OPENAI_URL: &str = "https://api.openai.com/v1/audio/transcriptions";

/// Resolve the transcription URL for the configured provider.
pub fn provider_url(config: &RecognitionConfig) -> String {
    if let Some(base) = &config.base_url {
        return format!("{}/audio/transcriptions", base.trim_end_matches('/'));
    }
    match config.provider.as_str() {
        "openai" => OPENAI_URL.to_string(),
        _ => GROQ_URL.to_string(),
    }
}

fn default_model(provider: &str) -> &'static str {
    match provider {
        "openai" => "whisper-1",
        _ => "whisper-large-v3-turbo",
    }
}

pub struct WhisperRecognizer {
    url: String,
    api_key: Option<String>,
    /// Hosted providers refuse unauthenticated requests.
    requires_key: bool,
    model: String,
    language: Option<String>,
    prompt: Option<String>,
    sample_rate: u32,
    client: reqwest::Client,
}

impl WhisperRecognizer {
    pub fn new(config: &RecognitionConfig) -> Self {
        Self {
            url: provider_url(config),
            api_key: config.resolve_api_key(),
            requires_key: config.base_url.is_none(),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| default_model(&config.provider).to_string()),
            language: config.language.clone(),
            prompt: config.prompt.clone(),
            sample_rate: config.sample_rate,
            client: http_client(config.timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VerboseTranscription {
    #[serde(default)]
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<Segment>,
}

#[derive(Debug, Deserialize)]
struct Segment {
    #[serde(default)]
    avg_logprob: Option<f64>,
}

/// Parse a `verbose_json` transcription body.
///
/// Confidence is the mean segment log-probability mapped back through `exp`.
pub fn parse_verbose_json(body: &str) -> Result<Transcript, ServiceError> {
    let parsed: VerboseTranscription = serde_json::from_str(body)
        .map_err(|e| ServiceError::InvalidResponse(format!("transcription: {e}")))?;

    let logprobs: Vec<f64> = parsed.segments.iter().filter_map(|s| s.avg_logprob).collect();
    let confidence = if logprobs.is_empty() {
        None
    } else {
        let mean = logprobs.iter().sum::<f64>() / logprobs.len() as f64;
        Some(mean.exp().clamp(0.0, 1.0))
    };

    Ok(Transcript {
        text: parsed.text.trim().to_string(),
        language: parsed.language,
        confidence,
    })
}

#[async_trait]
impl SpeechRecognizer for WhisperRecognizer {
    fn id(&self) -> &str {
        "whisper"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn transcribe(&self, pcm: &[i16], sample_rate: u32) -> Result<Transcript, ServiceError> {
        if self.requires_key && self.api_key.is_none() {
            return Err(ServiceError::NotConfigured("recognition API key".into()));
        }

        let pcm = dsp::resample(pcm, sample_rate, self.sample_rate)
            .map_err(|e| ServiceError::Codec(e.to_string()))?;
        let wav_data = wav::pcm_to_wav(&pcm, self.sample_rate);

        debug!(
            url = %self.url,
            model = %self.model,
            wav_bytes = wav_data.len(),
            "Sending audio for transcription"
        );

        let part = reqwest::multipart::Part::bytes(wav_data)
            .file_name("utterance.wav")
            .mime_str("audio/wav")?;

        let mut form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .text("temperature", "0")
            .part("file", part);
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }
        if let Some(prompt) = &self.prompt {
            form = form.text("prompt", prompt.clone());
        }

        let mut request = self.client.post(&self.url).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = check_status("recognition", request.send().await?).await?;
        let body = resp.text().await?;
        parse_verbose_json(&body)
    }
}
