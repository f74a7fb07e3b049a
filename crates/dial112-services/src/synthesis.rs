//! Text-to-speech. Both backends return raw PCM16 so no container decoding
//! is needed before the telephony conditioning step.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use dial112_core::config::SynthesisConfig;
use dial112_media::codec;

use crate::{ServiceError, SpeechSynthesizer, SynthesizedAudio, check_status, http_client};

const ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io";
const ELEVENLABS_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM"; // "Rachel"
const ELEVENLABS_MODEL: &str = "eleven_turbo_v2";
const ELEVENLABS_PCM_RATE: u32 = 16000;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OPENAI_VOICE: &str = "alloy";
const OPENAI_MODEL: &str = "tts-1";
/// OpenAI's `pcm` response format is fixed at 24 kHz.
const OPENAI_PCM_RATE: u32 = 24000;

/// Pick the backend named by `config.provider`.
pub fn from_config(config: &SynthesisConfig) -> Arc<dyn SpeechSynthesizer> {
    match config.provider.as_str() {
        "openai" => Arc::new(OpenAiSpeech::new(config)),
        "elevenlabs" => Arc::new(ElevenLabsSpeech::new(config)),
        other => {
            warn!(provider = other, "Unknown synthesis provider, using elevenlabs");
            Arc::new(ElevenLabsSpeech::new(config))
        }
    }
}

fn pcm_body(bytes: &[u8], sample_rate: u32) -> Result<SynthesizedAudio, ServiceError> {
    let samples =
        codec::pcm_from_le_bytes(bytes).map_err(|e| ServiceError::Codec(e.to_string()))?;
    if samples.is_empty() {
        return Err(ServiceError::InvalidResponse("synthesizer returned no audio".into()));
    }
    Ok(SynthesizedAudio {
        samples,
        sample_rate,
    })
}

pub struct ElevenLabsSpeech {
    base_url: String,
    api_key: Option<String>,
    voice: String,
    model: String,
    client: reqwest::Client,
}

impl ElevenLabsSpeech {
    pub fn new(config: &SynthesisConfig) -> Self {
        Self {
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(ELEVENLABS_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: config.resolve_api_key(),
            voice: config.voice.clone().unwrap_or_else(|| ELEVENLABS_VOICE_ID.into()),
            model: config.model.clone().unwrap_or_else(|| ELEVENLABS_MODEL.into()),
            client: http_client(config.timeout_secs),
        }
    }

    pub fn request_url(&self) -> String {
        format!(
            "{}/v1/text-to-speech/{}?output_format=pcm_{ELEVENLABS_PCM_RATE}",
            self.base_url, self.voice
        )
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSpeech {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio, ServiceError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ServiceError::NotConfigured("synthesis API key".into()))?;

        debug!(voice = %self.voice, model = %self.model, text_len = text.len(), "Synthesizing speech");

        let resp = self
            .client
            .post(self.request_url())
            .header("xi-api-key", api_key)
            .json(&json!({
                "text": text,
                "model_id": self.model,
                "voice_settings": {
                    "stability": 0.5,
                    "similarity_boost": 0.75
                }
            }))
            .send()
            .await?;
        let resp = check_status("synthesis", resp).await?;
        pcm_body(&resp.bytes().await?, ELEVENLABS_PCM_RATE)
    }
}

pub struct OpenAiSpeech {
    url: String,
    api_key: Option<String>,
    voice: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiSpeech {
    pub fn new(config: &SynthesisConfig) -> Self {
        let base = config
            .base_url
            .as_deref()
            .unwrap_or(OPENAI_BASE_URL)
            .trim_end_matches('/');
        Self {
            url: format!("{base}/audio/speech"),
            api_key: config.resolve_api_key(),
            voice: config.voice.clone().unwrap_or_else(|| OPENAI_VOICE.into()),
            model: config.model.clone().unwrap_or_else(|| OPENAI_MODEL.into()),
            client: http_client(config.timeout_secs),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio, ServiceError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ServiceError::NotConfigured("synthesis API key".into()))?;

        debug!(voice = %self.voice, model = %self.model, text_len = text.len(), "Synthesizing speech");

        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(api_key)
            .json(&json!({
                "model": self.model,
                "voice": self.voice,
                "input": text,
                "response_format": "pcm"
            }))
            .send()
            .await?;
        let resp = check_status("synthesis", resp).await?;
        pcm_body(&resp.bytes().await?, OPENAI_PCM_RATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elevenlabs_url() {
        let speech = ElevenLabsSpeech::new(&SynthesisConfig::default());
        assert_eq!(
            speech.request_url(),
            "https://api.elevenlabs.io/v1/text-to-speech/21m00Tcm4TlvDq8ikWAM?output_format=pcm_16000"
        );

        let custom = ElevenLabsSpeech::new(&SynthesisConfig {
            base_url: Some("http://tts.local/".into()),
            voice: Some("Aria".into()),
            ..SynthesisConfig::default()
        });
        assert!(custom.request_url().starts_with("http://tts.local/v1/text-to-speech/Aria"));
    }

    #[test]
    fn test_pcm_body() {
        let audio = pcm_body(&[0x10, 0x00, 0xF0, 0xFF], 16000).unwrap();
        assert_eq!(audio.samples, vec![16, -16]);
        assert_eq!(audio.sample_rate, 16000);
        assert!(matches!(pcm_body(&[1, 2, 3], 16000), Err(ServiceError::Codec(_))));
        assert!(matches!(pcm_body(&[], 16000), Err(ServiceError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_missing_key_is_not_configured() {
        let speech = OpenAiSpeech::new(&SynthesisConfig {
            provider: "openai".into(),
            ..SynthesisConfig::default()
        });
        assert!(matches!(
            speech.synthesize("hello").await,
            Err(ServiceError::NotConfigured(_))
        ));
    }
}
