//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default greeting played when a call connects.
pub const DEFAULT_GREETING: &str =
    "Hello, this is emergency services, How can I help you today?";

/// Top-level Dial 112 configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub call: Option<CallConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<EndpointConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback: Option<PlaybackConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub recognition: Option<RecognitionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dialogue: Option<DialogueConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<SynthesisConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub intake: Option<IntakeConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub recordings: Option<RecordingsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Public host (e.g. a tunnel hostname) used to build the `wss://` stream URL
    /// returned to the telephony provider. Falls back to the request `Host` header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,

    /// Maximum number of concurrent call sessions.
    #[serde(default = "default_max_calls")]
    pub max_calls: usize,
}

fn default_port() -> u16 {
    8000
}

fn default_max_calls() -> usize {
    64
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallConfig {
    /// Greeting synthesized on call start. An empty string disables it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,

    /// Caller label used when the provider did not report a number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unknown_caller: Option<String>,
}

/// Speech endpoint detection thresholds.
///
/// Tuned for 8 kHz µ-law telephony; adjust per carrier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Analysis frame length in milliseconds.
    #[serde(default = "default_detect_frame_ms")]
    pub frame_ms: u32,

    /// Frame energy (dBFS) above which the energy vote is cast.
    #[serde(default = "default_energy_db_threshold")]
    pub energy_db_threshold: f64,

    /// Frame RMS above which the RMS vote is cast.
    #[serde(default = "default_rms_threshold")]
    pub rms_threshold: f64,

    /// Peak absolute amplitude above which the peak vote is cast.
    #[serde(default = "default_peak_threshold")]
    pub peak_threshold: i32,

    /// Zero-crossing count above which the voicing vote is cast.
    #[serde(default = "default_zero_crossing_threshold")]
    pub zero_crossing_threshold: u32,

    /// Votes (out of four) needed to classify a frame as speech.
    #[serde(default = "default_min_votes")]
    pub min_votes: u8,

    /// Continuous silence that closes an utterance.
    #[serde(default = "default_silence_ms")]
    pub silence_ms: u64,

    /// Minimum utterance length before silence may close it.
    #[serde(default = "default_min_utterance_ms")]
    pub min_utterance_ms: u64,

    /// Utterances at or below this many bytes are discarded as noise.
    #[serde(default = "default_min_utterance_bytes")]
    pub min_utterance_bytes: usize,

    /// On hangup, a pending utterance of at least this many bytes is still transcribed.
    #[serde(default = "default_flush_min_bytes")]
    pub flush_min_bytes: usize,
}

fn default_detect_frame_ms() -> u32 {
    40
}

fn default_energy_db_threshold() -> f64 {
    -45.0
}

fn default_rms_threshold() -> f64 {
    500.0
}

fn default_peak_threshold() -> i32 {
    2000
}

fn default_zero_crossing_threshold() -> u32 {
    8
}

fn default_min_votes() -> u8 {
    2
}

fn default_silence_ms() -> u64 {
    1500
}

fn default_min_utterance_ms() -> u64 {
    800
}

fn default_min_utterance_bytes() -> usize {
    1280
}

fn default_flush_min_bytes() -> usize {
    800
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            frame_ms: default_detect_frame_ms(),
            energy_db_threshold: default_energy_db_threshold(),
            rms_threshold: default_rms_threshold(),
            peak_threshold: default_peak_threshold(),
            zero_crossing_threshold: default_zero_crossing_threshold(),
            min_votes: default_min_votes(),
            silence_ms: default_silence_ms(),
            min_utterance_ms: default_min_utterance_ms(),
            min_utterance_bytes: default_min_utterance_bytes(),
            flush_min_bytes: default_flush_min_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Outbound wire frame duration in milliseconds.
    #[serde(default = "default_playback_frame_ms")]
    pub frame_ms: u32,
}

fn default_playback_frame_ms() -> u32 {
    20
}

/// Speech-to-text collaborator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionConfig {
    /// Provider: "groq" or "openai" (default: "groq"). Ignored when `base_url` is set.
    #[serde(default = "default_recognition_provider")]
    pub provider: String,

    /// OpenAI-compatible transcription endpoint, e.g. a self-hosted Whisper server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Model name (e.g. "whisper-large-v3-turbo").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Biasing prompt passed to the recognizer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    /// Sample rate the recognizer expects.
    #[serde(default = "default_recognition_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_recognition_provider() -> String {
    "groq".into()
}

fn default_recognition_sample_rate() -> u32 {
    16000
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            provider: default_recognition_provider(),
            base_url: None,
            api_key: None,
            api_key_env: None,
            model: None,
            language: None,
            prompt: None,
            sample_rate: default_recognition_sample_rate(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl RecognitionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Dialogue collaborator configuration (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueConfig {
    #[serde(default = "default_dialogue_base_url")]
    pub base_url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_dialogue_model")]
    pub model: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Number of previous exchanges kept per caller.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,

    #[serde(default = "default_dialogue_max_tokens")]
    pub max_tokens: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Spoken instead of a reply when the dialogue service fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reply: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_dialogue_base_url() -> String {
    "http://localhost:11434/v1".into()
}

fn default_dialogue_model() -> String {
    "qwen2.5:32b".into()
}

fn default_history_turns() -> usize {
    5
}

fn default_dialogue_max_tokens() -> u32 {
    256
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            base_url: default_dialogue_base_url(),
            api_key: None,
            api_key_env: None,
            model: default_dialogue_model(),
            system_prompt: None,
            history_turns: default_history_turns(),
            max_tokens: default_dialogue_max_tokens(),
            temperature: None,
            fallback_reply: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl DialogueConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Text-to-speech collaborator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Provider: "elevenlabs" (default) or "openai".
    #[serde(default = "default_synthesis_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_synthesis_provider() -> String {
    "elevenlabs".into()
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            provider: default_synthesis_provider(),
            base_url: None,
            api_key: None,
            api_key_env: None,
            voice: None,
            model: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl SynthesisConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Downstream complaint-intake service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    pub url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl IntakeConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordingsConfig {
    /// Directory for conversation records and audio (default: `~/.dial112/recordings`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "dial112_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    // The pattern is a literal and always compiles.
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("valid env-var pattern");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    ///
    /// A missing file yields the default configuration.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse a JSON5 config document.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted)
            .map_err(|e| crate::error::DispatchError::Config(e.to_string()))
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or_else(default_port)
    }

    pub fn bind_addr(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn public_url(&self) -> Option<&str> {
        self.gateway.as_ref().and_then(|g| g.public_url.as_deref())
    }

    pub fn max_calls(&self) -> usize {
        self.gateway
            .as_ref()
            .map(|g| g.max_calls)
            .unwrap_or_else(default_max_calls)
    }

    /// Greeting text, or `None` when disabled.
    pub fn greeting(&self) -> Option<String> {
        match self.call.as_ref().and_then(|c| c.greeting.clone()) {
            Some(g) if g.trim().is_empty() => None,
            Some(g) => Some(g),
            None => Some(DEFAULT_GREETING.to_string()),
        }
    }

    pub fn unknown_caller(&self) -> String {
        self.call
            .as_ref()
            .and_then(|c| c.unknown_caller.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn endpoint(&self) -> EndpointConfig {
        self.endpoint.clone().unwrap_or_default()
    }

    pub fn playback_frame_ms(&self) -> u32 {
        self.playback
            .as_ref()
            .map(|p| p.frame_ms)
            .unwrap_or_else(default_playback_frame_ms)
    }

    pub fn recognition(&self) -> RecognitionConfig {
        self.recognition.clone().unwrap_or_default()
    }

    pub fn dialogue(&self) -> DialogueConfig {
        self.dialogue.clone().unwrap_or_default()
    }

    pub fn synthesis(&self) -> SynthesisConfig {
        self.synthesis.clone().unwrap_or_default()
    }

    /// Resolve the recordings directory.
    pub fn recordings_dir(&self) -> PathBuf {
        self.recordings
            .as_ref()
            .and_then(|r| r.dir.as_ref())
            .map(|d| {
                let expanded = shellexpand::tilde(d);
                PathBuf::from(expanded.as_ref())
            })
            .unwrap_or_else(|| data_dir().join("recordings"))
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.recognition().resolve_api_key().is_none()
            && self.recognition().base_url.is_none()
        {
            warnings.push("Recognition has no API key configured".to_string());
        }
        if self.synthesis().resolve_api_key().is_none() {
            warnings.push("Synthesis has no API key configured".to_string());
        }
        if self.intake.is_none() {
            warnings.push("No intake service configured; records are only stored locally".to_string());
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
            if gw.max_calls == 0 {
                errors.push("gateway.max_calls must be at least 1".to_string());
            }
        }

        let endpoint = self.endpoint();
        if endpoint.frame_ms == 0 {
            errors.push("endpoint.frame_ms cannot be 0".to_string());
        }
        if !(1..=4).contains(&endpoint.min_votes) {
            errors.push(format!(
                "endpoint.min_votes must be between 1 and 4, got {}",
                endpoint.min_votes
            ));
        }
        if self.playback_frame_ms() == 0 {
            errors.push("playback.frame_ms cannot be 0".to_string());
        }

        (warnings, errors)
    }
}

/// Base directory for Dial 112 data: `~/.dial112/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dial112")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, the variable name is unique to this test
        unsafe { std::env::set_var("TEST_D112_KEY", "sk-test-123") };
        let input = r#"{"key": "${TEST_D112_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("sk-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_D112_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_D112_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway_port(), 8000);
        assert_eq!(config.max_calls(), 64);
        assert_eq!(config.playback_frame_ms(), 20);
        assert_eq!(config.greeting().as_deref(), Some(DEFAULT_GREETING));
        assert_eq!(config.unknown_caller(), "unknown");
        assert_eq!(config.recognition().sample_rate, 16000);
    }

    #[test]
    fn test_endpoint_defaults_from_empty_section() {
        let config = Config::parse(r#"{ endpoint: {} }"#).unwrap();
        let endpoint = config.endpoint();
        assert_eq!(endpoint, EndpointConfig::default());
        assert_eq!(endpoint.frame_ms, 40);
        assert_eq!(endpoint.silence_ms, 1500);
        assert_eq!(endpoint.min_utterance_ms, 800);
        assert_eq!(endpoint.min_votes, 2);
    }

    #[test]
    fn test_endpoint_override() {
        let config = Config::parse(
            r#"{
                endpoint: { silence_ms: 900, rms_threshold: 350.5 },
                playback: { frame_ms: 30 },
            }"#,
        )
        .unwrap();
        let endpoint = config.endpoint();
        assert_eq!(endpoint.silence_ms, 900);
        assert_eq!(endpoint.rms_threshold, 350.5);
        assert_eq!(endpoint.min_utterance_ms, 800);
        assert_eq!(config.playback_frame_ms(), 30);
    }

    #[test]
    fn test_empty_greeting_disables() {
        let config = Config::parse(r#"{ call: { greeting: "  " } }"#).unwrap();
        assert!(config.greeting().is_none());
    }

    #[test]
    fn test_resolve_api_key_prefers_direct_value() {
        // SAFETY: test-only, the variable name is unique to this test
        unsafe { std::env::set_var("TEST_D112_STT_KEY", "from-env") };
        let from_env = RecognitionConfig {
            api_key_env: Some("TEST_D112_STT_KEY".into()),
            ..RecognitionConfig::default()
        };
        assert_eq!(from_env.resolve_api_key(), Some("from-env".into()));

        let direct = RecognitionConfig {
            api_key: Some("direct-key".into()),
            api_key_env: Some("TEST_D112_STT_KEY".into()),
            ..RecognitionConfig::default()
        };
        assert_eq!(direct.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("TEST_D112_STT_KEY") };
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = Config::parse(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_validate_bad_votes_and_port() {
        let config = Config {
            gateway: Some(GatewayConfig {
                port: 0,
                bind: None,
                public_url: None,
                max_calls: 4,
            }),
            endpoint: Some(EndpointConfig {
                min_votes: 5,
                ..EndpointConfig::default()
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("port")));
        assert!(errors.iter().any(|e| e.contains("min_votes")));
    }

    #[test]
    fn test_validate_missing_keys_warns() {
        let (warnings, errors) = Config::default().validate();
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
        assert!(
            warnings.iter().any(|w| w.contains("Synthesis")),
            "expected a synthesis key warning, got: {warnings:?}"
        );
    }

    #[test]
    fn test_recordings_dir_override() {
        let config = Config::parse(r#"{ recordings: { dir: "/var/lib/dial112" } }"#).unwrap();
        assert_eq!(config.recordings_dir(), PathBuf::from("/var/lib/dial112"));
    }
}
