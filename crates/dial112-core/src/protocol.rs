//! Telephony media-stream wire protocol.
//!
//! The provider speaks JSON envelopes over a WebSocket, discriminated by the
//! `event` field. Inbound audio arrives as base64 µ-law in `media` events;
//! outbound audio is sent back the same way, one fixed-duration frame per
//! message.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// An envelope received from the telephony provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundEvent {
    /// First message on a new socket, before any stream metadata.
    Connected {
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        version: Option<String>,
    },

    /// Stream metadata; opens a call session.
    Start {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        start: StartMeta,
    },

    /// One chunk of inbound caller audio.
    Media {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        media: MediaPayload,
    },

    /// Acknowledgement of an outbound mark.
    Mark {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        mark: MarkPayload,
    },

    /// The call ended.
    Stop {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        #[serde(default)]
        stop: Option<StopMeta>,
    },

    /// Anything else the provider may add; ignored.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMeta {
    /// Empty when the provider only sends the envelope-level `streamSid`.
    #[serde(default)]
    pub stream_sid: String,
    #[serde(default)]
    pub call_sid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub tracks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_format: Option<MediaFormat>,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    /// Base64-encoded µ-law audio.
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl MediaPayload {
    /// Decode the base64 payload into raw µ-law bytes.
    pub fn decode(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(self.payload.as_bytes())
            .map_err(|e| DispatchError::MalformedInput(format!("media payload: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_sid: Option<String>,
}

/// An envelope sent back to the telephony provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundEvent {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkPayload,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMedia {
    pub payload: String,
}

impl OutboundEvent {
    /// Wrap one µ-law frame for sending.
    pub fn media(stream_sid: &str, frame: &[u8]) -> Self {
        Self::Media {
            stream_sid: stream_sid.to_string(),
            media: OutboundMedia {
                payload: BASE64.encode(frame),
            },
        }
    }

    pub fn mark(stream_sid: &str, name: &str) -> Self {
        Self::Mark {
            stream_sid: stream_sid.to_string(),
            mark: MarkPayload {
                name: name.to_string(),
            },
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Parse one text message from the media socket.
pub fn parse_inbound(text: &str) -> Result<InboundEvent> {
    serde_json::from_str(text).map_err(|e| DispatchError::MalformedInput(format!("envelope: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_event() {
        let text = r#"{
            "event": "start",
            "sequenceNumber": "1",
            "streamSid": "MZ123",
            "start": {
                "streamSid": "MZ123",
                "callSid": "CA456",
                "accountSid": "AC789",
                "tracks": ["inbound"],
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1},
                "customParameters": {}
            }
        }"#;
        match parse_inbound(text).unwrap() {
            InboundEvent::Start { start, .. } => {
                assert_eq!(start.stream_sid, "MZ123");
                assert_eq!(start.call_sid, "CA456");
                assert_eq!(start.media_format.unwrap().sample_rate, 8000);
            }
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_start_without_inner_stream_sid() {
        let text = r#"{"event":"start","streamSid":"MZ7","start":{"callSid":"CA7"}}"#;
        match parse_inbound(text).unwrap() {
            InboundEvent::Start { stream_sid, start } => {
                assert_eq!(stream_sid.as_deref(), Some("MZ7"));
                assert!(start.stream_sid.is_empty());
                assert_eq!(start.call_sid, "CA7");
            }
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_media_event_and_decode() {
        let text = r#"{"event":"media","streamSid":"MZ1","media":{"track":"inbound","chunk":"2","timestamp":"40","payload":"//9/fw=="}}"#;
        match parse_inbound(text).unwrap() {
            InboundEvent::Media { media, stream_sid } => {
                assert_eq!(stream_sid.as_deref(), Some("MZ1"));
                assert_eq!(media.decode().unwrap(), vec![0xFF, 0xFF, 0x7F, 0x7F]);
            }
            other => panic!("expected media, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_base64_is_malformed() {
        let payload = MediaPayload {
            payload: "not base64!!".into(),
            track: None,
            chunk: None,
            timestamp: None,
        };
        assert!(matches!(payload.decode(), Err(DispatchError::MalformedInput(_))));
    }

    #[test]
    fn test_unknown_event_is_tolerated() {
        let event = parse_inbound(r#"{"event":"dtmf","dtmf":{"digit":"1"}}"#).unwrap();
        assert!(matches!(event, InboundEvent::Unknown));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(parse_inbound("{not json"), Err(DispatchError::MalformedInput(_))));
        assert!(matches!(
            parse_inbound(r#"{"no_event": true}"#),
            Err(DispatchError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_outbound_media_shape() {
        let json = OutboundEvent::media("MZ9", &[0xFF; 3]).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["event"], "media");
        assert_eq!(value["streamSid"], "MZ9");
        assert_eq!(value["media"]["payload"], "////");
    }
}
