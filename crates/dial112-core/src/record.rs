//! Conversation transcript entries and the final call record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who said a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Caller,
    Assistant,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Caller => "caller",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the call transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    pub speaker: Speaker,
    pub text: String,
}

impl TranscriptEntry {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            speaker,
            text: text.into(),
        }
    }
}

/// The immutable artifact produced when a call is finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub call_id: String,
    pub stream_sid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    /// Path of the assembled conversation audio, if any audio was recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_recording: Option<String>,
    /// Ticket identifier returned by the intake service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    pub conversation: Vec<TranscriptEntry>,
}

impl ConversationRecord {
    /// Flatten the transcript into `"speaker: text speaker: text"` form.
    pub fn transcript_paragraph(&self) -> String {
        transcript_paragraph(&self.conversation)
    }

    pub fn summary(&self) -> RecordingSummary {
        RecordingSummary {
            call_id: self.call_id.clone(),
            caller_id: self.caller_id.clone(),
            start_time: self.start_time,
            duration_seconds: self.duration_seconds,
            conversation_entries: self.conversation.len(),
            conversation_recording: self.conversation_recording.clone(),
            ticket_id: self.ticket_id.clone(),
        }
    }
}

pub fn transcript_paragraph(entries: &[TranscriptEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{}: {}", e.speaker, e.text))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Listing view of a stored record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSummary {
    pub call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub conversation_entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_recording: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paragraph_format() {
        let entries = vec![
            TranscriptEntry::new(Speaker::Assistant, "How can I help?"),
            TranscriptEntry::new(Speaker::Caller, "There was an accident."),
        ];
        assert_eq!(
            transcript_paragraph(&entries),
            "assistant: How can I help? caller: There was an accident."
        );
    }

    #[test]
    fn test_speaker_serializes_snake_case() {
        let entry = TranscriptEntry::new(Speaker::Caller, "hi");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["speaker"], "caller");
    }
}
