//! Per-call conversation recorder.
//!
//! Collects transcript entries and decoded audio segments (caller and
//! assistant, 8 kHz linear) in arrival order. Finalizing assembles the audio
//! into one WAV, files the conversation with intake, and stores the record.
//! Finalize runs its side effects at most once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{error, info, warn};

use dial112_core::record::{ConversationRecord, Speaker, TranscriptEntry, transcript_paragraph};
use dial112_core::recording_store::RecordingStore;
use dial112_media::wav;
use dial112_services::{IntakeRequest, IntakeService, intake};

pub struct ConversationRecorder {
    call_id: String,
    stream_sid: String,
    caller_id: Option<String>,
    start_time: DateTime<Utc>,
    entries: Vec<TranscriptEntry>,
    segments: Vec<Vec<i16>>,
    finalized: bool,
}

impl ConversationRecorder {
    pub fn new(call_id: &str, stream_sid: &str, caller_id: Option<String>) -> Self {
        Self {
            call_id: call_id.to_string(),
            stream_sid: stream_sid.to_string(),
            caller_id,
            start_time: Utc::now(),
            entries: Vec::new(),
            segments: Vec::new(),
            finalized: false,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn add_entry(&mut self, speaker: Speaker, text: &str) {
        if self.finalized {
            warn!(call_id = %self.call_id, "Transcript entry after finalize dropped");
            return;
        }
        info!(call_id = %self.call_id, %speaker, text, "Transcript entry");
        self.entries.push(TranscriptEntry::new(speaker, text));
    }

    pub fn add_audio(&mut self, pcm: Vec<i16>) {
        if self.finalized || pcm.is_empty() {
            return;
        }
        self.segments.push(pcm);
    }

    /// All segments joined into one 8 kHz track.
    pub fn assemble_audio(&self) -> Vec<i16> {
        self.segments.concat()
    }

    /// Persist the call and hand it to intake. Returns the record the first
    /// time, `None` on every later call.
    pub async fn finalize(
        &mut self,
        store: &RecordingStore,
        intake: Option<&Arc<dyn IntakeService>>,
    ) -> Option<ConversationRecord> {
        if self.finalized {
            return None;
        }
        self.finalized = true;

        let end_time = Utc::now();
        let duration_seconds = (end_time - self.start_time).num_milliseconds() as f64 / 1000.0;

        let conversation_recording = if self.segments.is_empty() {
            None
        } else {
            let wav = wav::pcm_to_wav(&self.assemble_audio(), dial112_media::codec::SAMPLE_RATE);
            match store.save_audio(&self.call_id, &wav).await {
                Ok(path) => Some(path.display().to_string()),
                Err(e) => {
                    error!(call_id = %self.call_id, %e, "Failed to save conversation audio");
                    None
                }
            }
        };

        let mut record = ConversationRecord {
            call_id: self.call_id.clone(),
            stream_sid: self.stream_sid.clone(),
            caller_id: self.caller_id.clone(),
            start_time: self.start_time,
            end_time,
            duration_seconds,
            conversation_recording,
            ticket_id: None,
            conversation: std::mem::take(&mut self.entries),
        };
        self.segments.clear();

        if let Some(intake) = intake {
            let request = self.intake_request(&record);
            match intake.submit(&request).await {
                Ok(ticket) => record.ticket_id = Some(ticket),
                Err(e) => error!(call_id = %self.call_id, %e, "Intake submission failed"),
            }
        }

        if let Err(e) = store.save(&record).await {
            error!(call_id = %self.call_id, %e, "Failed to save conversation record");
        }

        info!(
            call_id = %record.call_id,
            entries = record.conversation.len(),
            duration_s = record.duration_seconds,
            ticket_id = record.ticket_id.as_deref().unwrap_or("-"),
            "Conversation finalized"
        );
        Some(record)
    }

    fn intake_request(&self, record: &ConversationRecord) -> IntakeRequest {
        let suffix = rand::rng().random_range(100..1000u16);
        IntakeRequest {
            call_id: record.call_id.clone(),
            caller_id: record.caller_id.clone(),
            source: intake::source_label(record.caller_id.as_deref()),
            ticket_hint: intake::ticket_hint(record.end_time, suffix),
            transcript: transcript_paragraph(&record.conversation),
            start_time: record.start_time,
            end_time: record.end_time,
        }
    }
}
