//! File-based store for finalized conversation records.
//!
//! Layout:
//! - `<base>/conversation_<call_id>.json`: the [`ConversationRecord`]
//! - `<base>/conversation_<call_id>.wav`: assembled call audio

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{DispatchError, Result};
use crate::record::{ConversationRecord, RecordingSummary};

pub struct RecordingStore {
    base: PathBuf,
}

impl RecordingStore {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn record_path(&self, call_id: &str) -> PathBuf {
        self.base.join(format!("conversation_{call_id}.json"))
    }

    pub fn audio_path(&self, call_id: &str) -> PathBuf {
        self.base.join(format!("conversation_{call_id}.wav"))
    }

    async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.base).await?;
        Ok(())
    }

    /// Write the assembled call audio (a complete WAV file) and return its path.
    pub async fn save_audio(&self, call_id: &str, wav: &[u8]) -> Result<PathBuf> {
        validate_call_id(call_id)?;
        self.ensure_dir().await?;
        let path = self.audio_path(call_id);
        atomic_write(&path, wav).await?;
        debug!(call_id, bytes = wav.len(), "Saved conversation audio");
        Ok(path)
    }

    pub async fn save(&self, record: &ConversationRecord) -> Result<PathBuf> {
        validate_call_id(&record.call_id)?;
        self.ensure_dir().await?;
        let path = self.record_path(&record.call_id);
        let data = serde_json::to_string_pretty(record)?;
        atomic_write(&path, data.as_bytes()).await?;
        debug!(call_id = %record.call_id, entries = record.conversation.len(), "Saved conversation record");
        Ok(path)
    }

    pub async fn load(&self, call_id: &str) -> Result<Option<ConversationRecord>> {
        validate_call_id(call_id)?;
        let path = self.record_path(call_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    /// List stored records, newest first. Unreadable files are skipped.
    pub async fn list(&self) -> Result<Vec<RecordingSummary>> {
        if !self.base.exists() {
            return Ok(Vec::new());
        }

        let mut summaries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.base).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !(name.starts_with("conversation_") && name.ends_with(".json")) {
                continue;
            }
            let data = match tokio::fs::read_to_string(entry.path()).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(file = %name, %e, "Skipping unreadable record");
                    continue;
                }
            };
            match serde_json::from_str::<ConversationRecord>(&data) {
                Ok(record) => summaries.push(record.summary()),
                Err(e) => warn!(file = %name, %e, "Skipping corrupt record"),
            }
        }

        summaries.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(summaries)
    }
}

/// Call ids become file names; reject anything that could escape the directory.
fn validate_call_id(call_id: &str) -> Result<()> {
    let ok = !call_id.is_empty()
        && call_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(DispatchError::Recording(format!("invalid call id: {call_id:?}")))
    }
}

/// Write to a temp file then rename into place.
async fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
