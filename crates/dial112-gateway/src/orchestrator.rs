//! Turn orchestration: recognize a finished utterance, ask dialogue for a
//! reply, synthesize it, and hand the results back to the owning session.
//!
//! Turns run as background tasks. They never touch session state directly;
//! every result goes back over the session's update channel, and a closed
//! channel means the call has ended and the turn stops producing output.
//!
//! The in-flight flag stays set from the dialogue request until the reply
//! has finished playing: the [`TurnGuard`] rides along with the reply into
//! the playback queue.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use dial112_media::endpoint::Utterance;
use dial112_media::{codec, dsp};
use dial112_services::{Collaborators, ServiceError};

use crate::hygiene;

/// A synthesized line ready for playback and recording.
#[derive(Debug, Clone, PartialEq)]
pub struct Speech {
    pub text: String,
    /// Conditioned 8 kHz linear audio, for the recording.
    pub pcm: Vec<i16>,
    /// µ-law bytes, for the wire.
    pub audio: Vec<u8>,
}

/// Results a turn task reports back to its session.
#[derive(Debug)]
pub enum SessionUpdate {
    CallerSaid {
        turn_id: u64,
        text: String,
        pcm: Vec<i16>,
    },
    AssistantSaid {
        label: String,
        speech: Speech,
        /// Held until the line has been played. `None` for the greeting.
        guard: Option<TurnGuard>,
    },
}

/// Utterance audio handed to turn tasks whose transcript has not reached
/// the session yet, keyed by turn id.
///
/// The session removes an entry when it applies the matching
/// [`SessionUpdate::CallerSaid`]; a turn removes its own entry when it
/// concludes there is nothing to report. Whatever is left when the call
/// closes is transcribed by the session itself.
#[derive(Debug, Clone, Default)]
pub struct PendingUtterances(Arc<Mutex<BTreeMap<u64, Vec<u8>>>>);

impl PendingUtterances {
    pub fn insert(&self, turn_id: u64, audio: Vec<u8>) {
        self.lock().insert(turn_id, audio);
    }

    pub fn remove(&self, turn_id: u64) {
        self.lock().remove(&turn_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drain every entry in turn order.
    pub fn take_all(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.lock()).into_values().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, Vec<u8>>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What a turn task needs from its session.
#[derive(Clone)]
pub struct TurnContext {
    pub call_id: String,
    pub turn_id: u64,
    /// Dialogue history key: caller number when known, else the call id.
    pub session_key: String,
    pub in_flight: Arc<AtomicBool>,
    pub pending: PendingUtterances,
    pub updates: mpsc::UnboundedSender<SessionUpdate>,
}

/// Holds the session's in-flight flag. Dropping it clears the flag, which
/// also happens while unwinding from a panic.
#[derive(Debug)]
pub struct TurnGuard {
    flag: Arc<AtomicBool>,
}

impl TurnGuard {
    pub fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag: flag.clone() })
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Replied,
    /// Recognition produced nothing worth answering.
    NoSpeech,
    /// Another turn was already generating a reply.
    Busy,
    SessionClosed,
    Failed(&'static str),
}

impl TurnOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Replied => "replied",
            Self::NoSpeech => "no_speech",
            Self::Busy => "busy",
            Self::SessionClosed => "session_closed",
            Self::Failed(_) => "failed",
        }
    }
}

pub struct TurnOrchestrator {
    collaborators: Collaborators,
    fallback_reply: Option<String>,
}

impl TurnOrchestrator {
    pub fn new(collaborators: Collaborators, fallback_reply: Option<String>) -> Self {
        Self {
            collaborators,
            fallback_reply,
        }
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Transcribe µ-law utterance audio. `Ok(None)` means nothing usable
    /// was said.
    pub async fn recognize(&self, audio: &[u8]) -> Result<Option<String>, ServiceError> {
        let pcm = codec::decode(audio);
        self.recognize_pcm(&pcm).await
    }

    async fn recognize_pcm(&self, pcm: &[i16]) -> Result<Option<String>, ServiceError> {
        let recognizer = &self.collaborators.recognizer;
        let rate = recognizer.sample_rate();
        let resampled = dsp::resample(pcm, codec::SAMPLE_RATE, rate)
            .map_err(|e| ServiceError::Codec(e.to_string()))?;

        let transcript = observe("recognition", recognizer.transcribe(&resampled, rate)).await?;
        debug!(
            text = %transcript.text,
            confidence = transcript.confidence.unwrap_or(-1.0),
            "Recognizer returned"
        );
        Ok(hygiene::clean_transcript(&transcript.text))
    }

    /// Synthesize `text` and prepare it for the telephony leg.
    pub async fn speak(&self, text: &str) -> Result<Speech, ServiceError> {
        let synthesized = observe("synthesis", self.collaborators.synthesizer.synthesize(text)).await?;
        let pcm = dsp::condition_for_telephony(&synthesized.samples, synthesized.sample_rate)
            .map_err(|e| ServiceError::Codec(e.to_string()))?;
        let audio = codec::encode_limited(&pcm);
        Ok(Speech {
            text: text.to_string(),
            pcm,
            audio,
        })
    }

    async fn reply_to(&self, text: &str, session_key: &str) -> Option<String> {
        match observe("dialogue", self.collaborators.dialogue.respond(text, session_key)).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!(%e, "Dialogue failed");
                self.fallback_reply.clone()
            }
        }
    }

    /// Run one full turn for a completed utterance.
    pub async fn run_turn(&self, ctx: &TurnContext, utterance: Utterance) -> TurnOutcome {
        let outcome = self.run_turn_inner(ctx, utterance).await;
        debug!(call_id = %ctx.call_id, outcome = outcome.label(), "Turn finished");

        #[cfg(feature = "metrics")]
        crate::metrics::record_turn(outcome.label());

        outcome
    }

    async fn run_turn_inner(&self, ctx: &TurnContext, utterance: Utterance) -> TurnOutcome {
        let pcm = codec::decode(&utterance.audio);
        let text = match self.recognize_pcm(&pcm).await {
            Ok(Some(text)) => text,
            Ok(None) => {
                info!(call_id = %ctx.call_id, "No meaningful transcript");
                ctx.pending.remove(ctx.turn_id);
                return TurnOutcome::NoSpeech;
            }
            Err(e) => {
                warn!(call_id = %ctx.call_id, %e, "Recognition failed");
                ctx.pending.remove(ctx.turn_id);
                return TurnOutcome::Failed("recognition");
            }
        };

        let caller_said = SessionUpdate::CallerSaid {
            turn_id: ctx.turn_id,
            text: text.clone(),
            pcm,
        };
        if ctx.updates.send(caller_said).is_err() {
            return TurnOutcome::SessionClosed;
        }

        let Some(guard) = TurnGuard::try_acquire(&ctx.in_flight) else {
            info!(call_id = %ctx.call_id, "Reply already in progress, not answering this utterance");
            return TurnOutcome::Busy;
        };

        let Some(reply) = self.reply_to(&text, &ctx.session_key).await else {
            return TurnOutcome::Failed("dialogue");
        };
        if ctx.updates.is_closed() {
            return TurnOutcome::SessionClosed;
        }

        let speech = match self.speak(&reply).await {
            Ok(speech) => speech,
            Err(e) => {
                warn!(call_id = %ctx.call_id, %e, "Synthesis failed");
                return TurnOutcome::Failed("synthesis");
            }
        };

        let update = SessionUpdate::AssistantSaid {
            label: "reply".into(),
            speech,
            guard: Some(guard),
        };
        if ctx.updates.send(update).is_err() {
            return TurnOutcome::SessionClosed;
        }
        TurnOutcome::Replied
    }
}

/// Await a collaborator call, recording its latency when metrics are on.
async fn observe<T, F>(service: &'static str, fut: F) -> T
where
    F: Future<Output = T>,
{
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let out = fut.await;

    #[cfg(feature = "metrics")]
    crate::metrics::record_collaborator(service, start.elapsed().as_secs_f64());
    #[cfg(not(feature = "metrics"))]
    let _ = service;

    out
}
