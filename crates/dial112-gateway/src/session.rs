//! One live call: detector, recorder, playback worker and turn tasks.
//!
//! A `CallSession` is owned by its media-socket task and is only mutated
//! there. Turn tasks report back through [`SessionUpdate`]s that the socket
//! task applies in order.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dial112_core::error::Result;
use dial112_core::record::{ConversationRecord, Speaker};
use dial112_media::codec;
use dial112_media::endpoint::{EndpointDetector, EndpointEvent, Utterance};

use crate::orchestrator::{PendingUtterances, SessionUpdate, TurnContext, TurnOutcome};
use crate::playback::{PlaybackJob, WsFrameSink, spawn_playback_worker};
use crate::recorder::ConversationRecorder;
use crate::registry::SessionHandle;
use crate::state::GatewayState;

/// Inbound media messages between progress log lines.
const MEDIA_LOG_INTERVAL: u64 = 100;

pub struct CallSession {
    stream_sid: String,
    call_id: String,
    caller_id: Option<String>,
    detector: EndpointDetector,
    recorder: ConversationRecorder,
    in_flight: Arc<AtomicBool>,
    pending: PendingUtterances,
    next_turn_id: u64,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    playback: mpsc::UnboundedSender<PlaybackJob>,
    playback_task: JoinHandle<()>,
    turns: JoinSet<TurnOutcome>,
    cancel: CancellationToken,
    media_messages: u64,
    dropped_messages: u64,
    closed: bool,
}

impl CallSession {
    /// Create and register the session for a `start` event.
    ///
    /// Outbound envelopes go to `outbound`. The returned receiver carries
    /// turn results and must be drained into [`CallSession::apply`].
    pub async fn open(
        state: &Arc<GatewayState>,
        stream_sid: &str,
        call_sid: &str,
        caller_hint: Option<String>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionUpdate>)> {
        let call_id = format!("{stream_sid}_{}", Utc::now().timestamp());
        let caller_id = match state.callers.take(call_sid).await {
            Some(caller) => Some(caller),
            None => caller_hint,
        };
        let cancel = state.shutdown.child_token();

        state
            .registry
            .register(
                stream_sid,
                SessionHandle {
                    call_id: call_id.clone(),
                    caller_id: caller_id.clone(),
                    started_at: Utc::now(),
                    cancel: cancel.clone(),
                },
            )
            .await?;

        let (playback, playback_task) = spawn_playback_worker(
            state.scheduler,
            WsFrameSink::new(stream_sid, outbound),
            cancel.clone(),
        );
        let (updates, updates_rx) = mpsc::unbounded_channel();

        let caller_label = caller_id
            .clone()
            .unwrap_or_else(|| state.config.unknown_caller());
        info!(stream_sid, call_id = %call_id, caller = %caller_label, "Call session opened");

        #[cfg(feature = "metrics")]
        crate::metrics::record_call_start();

        let session = Self {
            stream_sid: stream_sid.to_string(),
            recorder: ConversationRecorder::new(&call_id, stream_sid, caller_id.clone()),
            detector: EndpointDetector::new(state.endpoint.clone()),
            call_id,
            caller_id,
            in_flight: Arc::new(AtomicBool::new(false)),
            pending: PendingUtterances::default(),
            next_turn_id: 0,
            updates,
            playback,
            playback_task,
            turns: JoinSet::new(),
            cancel,
            media_messages: 0,
            dropped_messages: 0,
            closed: false,
        };
        Ok((session, updates_rx))
    }

    pub fn stream_sid(&self) -> &str {
        &self.stream_sid
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Cancelled when the gateway shuts down or the session closes.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn recorder(&self) -> &ConversationRecorder {
        &self.recorder
    }

    /// Dialogue history key: caller number when known, else the call id.
    fn session_key(&self) -> String {
        self.caller_id.clone().unwrap_or_else(|| self.call_id.clone())
    }

    fn turn_context(&self, turn_id: u64) -> TurnContext {
        TurnContext {
            call_id: self.call_id.clone(),
            turn_id,
            session_key: self.session_key(),
            in_flight: self.in_flight.clone(),
            pending: self.pending.clone(),
            updates: self.updates.clone(),
        }
    }

    /// Synthesize the configured greeting in the background and queue it.
    pub fn greet(&mut self, state: &Arc<GatewayState>) {
        let Some(greeting) = state.config.greeting() else {
            return;
        };
        let orchestrator = state.orchestrator.clone();
        let updates = self.updates.clone();
        let call_id = self.call_id.clone();

        self.turns.spawn(async move {
            match orchestrator.speak(&greeting).await {
                Ok(speech) => {
                    let update = SessionUpdate::AssistantSaid {
                        label: "greeting".into(),
                        speech,
                        guard: None,
                    };
                    if updates.send(update).is_err() {
                        return TurnOutcome::SessionClosed;
                    }
                    TurnOutcome::Replied
                }
                Err(e) => {
                    warn!(call_id = %call_id, %e, "Greeting synthesis failed");
                    TurnOutcome::Failed("synthesis")
                }
            }
        });
    }

    /// Feed one inbound media payload through the endpoint detector.
    pub fn ingest(&mut self, state: &Arc<GatewayState>, audio: &[u8]) {
        if self.closed {
            return;
        }
        self.media_messages += 1;
        if self.media_messages % MEDIA_LOG_INTERVAL == 0 {
            debug!(
                stream_sid = %self.stream_sid,
                messages = self.media_messages,
                dropped = self.dropped_messages,
                speaking = self.detector.is_speaking(),
                "Media progress"
            );
        }

        for event in self.detector.push(audio) {
            match event {
                EndpointEvent::SpeechStarted { at } => {
                    debug!(call_id = %self.call_id, at_ms = at.as_millis() as u64, "Caller speaking");
                }
                EndpointEvent::UtteranceEnded(utterance) => self.spawn_turn(state, utterance),
                EndpointEvent::Discarded { bytes } => {
                    debug!(call_id = %self.call_id, bytes, "Short utterance ignored");
                }
            }
        }
        self.reap_turns();
    }

    /// Count an inbound media message that could not be decoded.
    pub fn drop_message(&mut self) {
        self.dropped_messages += 1;

        #[cfg(feature = "metrics")]
        crate::metrics::record_frames_dropped(1);
    }

    fn spawn_turn(&mut self, state: &Arc<GatewayState>, utterance: Utterance) {
        self.next_turn_id += 1;
        let turn_id = self.next_turn_id;
        self.pending.insert(turn_id, utterance.audio.clone());

        let orchestrator = state.orchestrator.clone();
        let ctx = self.turn_context(turn_id);
        debug!(
            call_id = %self.call_id,
            turn_id,
            bytes = utterance.audio.len(),
            speech_ms = utterance.speech_duration.as_millis() as u64,
            "Starting turn"
        );
        self.turns
            .spawn(async move { orchestrator.run_turn(&ctx, utterance).await });
    }

    /// Collect finished turn tasks, logging any that panicked.
    fn reap_turns(&mut self) {
        while let Some(result) = self.turns.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(call_id = %self.call_id, "Turn task panicked");
                }
            }
        }
    }

    /// Apply a result reported by a turn task.
    pub fn apply(&mut self, update: SessionUpdate) {
        if self.closed {
            return;
        }
        match update {
            SessionUpdate::CallerSaid { turn_id, text, pcm } => {
                self.pending.remove(turn_id);
                self.recorder.add_entry(Speaker::Caller, &text);
                self.recorder.add_audio(pcm);
            }
            SessionUpdate::AssistantSaid {
                label,
                speech,
                guard,
            } => {
                self.recorder.add_entry(Speaker::Assistant, &speech.text);
                self.recorder.add_audio(speech.pcm);
                let job = PlaybackJob {
                    label,
                    audio: speech.audio,
                    guard,
                };
                if self.playback.send(job).is_err() {
                    warn!(call_id = %self.call_id, "Playback worker gone, reply not played");
                }
            }
        }
        self.reap_turns();
    }

    /// Close the call: transcribe caller speech that never made it into the
    /// record, persist the record, and leave the registry. Runs once.
    ///
    /// Turn tasks are stopped first. Utterances whose transcript had not been
    /// applied yet, plus a meaningful tail still in the detector, are
    /// recognized here in order; no replies are produced.
    pub async fn finalize(&mut self, state: &Arc<GatewayState>) -> Option<ConversationRecord> {
        if self.closed {
            return None;
        }
        self.closed = true;
        self.turns.abort_all();
        while self.turns.join_next().await.is_some() {}

        let mut unheard = self.pending.take_all();
        if !unheard.is_empty() {
            debug!(call_id = %self.call_id, utterances = unheard.len(), "Transcribing interrupted turns");
        }
        if let Some(utterance) = self.detector.flush(state.endpoint.flush_min_bytes) {
            unheard.push(utterance.audio);
        }
        for audio in unheard {
            match state.orchestrator.recognize(&audio).await {
                Ok(Some(text)) => {
                    self.recorder.add_entry(Speaker::Caller, &text);
                    self.recorder.add_audio(codec::decode(&audio));
                }
                Ok(None) => debug!(call_id = %self.call_id, "Late utterance had no speech"),
                Err(e) => warn!(call_id = %self.call_id, %e, "Recognition of late utterance failed"),
            }
        }

        let record = self
            .recorder
            .finalize(&state.recordings, state.collaborators.intake.as_ref())
            .await;

        state.registry.remove(&self.stream_sid).await;
        self.cancel.cancel();
        self.playback_task.abort();

        #[cfg(feature = "metrics")]
        crate::metrics::record_call_end();

        info!(
            stream_sid = %self.stream_sid,
            call_id = %self.call_id,
            media_messages = self.media_messages,
            dropped = self.dropped_messages,
            "Call session closed"
        );
        record
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        if !self.closed {
            warn!(call_id = %self.call_id, "Call session dropped without finalize");
            self.cancel.cancel();
        }
    }
}
