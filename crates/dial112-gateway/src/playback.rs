//! Per-call playback worker.
//!
//! Greeting and replies are queued as jobs and played one after another on
//! a single task, so two lines never interleave on the wire. After each job a
//! mark named after its label is sent so the provider acknowledges the end of
//! that audio. A job's [`TurnGuard`] is released once the job is done with,
//! whether it played out, was cancelled, or never started.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dial112_core::protocol::OutboundEvent;
use dial112_media::playback::{FrameSink, PlaybackError, PlaybackScheduler};

use crate::orchestrator::TurnGuard;

/// Writes frames as outbound `media` envelopes onto the socket's send queue.
pub struct WsFrameSink {
    stream_sid: String,
    outbound: mpsc::UnboundedSender<String>,
}

impl WsFrameSink {
    pub fn new(stream_sid: &str, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            stream_sid: stream_sid.to_string(),
            outbound,
        }
    }

    fn send_event(&self, event: OutboundEvent) -> Result<(), PlaybackError> {
        let json = event
            .to_json()
            .map_err(|e| PlaybackError::SinkClosed(e.to_string()))?;
        self.outbound
            .send(json)
            .map_err(|_| PlaybackError::SinkClosed("socket send queue closed".into()))
    }

    pub fn send_mark(&self, name: &str) -> Result<(), PlaybackError> {
        self.send_event(OutboundEvent::mark(&self.stream_sid, name))
    }
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), PlaybackError> {
        self.send_event(OutboundEvent::media(&self.stream_sid, frame))
    }
}

/// One line of µ-law audio to play.
#[derive(Debug)]
pub struct PlaybackJob {
    pub label: String,
    pub audio: Vec<u8>,
    pub guard: Option<TurnGuard>,
}

impl PlaybackJob {
    pub fn new(label: impl Into<String>, audio: Vec<u8>) -> Self {
        Self {
            label: label.into(),
            audio,
            guard: None,
        }
    }
}

/// Spawn the playback worker. It runs until the job sender is dropped, the
/// token is cancelled, or the socket goes away.
pub fn spawn_playback_worker(
    scheduler: PlaybackScheduler,
    mut sink: WsFrameSink,
    cancel: CancellationToken,
) -> (mpsc::UnboundedSender<PlaybackJob>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<PlaybackJob>();

    let handle = tokio::spawn(async move {
        loop {
            let job = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let played = scheduler.play(&mut sink, &job.audio, &cancel).await;
            drop(job.guard);
            match played {
                Ok(report) => {
                    debug!(
                        stream_sid = %sink.stream_sid,
                        label = %job.label,
                        frames = report.frames_sent,
                        "Played"
                    );
                    if sink.send_mark(&job.label).is_err() {
                        break;
                    }
                }
                Err(PlaybackError::Cancelled { sent }) => {
                    debug!(stream_sid = %sink.stream_sid, label = %job.label, sent, "Playback cancelled");
                    break;
                }
                Err(e) => {
                    warn!(stream_sid = %sink.stream_sid, label = %job.label, %e, "Playback aborted");
                    break;
                }
            }
        }
    });

    (tx, handle)
}
