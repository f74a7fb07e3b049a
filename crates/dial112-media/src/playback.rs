//! Real-time paced playback of µ-law audio.
//!
//! Audio is cut into fixed-duration frames and each frame `i` is released at
//! `start + i * frame_duration` on the tokio clock. Deadlines are computed from
//! the start instant, never from the previous send, so a slow send delays one
//! frame without shifting the ones after it.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("frame sink closed: {0}")]
    SinkClosed(String),

    #[error("playback cancelled after {sent} frames")]
    Cancelled { sent: usize },
}

/// Destination for outbound frames, usually the call's media socket.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), PlaybackError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackReport {
    pub frames_sent: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct PlaybackScheduler {
    frame_len: usize,
    frame_duration: Duration,
}

impl PlaybackScheduler {
    pub fn new(frame_ms: u32) -> Self {
        Self {
            frame_len: codec::frame_bytes(frame_ms),
            frame_duration: Duration::from_millis(frame_ms as u64),
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    /// Stream `audio` to `sink` at the frame cadence.
    ///
    /// Returns once the last frame's slot has elapsed, so back-to-back calls
    /// keep the cadence. Cancellation is honoured between frames.
    pub async fn play<S>(
        &self,
        sink: &mut S,
        audio: &[u8],
        cancel: &CancellationToken,
    ) -> Result<PlaybackReport, PlaybackError>
    where
        S: FrameSink + ?Sized,
    {
        let frames = codec::frames(audio, self.frame_len);
        let start = Instant::now();

        for (i, frame) in frames.iter().enumerate() {
            self.wait_for_slot(start, i, cancel).await?;
            sink.send_frame(frame).await?;
        }
        self.wait_for_slot(start, frames.len(), cancel).await?;

        let report = PlaybackReport {
            frames_sent: frames.len(),
            elapsed: start.elapsed(),
        };
        debug!(
            frames = report.frames_sent,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Playback finished"
        );
        Ok(report)
    }

    async fn wait_for_slot(
        &self,
        start: Instant,
        index: usize,
        cancel: &CancellationToken,
    ) -> Result<(), PlaybackError> {
        let deadline = start + self.frame_duration * index as u32;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PlaybackError::Cancelled { sent: index }),
            _ = tokio::time::sleep_until(deadline) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records the send instant of every frame and optionally stalls.
    struct RecordingSink {
        sent: Vec<(Instant, Vec<u8>)>,
        delay: fn(usize) -> Duration,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl RecordingSink {
        fn new(delay: fn(usize) -> Duration) -> Self {
            Self {
                sent: Vec::new(),
                delay,
                cancel_after: None,
            }
        }

        fn offsets_ms(&self) -> Vec<u128> {
            let t0 = self.sent[0].0;
            self.sent
                .iter()
                .map(|(t, _)| t.duration_since(t0).as_millis())
                .collect()
        }
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_frame(&mut self, frame: &[u8]) -> Result<(), PlaybackError> {
            let index = self.sent.len();
            self.sent.push((Instant::now(), frame.to_vec()));
            if let Some((n, token)) = &self.cancel_after {
                if self.sent.len() == *n {
                    token.cancel();
                }
            }
            tokio::time::sleep((self.delay)(index)).await;
            Ok(())
        }
    }

    struct ClosedSink;

    #[async_trait]
    impl FrameSink for ClosedSink {
        async fn send_frame(&mut self, _frame: &[u8]) -> Result<(), PlaybackError> {
            Err(PlaybackError::SinkClosed("socket gone".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_are_paced_at_twenty_ms() {
        let scheduler = PlaybackScheduler::new(20);
        let mut sink = RecordingSink::new(|_| Duration::ZERO);
        let audio = vec![0x55u8; 160 * 10];

        let report = scheduler
            .play(&mut sink, &audio, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.frames_sent, 10);
        assert_eq!(report.elapsed.as_millis(), 200);
        let offsets = sink.offsets_ms();
        for (i, offset) in offsets.iter().enumerate() {
            assert_eq!(*offset, i as u128 * 20);
        }
        assert!(sink.sent.iter().all(|(_, f)| f.len() == 160));
    }

    #[tokio::test(start_paused = true)]
    async fn test_variable_send_delay_does_not_accumulate_drift() {
        let scheduler = PlaybackScheduler::new(20);
        // Odd frames take 7 ms to send, frame 2 stalls for 30 ms.
        let mut sink = RecordingSink::new(|i| match i {
            2 => Duration::from_millis(30),
            i if i % 2 == 1 => Duration::from_millis(7),
            _ => Duration::ZERO,
        });
        let audio = vec![0x55u8; 160 * 8];

        scheduler
            .play(&mut sink, &audio, &CancellationToken::new())
            .await
            .unwrap();

        let offsets = sink.offsets_ms();
        assert_eq!(offsets[1], 20);
        assert_eq!(offsets[2], 40);
        // Late because frame 2 stalled...
        assert_eq!(offsets[3], 70);
        // ...but the schedule is anchored at the start, so frame 4 is on time.
        assert_eq!(offsets[4], 80);
        assert_eq!(offsets[7], 140);

        let mean = offsets[7] as f64 / 7.0;
        assert!((mean - 20.0).abs() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_frame_is_padded_with_silence() {
        let scheduler = PlaybackScheduler::new(20);
        let mut sink = RecordingSink::new(|_| Duration::ZERO);
        scheduler
            .play(&mut sink, &[0x10u8; 200], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink.sent.len(), 2);
        let last = &sink.sent[1].1;
        assert_eq!(last.len(), 160);
        assert!(last[..40].iter().all(|&b| b == 0x10));
        assert!(last[40..].iter().all(|&b| b == codec::SILENCE_BYTE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_between_frames() {
        let scheduler = PlaybackScheduler::new(20);
        let cancel = CancellationToken::new();
        let mut sink = RecordingSink::new(|_| Duration::ZERO);
        sink.cancel_after = Some((3, cancel.clone()));

        let result = scheduler.play(&mut sink, &[0u8; 160 * 10], &cancel).await;
        assert_eq!(result, Err(PlaybackError::Cancelled { sent: 3 }));
        assert_eq!(sink.sent.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_sink_aborts() {
        let scheduler = PlaybackScheduler::new(20);
        let result = scheduler
            .play(&mut ClosedSink, &[0u8; 480], &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(PlaybackError::SinkClosed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_audio_sends_nothing() {
        let scheduler = PlaybackScheduler::new(20);
        let mut sink = RecordingSink::new(|_| Duration::ZERO);
        let report = scheduler
            .play(&mut sink, &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.frames_sent, 0);
        assert!(sink.sent.is_empty());
    }
}
