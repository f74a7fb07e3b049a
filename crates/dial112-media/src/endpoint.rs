//! Utterance endpointing over inbound telephony audio.
//!
//! Each fixed-length frame is classified by four votes (energy, RMS, peak,
//! zero crossings). The detector moves Idle → Speaking on the first speech
//! frame and back to Idle once silence has lasted long enough *and* the
//! utterance has run for a minimum time. Timing is derived from the number of
//! frames seen, so the detector is deterministic for a given input.

use std::time::Duration;

use dial112_core::config::EndpointConfig;
use tracing::{debug, info};

use crate::codec::{self, CodecError};
use crate::dsp;

/// Frames between detector statistics log lines.
const STATS_LOG_INTERVAL: u64 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    Idle,
    Speaking,
}

/// Per-frame measurements and the resulting vote count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameStats {
    pub rms: f64,
    pub energy_db: f64,
    pub peak: i32,
    pub zero_crossings: u32,
    pub votes: u8,
}

/// A completed utterance, still in wire encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    /// µ-law bytes from the first speech frame through the closing silence.
    pub audio: Vec<u8>,
    /// Media time of the first speech frame.
    pub started_at: Duration,
    /// From the first speech frame to the end of the last one.
    pub speech_duration: Duration,
}

impl Utterance {
    /// Duration of everything buffered, trailing silence included.
    pub fn total_duration(&self) -> Duration {
        Duration::from_millis(self.audio.len() as u64 * 1000 / codec::SAMPLE_RATE as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EndpointEvent {
    SpeechStarted { at: Duration },
    UtteranceEnded(Utterance),
    /// Speech closed but was too short to be worth recognizing.
    Discarded { bytes: usize },
}

pub struct EndpointDetector {
    config: EndpointConfig,
    frame_len: usize,
    frame_duration: Duration,
    state: DetectorState,
    /// Inbound bytes not yet forming a whole frame.
    pending: Vec<u8>,
    /// Bytes of the utterance in progress. Empty while idle.
    buffer: Vec<u8>,
    frames_seen: u64,
    speech_start: Duration,
    silence_start: Option<Duration>,
    last_speech_end: Duration,
}

impl EndpointDetector {
    pub fn new(config: EndpointConfig) -> Self {
        let frame_len = codec::frame_bytes(config.frame_ms);
        let frame_duration = Duration::from_millis(config.frame_ms as u64);
        Self {
            config,
            frame_len,
            frame_duration,
            state: DetectorState::Idle,
            pending: Vec::new(),
            buffer: Vec::new(),
            frames_seen: 0,
            speech_start: Duration::ZERO,
            silence_start: None,
            last_speech_end: Duration::ZERO,
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn is_speaking(&self) -> bool {
        self.state == DetectorState::Speaking
    }

    /// Bytes per analysis frame.
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Media time covered by the frames analysed so far.
    pub fn elapsed(&self) -> Duration {
        self.frame_duration * self.frames_seen as u32
    }

    /// Compute the frame measurements and count the votes.
    pub fn analyze(&self, pcm: &[i16]) -> FrameStats {
        let rms = dsp::rms(pcm);
        let energy_db = dsp::dbfs(rms);
        let peak = dsp::peak(pcm);
        let zero_crossings = dsp::zero_crossings(pcm);

        let votes = [
            energy_db > self.config.energy_db_threshold,
            rms > self.config.rms_threshold,
            peak > self.config.peak_threshold,
            zero_crossings > self.config.zero_crossing_threshold,
        ]
        .iter()
        .filter(|&&v| v)
        .count() as u8;

        FrameStats {
            rms,
            energy_db,
            peak,
            zero_crossings,
            votes,
        }
    }

    /// Append raw inbound bytes and run every whole frame through the detector.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<EndpointEvent> {
        self.pending.extend_from_slice(bytes);
        let whole = self.pending.len() - self.pending.len() % self.frame_len.max(1);
        if whole == 0 || self.frame_len == 0 {
            return Vec::new();
        }

        let ready: Vec<u8> = self.pending.drain(..whole).collect();
        let mut events = Vec::new();
        for frame in ready.chunks_exact(self.frame_len) {
            // Chunks are exactly frame_len, so this cannot fail.
            if let Ok(Some(event)) = self.process_frame(frame) {
                events.push(event);
            }
        }
        events
    }

    /// Classify one frame and advance the state machine.
    pub fn process_frame(&mut self, frame: &[u8]) -> Result<Option<EndpointEvent>, CodecError> {
        let pcm = codec::decode_frame(frame, self.frame_len)?;
        let stats = self.analyze(&pcm);
        let is_speech = stats.votes >= self.config.min_votes;

        let frame_start = self.elapsed();
        self.frames_seen += 1;
        let frame_end = self.elapsed();

        if self.frames_seen % STATS_LOG_INTERVAL == 0 {
            debug!(
                energy_db = stats.energy_db,
                rms = stats.rms as u32,
                peak = stats.peak,
                zc = stats.zero_crossings,
                speech = is_speech,
                "Endpoint frame stats"
            );
        }

        if is_speech {
            let mut event = None;
            if self.state == DetectorState::Idle {
                self.state = DetectorState::Speaking;
                self.buffer.clear();
                self.speech_start = frame_start;
                info!(
                    at_ms = frame_start.as_millis() as u64,
                    energy_db = stats.energy_db,
                    "Speech started"
                );
                event = Some(EndpointEvent::SpeechStarted { at: frame_start });
            }
            self.buffer.extend_from_slice(frame);
            self.silence_start = None;
            self.last_speech_end = frame_end;
            return Ok(event);
        }

        if self.state == DetectorState::Idle {
            return Ok(None);
        }

        self.buffer.extend_from_slice(frame);
        let silence_start = *self.silence_start.get_or_insert(frame_start);
        let silence = frame_end - silence_start;
        let utterance_len = frame_end - self.speech_start;

        if silence >= Duration::from_millis(self.config.silence_ms)
            && utterance_len >= Duration::from_millis(self.config.min_utterance_ms)
        {
            return Ok(Some(self.close()));
        }
        Ok(None)
    }

    fn close(&mut self) -> EndpointEvent {
        let audio = std::mem::take(&mut self.buffer);
        let speech_duration = self.last_speech_end - self.speech_start;
        self.state = DetectorState::Idle;
        self.silence_start = None;

        if audio.len() > self.config.min_utterance_bytes {
            info!(
                bytes = audio.len(),
                speech_ms = speech_duration.as_millis() as u64,
                "Utterance ended"
            );
            EndpointEvent::UtteranceEnded(Utterance {
                audio,
                started_at: self.speech_start,
                speech_duration,
            })
        } else {
            debug!(bytes = audio.len(), "Utterance below size floor, discarded");
            EndpointEvent::Discarded { bytes: audio.len() }
        }
    }

    /// End-of-call flush: hand back a pending utterance of at least
    /// `min_bytes`, and reset in any case.
    pub fn flush(&mut self, min_bytes: usize) -> Option<Utterance> {
        let speaking = self.is_speaking();
        let audio = std::mem::take(&mut self.buffer);
        let speech_duration = self.last_speech_end.saturating_sub(self.speech_start);
        let started_at = self.speech_start;
        self.reset();

        if speaking && audio.len() >= min_bytes && !audio.is_empty() {
            Some(Utterance {
                audio,
                started_at,
                speech_duration,
            })
        } else {
            None
        }
    }

    /// Drop all buffered audio and return to Idle. The media clock keeps running.
    pub fn reset(&mut self) {
        self.state = DetectorState::Idle;
        self.pending.clear();
        self.buffer.clear();
        self.silence_start = None;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// One 40 ms frame of a loud 1 kHz-ish square wave, µ-law encoded.
    pub(crate) fn speech_frame() -> Vec<u8> {
        let pcm: Vec<i16> = (0..320)
            .map(|i| if (i / 4) % 2 == 0 { 6000 } else { -6000 })
            .collect();
        codec::encode(&pcm)
    }

    pub(crate) fn silence_frame() -> Vec<u8> {
        vec![codec::SILENCE_BYTE; 320]
    }

    fn detector() -> EndpointDetector {
        EndpointDetector::new(EndpointConfig::default())
    }

    fn feed(det: &mut EndpointDetector, frame: &[u8], n: usize) -> Vec<(usize, EndpointEvent)> {
        let mut events = Vec::new();
        for i in 0..n {
            if let Some(e) = det.process_frame(frame).unwrap() {
                events.push((i, e));
            }
        }
        events
    }

    #[test]
    fn test_analyze_votes() {
        let det = detector();
        let speech = det.analyze(&codec::decode(&speech_frame()));
        assert_eq!(speech.votes, 4);
        assert!(speech.peak > 2000);
        assert!(speech.zero_crossings > 8);

        let silence = det.analyze(&codec::decode(&silence_frame()));
        assert_eq!(silence.votes, 0);
        assert_eq!(silence.energy_db, -80.0);
    }

    #[test]
    fn test_hysteresis() {
        let mut det = detector();

        // N below: stays idle.
        assert!(feed(&mut det, &silence_frame(), 10).is_empty());
        assert_eq!(det.state(), DetectorState::Idle);
        assert_eq!(det.buffered_bytes(), 0);

        // M above: one start event.
        let events = feed(&mut det, &speech_frame(), 30);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].1, EndpointEvent::SpeechStarted { .. }));
        assert!(det.is_speaking());

        // K below the silence threshold: still speaking, silence is buffered.
        assert!(feed(&mut det, &silence_frame(), 20).is_empty());
        assert!(det.is_speaking());
        assert_eq!(det.buffered_bytes(), 50 * 320);

        // Speech clears the silence timer.
        assert!(feed(&mut det, &speech_frame(), 1).is_empty());
        assert!(feed(&mut det, &silence_frame(), 30).is_empty());
        assert!(det.is_speaking());

        let events = feed(&mut det, &silence_frame(), 10);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].1, EndpointEvent::UtteranceEnded(_)));
        assert_eq!(det.state(), DetectorState::Idle);
        assert_eq!(det.buffered_bytes(), 0);
    }

    #[test]
    fn test_one_second_of_speech_then_silence() {
        let mut det = detector();
        let mut events = feed(&mut det, &speech_frame(), 25);
        assert_eq!(events.len(), 1);

        // 1.6 s of silence.
        events = feed(&mut det, &silence_frame(), 40);
        assert_eq!(events.len(), 1);
        let (index, event) = &events[0];
        // Closes on the frame whose end makes silence reach 1.5 s.
        assert_eq!(25 + index, 62);
        match event {
            EndpointEvent::UtteranceEnded(u) => {
                assert_eq!(u.speech_duration, Duration::from_millis(1000));
                assert_eq!(u.started_at, Duration::ZERO);
                assert_eq!(u.audio.len(), 63 * 320);
                assert_eq!(&u.audio[..320], &speech_frame()[..]);
                assert_eq!(u.total_duration(), Duration::from_millis(2520));
            }
            other => panic!("expected utterance, got {other:?}"),
        }
    }

    #[test]
    fn test_short_utterance_waits_for_minimum_duration() {
        let mut det = detector();
        feed(&mut det, &speech_frame(), 1);
        // By the time 1.5 s of silence has passed the 0.8 s minimum is met too.
        let events = feed(&mut det, &silence_frame(), 40);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 37);
    }

    #[test]
    fn test_below_size_floor_is_discarded() {
        let config = EndpointConfig {
            silence_ms: 160,
            min_utterance_ms: 0,
            ..EndpointConfig::default()
        };
        let mut det = EndpointDetector::new(config);
        feed(&mut det, &speech_frame(), 1);
        let events = feed(&mut det, &silence_frame(), 4);
        // 5 frames * 320 bytes = 1600 > 1280, so it is kept.
        assert!(matches!(events[0].1, EndpointEvent::UtteranceEnded(_)));

        let config = EndpointConfig {
            silence_ms: 80,
            min_utterance_ms: 0,
            ..EndpointConfig::default()
        };
        let mut det = EndpointDetector::new(config);
        feed(&mut det, &speech_frame(), 1);
        let events = feed(&mut det, &silence_frame(), 2);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, EndpointEvent::Discarded { bytes: 960 });
        assert!(!det.is_speaking());
    }

    #[test]
    fn test_push_splits_frames_and_keeps_remainder() {
        let mut det = detector();
        let frame = speech_frame();
        assert!(det.push(&frame[..100]).is_empty());
        let events = det.push(&frame[100..]);
        assert_eq!(events.len(), 1);
        assert_eq!(det.buffered_bytes(), 320);
        assert_eq!(det.elapsed(), Duration::from_millis(40));
    }

    #[test]
    fn test_flush() {
        let mut det = detector();
        assert!(det.flush(800).is_none());

        feed(&mut det, &speech_frame(), 3);
        let u = det.flush(800).unwrap();
        assert_eq!(u.audio.len(), 960);
        assert!(!det.is_speaking());
        assert_eq!(det.buffered_bytes(), 0);

        feed(&mut det, &speech_frame(), 2);
        assert!(det.flush(800).is_none());
        assert!(!det.is_speaking());
    }

    #[test]
    fn test_wrong_frame_length_is_rejected() {
        let mut det = detector();
        assert!(det.process_frame(&[0xFF; 100]).is_err());
        assert_eq!(det.elapsed(), Duration::ZERO);
    }
}
