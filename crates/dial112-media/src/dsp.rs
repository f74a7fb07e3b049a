//! Signal helpers shared by the recognition and synthesis paths.

use rubato::{FftFixedIn, Resampler};
use thiserror::Error;

use crate::codec;

/// Target loudness for quiet synthesized speech.
pub const TARGET_DBFS: f64 = -12.0;
/// Synthesized audio below this level gets normalized.
pub const QUIET_DBFS: f64 = -30.0;
/// Telephony bandwidth edge.
pub const LOW_PASS_HZ: f64 = 3400.0;

const FULL_SCALE: f64 = 32767.0;
const SILENCE_DBFS: f64 = -80.0;

/// Root-mean-square amplitude.
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt()
}

/// RMS level relative to full scale. Near-silent input reports -80 dBFS.
pub fn dbfs(rms: f64) -> f64 {
    if rms > 1.0 {
        20.0 * (rms / FULL_SCALE).log10()
    } else {
        SILENCE_DBFS
    }
}

pub fn peak(samples: &[i16]) -> i32 {
    samples
        .iter()
        .map(|&s| (s as i32).abs())
        .max()
        .unwrap_or(0)
}

/// Count sign changes between neighbouring samples. Zero counts as positive.
pub fn zero_crossings(samples: &[i16]) -> u32 {
    samples
        .windows(2)
        .filter(|w| (w[0] < 0) != (w[1] < 0))
        .count() as u32
}

/// Input frames per resampler pass.
const RESAMPLE_CHUNK: usize = 1024;

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("resampler setup failed: {0}")]
    Setup(#[from] rubato::ResamplerConstructionError),

    #[error("resampling failed: {0}")]
    Process(#[from] rubato::ResampleError),
}

/// Band-limited resampling of a whole buffer.
///
/// The output has `len * to / from` samples and is aligned with the input:
/// the resampler's filter delay is trimmed and the tail is zero-padded
/// through the filter. Content above the lower Nyquist frequency is removed
/// rather than folded back.
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Result<Vec<i16>, ResampleError> {
    if samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return Ok(Vec::new());
    }
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }

    let mut resampler =
        FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, RESAMPLE_CHUNK, 2, 1)?;
    let delay = resampler.output_delay();
    let wanted = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;

    let input: Vec<f32> = samples.iter().map(|&s| s as f32 / 32768.0).collect();
    let mut output: Vec<f32> = Vec::with_capacity(wanted + delay + RESAMPLE_CHUNK);
    let mut pos = 0;
    while output.len() < wanted + delay {
        let needed = resampler.input_frames_next();
        let mut chunk = vec![0.0f32; needed];
        if pos < input.len() {
            let end = (pos + needed).min(input.len());
            chunk[..end - pos].copy_from_slice(&input[pos..end]);
        }
        pos += needed;
        let resampled = resampler.process(&[chunk], None)?;
        output.extend_from_slice(&resampled[0]);
    }

    Ok(output[delay..delay + wanted]
        .iter()
        .map(|&s| clamp(s as f64 * 32768.0))
        .collect())
}

/// Subtract the mean.
pub fn remove_dc_offset(samples: &mut [i16]) {
    if samples.is_empty() {
        return;
    }
    let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / samples.len() as f64;
    if mean.abs() < 0.5 {
        return;
    }
    for s in samples.iter_mut() {
        *s = clamp(*s as f64 - mean);
    }
}

/// Bring audio quieter than [`QUIET_DBFS`] up to [`TARGET_DBFS`], bounded by
/// peak headroom. Louder audio is left alone.
pub fn normalize_quiet(samples: &mut [i16]) {
    let level = dbfs(rms(samples));
    if level >= QUIET_DBFS || level <= SILENCE_DBFS {
        return;
    }
    let peak = peak(samples);
    if peak == 0 {
        return;
    }
    let wanted = 10f64.powf((TARGET_DBFS - level) / 20.0);
    let headroom = FULL_SCALE / peak as f64;
    let gain = wanted.min(headroom);
    for s in samples.iter_mut() {
        *s = clamp(*s as f64 * gain);
    }
}

/// Single-pole low-pass filter.
pub fn low_pass(samples: &mut [i16], cutoff_hz: f64, sample_rate: u32) {
    if samples.is_empty() || sample_rate == 0 {
        return;
    }
    let dt = 1.0 / sample_rate as f64;
    let rc = 1.0 / (2.0 * std::f64::consts::PI * cutoff_hz);
    let alpha = dt / (rc + dt);

    let mut prev = samples[0] as f64;
    for s in samples.iter_mut() {
        prev += alpha * (*s as f64 - prev);
        *s = clamp(prev);
    }
}

/// Prepare synthesized speech for the telephony leg: remove DC and lift
/// quiet audio at the synthesis rate, resample to 8 kHz, then band-limit to
/// the telephony edge. The result is still linear PCM;
/// [`codec::encode_limited`] applies the limiter on the way out.
///
/// Loudness is judged before resampling so that out-of-band content the
/// resampler removes never drives the gain.
pub fn condition_for_telephony(samples: &[i16], sample_rate: u32) -> Result<Vec<i16>, ResampleError> {
    let mut source = samples.to_vec();
    remove_dc_offset(&mut source);
    normalize_quiet(&mut source);

    let mut out = resample(&source, sample_rate, codec::SAMPLE_RATE)?;
    low_pass(&mut out, LOW_PASS_HZ, codec::SAMPLE_RATE);
    Ok(out)
}

fn clamp(v: f64) -> i16 {
    v.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, amplitude: f64, rate: u32, len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| {
                let t = i as f64 / rate as f64;
                (amplitude * (2.0 * std::f64::consts::PI * freq * t).sin()) as i16
            })
            .collect()
    }

    #[test]
    fn test_rms_and_dbfs() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[1000, -1000, 1000, -1000]) - 1000.0).abs() < 1e-9);
        assert_eq!(dbfs(0.0), -80.0);
        assert!((dbfs(32767.0)).abs() < 1e-9);
        assert!((dbfs(3276.7) + 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_crossings_treat_zero_as_positive() {
        assert_eq!(zero_crossings(&[1, -1, 1, -1]), 3);
        assert_eq!(zero_crossings(&[0, 5, 0, 7]), 0);
        assert_eq!(zero_crossings(&[-1, 0, -1]), 2);
        assert_eq!(zero_crossings(&[]), 0);
    }

    #[test]
    fn test_resample_lengths() {
        let input = vec![0i16; 1600];
        assert_eq!(resample(&input, 8000, 16000).unwrap().len(), 3200);
        assert_eq!(resample(&input, 16000, 8000).unwrap().len(), 800);
        assert_eq!(resample(&input, 24000, 8000).unwrap().len(), 533);
        assert_eq!(resample(&input, 8000, 8000).unwrap().len(), 1600);
        assert!(resample(&[], 8000, 16000).unwrap().is_empty());
    }

    #[test]
    fn test_resample_keeps_in_band_tone() {
        let tone = sine(400.0, 8000.0, 8000, 8000);
        let up = resample(&tone, 8000, 16000).unwrap();
        let ratio = rms(&up[1600..14400]) / rms(&tone[800..7200]);
        assert!((ratio - 1.0).abs() < 0.05, "gain {ratio}");
        // 400 Hz over 0.8 s: 320 cycles, 640 crossings.
        let zc = zero_crossings(&up[1600..14400]);
        assert!((630..=650).contains(&zc), "zero crossings {zc}");
    }

    #[test]
    fn test_downsample_removes_out_of_band_tone() {
        // 6 kHz folds to 2 kHz at 8 kHz unless filtered first.
        let tone = sine(6000.0, 10000.0, 24000, 24000);
        let down = resample(&tone, 24000, 8000).unwrap();
        assert_eq!(down.len(), 8000);
        assert!(rms(&down[400..7600]) < 100.0, "alias rms {}", rms(&down[400..7600]));
    }

    #[test]
    fn test_remove_dc_offset() {
        let mut samples = vec![1100i16, 900, 1100, 900];
        remove_dc_offset(&mut samples);
        assert_eq!(samples, vec![100, -100, 100, -100]);
    }

    #[test]
    fn test_normalize_lifts_quiet_audio_only() {
        let mut quiet = sine(440.0, 300.0, 8000, 800);
        let before = dbfs(rms(&quiet));
        assert!(before < QUIET_DBFS);
        normalize_quiet(&mut quiet);
        let after = dbfs(rms(&quiet));
        assert!(after > before + 10.0);
        assert!(after <= TARGET_DBFS + 0.5);

        let loud = sine(440.0, 16000.0, 8000, 800);
        let mut copy = loud.clone();
        normalize_quiet(&mut copy);
        assert_eq!(copy, loud);
    }

    #[test]
    fn test_low_pass_attenuates_high_frequencies() {
        let mut low = sine(300.0, 10000.0, 16000, 1600);
        let mut high = sine(7000.0, 10000.0, 16000, 1600);
        let low_before = rms(&low);
        let high_before = rms(&high);
        low_pass(&mut low, LOW_PASS_HZ, 16000);
        low_pass(&mut high, LOW_PASS_HZ, 16000);
        assert!(rms(&low) / low_before > 0.9);
        assert!(rms(&high) / high_before < 0.6);
    }

    #[test]
    fn test_condition_for_telephony_resamples() {
        let tts = sine(500.0, 8000.0, 16000, 16000);
        let out = condition_for_telephony(&tts, 16000).unwrap();
        assert_eq!(out.len(), 8000);
        assert!(rms(&out) > 1000.0);
    }

    #[test]
    fn test_condition_for_telephony_does_not_alias() {
        let tts = sine(6000.0, 10000.0, 24000, 24000);
        assert!(rms(&tts) > 7000.0);
        let out = condition_for_telephony(&tts, 24000).unwrap();
        assert_eq!(out.len(), 8000);
        assert!(rms(&out) < 1000.0, "conditioned rms {}", rms(&out));
    }

    #[test]
    fn test_condition_for_telephony_lifts_quiet_speech() {
        let tts = sine(500.0, 300.0, 16000, 16000);
        let out = condition_for_telephony(&tts, 16000).unwrap();
        assert!(dbfs(rms(&out[800..7200])) > QUIET_DBFS);
    }
}
