//! G.711 µ-law codec for the 8 kHz telephony leg.
//!
//! Decoding is the standard companding expansion, evaluated once at compile
//! time into a 256-entry table. Encoding follows the same segment layout:
//! bias, clip, find the segment from the highest set bit, take four mantissa
//! bits, then invert the whole byte as the wire format requires.

use thiserror::Error;

/// Telephony sample rate.
pub const SAMPLE_RATE: u32 = 8000;

/// µ-law byte for zero amplitude. Used to pad short frames.
pub const SILENCE_BYTE: u8 = 0xFF;

const BIAS: i32 = 0x84;
const MAX_MAGNITUDE: i32 = 0x7FFF;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("PCM16 byte length {0} is not a multiple of 2")]
    MisalignedPcm(usize),

    #[error("frame length mismatch: expected {expected} bytes, got {actual}")]
    FrameLength { expected: usize, actual: usize },
}

const fn expand(byte: u8) -> i16 {
    let u = !byte;
    let exponent = (u >> 4) & 0x07;
    let mantissa = (u & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if u & 0x80 != 0 {
        (-magnitude) as i16
    } else {
        magnitude as i16
    }
}

const fn build_decode_table() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = expand(i as u8);
        i += 1;
    }
    table
}

static DECODE_TABLE: [i16; 256] = build_decode_table();

/// Expand one µ-law byte to linear PCM16.
#[inline]
pub fn ulaw_to_linear(byte: u8) -> i16 {
    DECODE_TABLE[byte as usize]
}

/// Compress one linear PCM16 sample to µ-law.
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let value = sample as i32;
    let sign: i32 = if value < 0 { 0x80 } else { 0x00 };
    let magnitude = (value.abs() + BIAS).min(MAX_MAGNITUDE);

    // magnitude >= BIAS, so (magnitude >> 7) is in 1..=255.
    let exponent = 7 - ((magnitude >> 7) as u8).leading_zeros() as i32;
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;

    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Decode a µ-law buffer to PCM16.
pub fn decode(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| ulaw_to_linear(b)).collect()
}

/// Decode exactly one frame, rejecting buffers of the wrong size.
pub fn decode_frame(bytes: &[u8], frame_len: usize) -> Result<Vec<i16>, CodecError> {
    if bytes.len() != frame_len {
        return Err(CodecError::FrameLength {
            expected: frame_len,
            actual: bytes.len(),
        });
    }
    Ok(decode(bytes))
}

/// Encode PCM16 to µ-law without any conditioning.
pub fn encode(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| linear_to_ulaw(s)).collect()
}

/// Saturating `tanh` limiter applied ahead of the compander.
#[inline]
pub fn soft_limit(sample: i16) -> i16 {
    ((sample as f64 / 32768.0).tanh() * 32767.0) as i16
}

/// Soft-limit then encode. This is the path for synthesized speech.
pub fn encode_limited(samples: &[i16]) -> Vec<u8> {
    samples
        .iter()
        .map(|&s| linear_to_ulaw(soft_limit(s)))
        .collect()
}

/// Reinterpret little-endian bytes as PCM16 samples.
pub fn pcm_from_le_bytes(bytes: &[u8]) -> Result<Vec<i16>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::MisalignedPcm(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}

pub fn pcm_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Split µ-law audio into fixed-size frames, padding the last one with [`SILENCE_BYTE`].
pub fn frames(audio: &[u8], frame_len: usize) -> Vec<Vec<u8>> {
    if frame_len == 0 {
        return Vec::new();
    }
    audio
        .chunks(frame_len)
        .map(|chunk| {
            let mut frame = chunk.to_vec();
            frame.resize(frame_len, SILENCE_BYTE);
            frame
        })
        .collect()
}

/// Bytes per frame of `frame_ms` at the telephony rate (one byte per sample).
pub fn frame_bytes(frame_ms: u32) -> usize {
    (SAMPLE_RATE as usize * frame_ms as usize) / 1000
}
