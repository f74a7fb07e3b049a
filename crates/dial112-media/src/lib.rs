//! Call media pipeline: µ-law codec, DSP helpers, endpoint detection and paced playback.

pub mod codec;
pub mod dsp;
pub mod endpoint;
pub mod playback;
pub mod wav;
