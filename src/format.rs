//! Audio and video format descriptors
//!
//! `AudioFormat` is the value type every source and player agrees on. All
//! cursor arithmetic in the engine is done in bytes, so the derived
//! quantities (`bytes_per_frame`, `bytes_per_second`) and the alignment
//! helpers live here.

use serde::{Deserialize, Serialize};

/// PCM format of an audio track.
///
/// Immutable once attached to a source. Only mono/stereo and 8/16-bit
/// samples are supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Channel count: 1 for mono, 2 for stereo.
    pub channels: u16,
    /// Bits per sample: 8 or 16.
    pub sample_size: u16,
    /// Samples per second, in Hertz.
    pub sample_rate: u32,
}

impl AudioFormat {
    pub fn new(channels: u16, sample_size: u16, sample_rate: u32) -> Self {
        debug_assert!(matches!(channels, 1 | 2), "unsupported channel count");
        debug_assert!(matches!(sample_size, 8 | 16), "unsupported sample size");
        debug_assert!(sample_rate > 0, "sample rate must be positive");
        Self {
            channels,
            sample_size,
            sample_rate,
        }
    }

    /// Size of one frame (one sample across all channels), in bytes.
    pub fn bytes_per_frame(&self) -> usize {
        (self.sample_size as usize / 8) * self.channels as usize
    }

    /// Bytes consumed by one second of audio.
    pub fn bytes_per_second(&self) -> usize {
        self.bytes_per_frame() * self.sample_rate as usize
    }

    /// Largest frame-aligned byte count not exceeding `num_bytes`.
    pub fn align_down(&self, num_bytes: usize) -> usize {
        num_bytes - (num_bytes % self.bytes_per_frame())
    }

    /// Smallest frame-aligned byte count not below `num_bytes`.
    pub fn align_up(&self, num_bytes: usize) -> usize {
        self.align_down(num_bytes + self.bytes_per_frame() - 1)
    }

    /// Frame-aligned byte offset of `timestamp` seconds into a stream of
    /// this format. Negative timestamps map to zero.
    pub fn timestamp_to_bytes(&self, timestamp: f64) -> usize {
        self.align_down((timestamp.max(0.0) * self.bytes_per_second() as f64) as usize)
    }

    /// Duration in seconds of `num_bytes` of audio in this format.
    pub fn duration_of(&self, num_bytes: usize) -> f64 {
        num_bytes as f64 / self.bytes_per_second() as f64
    }

    /// The byte value silence is written with: 0x80 for unsigned 8-bit
    /// PCM, 0x00 for signed 16-bit PCM.
    pub fn silence_byte(&self) -> u8 {
        if self.sample_size == 8 { 0x80 } else { 0x00 }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}ch {}-bit {} Hz",
            self.channels, self.sample_size, self.sample_rate
        )
    }
}

/// Format of a video track.
///
/// The engine does not render video; this exists so sources can describe a
/// video track they carry and players can refuse what they cannot handle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoFormat {
    /// Width of the video image, in pixels.
    pub width: u32,
    /// Height of the video image, in pixels.
    pub height: u32,
    /// Aspect ratio (width over height) of a single pixel.
    pub sample_aspect: f64,
    /// Frames per second, if known.
    pub frame_rate: Option<f64>,
}

impl VideoFormat {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            sample_aspect: 1.0,
            frame_rate: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn derived_quantities() {
        let fmt = AudioFormat::new(2, 16, 44100);
        assert_eq!(fmt.bytes_per_frame(), 4);
        assert_eq!(fmt.bytes_per_second(), 176400);

        let mono = AudioFormat::new(1, 8, 8000);
        assert_eq!(mono.bytes_per_frame(), 1);
        assert_eq!(mono.bytes_per_second(), 8000);
    }

    #[test]
    fn alignment() {
        let fmt = AudioFormat::new(2, 16, 44100);
        assert_eq!(fmt.align_down(7), 4);
        assert_eq!(fmt.align_down(8), 8);
        assert_eq!(fmt.align_up(7), 8);
        assert_eq!(fmt.align_up(8), 8);
        assert_eq!(fmt.align_up(0), 0);
    }

    #[test]
    fn timestamp_conversion() {
        let fmt = AudioFormat::new(2, 16, 44100);
        assert_eq!(fmt.timestamp_to_bytes(1.0), 176400);
        assert_eq!(fmt.timestamp_to_bytes(-3.0), 0);
        // 0.2 s of 16-bit stereo 44.1 kHz is the classic 35280 bytes
        assert_eq!(fmt.timestamp_to_bytes(0.2), 35280);
    }

    #[test]
    fn silence_bytes() {
        assert_eq!(AudioFormat::new(1, 8, 8000).silence_byte(), 0x80);
        assert_eq!(AudioFormat::new(2, 16, 44100).silence_byte(), 0x00);
    }

    proptest! {
        // align_down(n) <= n < align_down(n) + bytes_per_frame
        #[test]
        fn align_down_brackets(n in 0usize..1_000_000, stereo in any::<bool>(), wide in any::<bool>()) {
            let fmt = AudioFormat::new(if stereo { 2 } else { 1 }, if wide { 16 } else { 8 }, 44100);
            let aligned = fmt.align_down(n);
            prop_assert!(aligned <= n);
            prop_assert!(n < aligned + fmt.bytes_per_frame());
            prop_assert_eq!(aligned % fmt.bytes_per_frame(), 0);
        }
    }
}
