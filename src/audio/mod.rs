//! Audio device layer for wakeline
//!
//! Microphone capture, speaker playback, and cue sounds, all built on CPAL.
//! CPAL streams are `!Send`, so each open device lives on a dedicated audio
//! thread and is controlled through channels and atomics; the capture
//! callback never blocks and the playback callback only pops from a ring.

mod capture;
mod cues;
mod playback;

pub use capture::{open_capture, CaptureConfig, CaptureHandle};
pub use cues::play_cue;
pub use playback::{open_playback, PlaybackSink};

/// Errors that can occur while operating audio devices.
#[derive(Debug, Clone)]
pub enum AudioError {
    NoInputDevice,
    NoOutputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
    DeviceThreadFailed(String),
    CueLoadFailed(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "No audio input device found"),
            AudioError::NoOutputDevice => write!(f, "No audio output device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            AudioError::DeviceThreadFailed(e) => write!(f, "Audio device thread failed: {}", e),
            AudioError::CueLoadFailed(e) => write!(f, "Failed to load cue sound: {}", e),
        }
    }
}

impl std::error::Error for AudioError {}

/// An immutable chunk of PCM audio.
///
/// Produced by the capture device or by the network receive loop and
/// consumed exactly once, either sent uplink or buffered for playback.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// PCM16 samples, mono after capture downmix.
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Nominal duration of this frame, derived from the sample count.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0;
        }
        let per_channel = self.samples.len() as u64 / self.channels as u64;
        per_channel * 1000 / self.sample_rate as u64
    }

    /// Serialize to little-endian PCM16 bytes for the wire.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        pcm16_to_le_bytes(&self.samples)
    }
}

/// Serialize PCM16 samples to little-endian bytes.
pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
}

/// Parse little-endian PCM16 bytes into samples.
///
/// A trailing odd byte (truncated sample) is discarded.
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Convert any CPAL sample type to PCM16.
pub(crate) fn sample_to_i16<T>(sample: T) -> i16
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    let f32_sample: f32 = cpal::Sample::from_sample(sample);
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_duration_from_sample_count() {
        // 1600 mono samples at 16kHz = 100ms
        let frame = AudioFrame::new(vec![0i16; 1600], 16000, 1);
        assert_eq!(frame.duration_ms(), 100);

        // 960 stereo samples at 48kHz = 10ms per channel
        let frame = AudioFrame::new(vec![0i16; 960], 48000, 2);
        assert_eq!(frame.duration_ms(), 10);
    }

    #[test]
    fn frame_duration_zero_rate_does_not_panic() {
        let frame = AudioFrame::new(vec![0i16; 100], 0, 1);
        assert_eq!(frame.duration_ms(), 0);
    }

    #[test]
    fn pcm16_bytes_are_little_endian() {
        let bytes = pcm16_to_le_bytes(&[0x1234i16, 0x5678]);
        assert_eq!(bytes, vec![0x34, 0x12, 0x78, 0x56]);
        assert_eq!(pcm16_from_le_bytes(&bytes), vec![0x1234, 0x5678]);
    }

    #[test]
    fn pcm16_parse_drops_trailing_odd_byte() {
        let samples = pcm16_from_le_bytes(&[0x34, 0x12, 0x78]);
        assert_eq!(samples, vec![0x1234]);
    }

    #[test]
    fn sample_conversion_clamps() {
        assert_eq!(sample_to_i16(0.0f32), 0);
        assert_eq!(sample_to_i16(1.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-1.0f32), -i16::MAX);
        assert_eq!(sample_to_i16(2.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-2.0f32), -i16::MAX);
    }
}
