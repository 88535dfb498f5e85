//! Start/stop cue sounds
//!
//! Short WAV earcons played when a recording turn begins and ends. Each cue
//! opens a short-lived output stream at the clip's own rate, waits for it to
//! drain, and releases the device. Blocking; callers run it off the async
//! runtime via `spawn_blocking`.

use std::path::Path;
use std::time::{Duration, Instant};

use super::{open_playback, AudioError};

/// Play a WAV cue to completion on the default output device.
pub fn play_cue(path: &Path) -> Result<(), AudioError> {
    let mut reader =
        hound::WavReader::open(path).map_err(|e| AudioError::CueLoadFailed(e.to_string()))?;
    let spec = reader.spec();

    let samples = decode_mono_i16(&mut reader)?;
    if samples.is_empty() {
        return Ok(());
    }

    let clip_ms = samples.len() as u64 * 1000 / spec.sample_rate as u64;
    let mut sink = open_playback(spec.sample_rate, clip_ms + 100)?;
    sink.append(&samples);

    // Wait for the ring to drain, bounded so a wedged device cannot hang us.
    let deadline = Instant::now() + Duration::from_millis(clip_ms + 500);
    while sink.buffered_ms() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }

    Ok(())
}

fn decode_mono_i16<R: std::io::Read>(
    reader: &mut hound::WavReader<R>,
) -> Result<Vec<i16>, AudioError> {
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<i16> = match spec.sample_format {
        hound::SampleFormat::Int => reader
            .samples::<i16>()
            .collect::<Result<_, _>>()
            .map_err(|e| AudioError::CueLoadFailed(e.to_string()))?,
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
            .collect::<Result<_, _>>()
            .map_err(|e| AudioError::CueLoadFailed(e.to_string()))?,
    };

    if channels == 1 {
        return Ok(interleaved);
    }

    Ok(interleaved
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect())
}
