//! Microphone capture using CPAL
//!
//! Captures audio from the default input device, downmixes to mono PCM16,
//! and delivers fixed-length frames over a channel. The CPAL `Stream` is
//! `!Send`, so the stream lives on a dedicated OS thread; the device
//! callback only accumulates samples and pushes completed frames with
//! `try_send`, so it can never block on a slow consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::{sample_to_i16, AudioError, AudioFrame};

/// How the capture device should be opened.
#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    /// Requested sample rate in Hz.
    pub sample_rate: u32,
    /// Mono samples per delivered frame.
    pub frame_len: usize,
}

/// Handle to an open capture device.
///
/// Stopping releases the device; dropping the handle stops it too.
pub struct CaptureHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Stop capturing and release the input device. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open the default input device and start delivering frames.
///
/// Returns once the stream is confirmed running or the device setup failed.
pub fn open_capture(
    config: CaptureConfig,
    frames_tx: mpsc::Sender<AudioFrame>,
) -> Result<CaptureHandle, AudioError> {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), AudioError>>();

    let thread = std::thread::Builder::new()
        .name("wakeline-capture".into())
        .spawn(move || {
            let stream = match build_capture_stream(config, frames_tx) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(AudioError::StreamCreationFailed(format!(
                    "Failed to start stream: {}",
                    e
                ))));
                return;
            }

            let _ = ready_tx.send(Ok(()));

            // Keep the stream alive until asked to stop.
            while !thread_stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(50));
            }
            drop(stream);
        })
        .map_err(|e| AudioError::DeviceThreadFailed(e.to_string()))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(CaptureHandle {
            stop,
            thread: Some(thread),
        }),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => {
            let _ = thread.join();
            Err(AudioError::DeviceThreadFailed(
                "Capture thread exited before reporting readiness".into(),
            ))
        }
    }
}

fn build_capture_stream(
    config: CaptureConfig,
    frames_tx: mpsc::Sender<AudioFrame>,
) -> Result<Stream, AudioError> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or(AudioError::NoInputDevice)?;

    tracing::info!("Using audio input device: {:?}", device.name());

    let supported_config = device
        .default_input_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;

    let sample_format = supported_config.sample_format();
    let channels = supported_config.channels();
    let stream_config = StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    tracing::info!(
        "Capture config: {} Hz, {} channels, {:?}",
        config.sample_rate,
        channels,
        sample_format
    );

    let accumulator = FrameAccumulator::new(config, channels, frames_tx);

    match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &stream_config, accumulator),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &stream_config, accumulator),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &stream_config, accumulator),
        _ => Err(AudioError::NoSupportedConfig),
    }
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut accumulator: FrameAccumulator,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let err_fn = |err| tracing::error!("Audio stream error: {}", err);

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                for chunk in data.chunks_exact(accumulator.channels as usize) {
                    let sum: i32 = chunk.iter().map(|&s| sample_to_i16(s) as i32).sum();
                    let mono = (sum / accumulator.channels as i32) as i16;
                    accumulator.push(mono);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

    Ok(stream)
}

/// Collects mono samples into fixed-length frames and ships each completed
/// frame. Runs inside the device callback, so delivery is `try_send`; a full
/// channel drops the frame rather than stalling the audio thread.
struct FrameAccumulator {
    buf: Vec<i16>,
    frame_len: usize,
    sample_rate: u32,
    channels: u16,
    frames_tx: mpsc::Sender<AudioFrame>,
}

impl FrameAccumulator {
    fn new(config: CaptureConfig, channels: u16, frames_tx: mpsc::Sender<AudioFrame>) -> Self {
        Self {
            buf: Vec::with_capacity(config.frame_len),
            frame_len: config.frame_len,
            sample_rate: config.sample_rate,
            channels,
            frames_tx,
        }
    }

    fn push(&mut self, sample: i16) {
        self.buf.push(sample);
        if self.buf.len() >= self.frame_len {
            let samples = std::mem::replace(&mut self.buf, Vec::with_capacity(self.frame_len));
            let frame = AudioFrame::new(samples, self.sample_rate, 1);
            if let Err(e) = self.frames_tx.try_send(frame) {
                tracing::warn!(
                    "Capture frame dropped ({} ms), consumer not keeping up",
                    e.into_inner().duration_ms()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_accumulator(
        frame_len: usize,
        channels: u16,
    ) -> (FrameAccumulator, mpsc::Receiver<AudioFrame>) {
        let (tx, rx) = mpsc::channel(4);
        let config = CaptureConfig {
            sample_rate: 16000,
            frame_len,
        };
        (FrameAccumulator::new(config, channels, tx), rx)
    }

    #[test]
    fn accumulator_emits_fixed_length_frames() {
        let (mut acc, mut rx) = test_accumulator(4, 1);

        for i in 0..10 {
            acc.push(i as i16);
        }

        let first = rx.try_recv().unwrap();
        assert_eq!(first.samples, vec![0, 1, 2, 3]);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.samples, vec![4, 5, 6, 7]);
        // Two samples still accumulating
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn accumulator_drops_frames_when_channel_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let config = CaptureConfig {
            sample_rate: 16000,
            frame_len: 2,
        };
        let mut acc = FrameAccumulator::new(config, 1, tx);

        for i in 0..8 {
            acc.push(i);
        }

        // Only the first frame fit; later ones were dropped, not queued.
        let first = rx.try_recv().unwrap();
        assert_eq!(first.samples, vec![0, 1]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn frames_carry_capture_rate() {
        let (mut acc, mut rx) = test_accumulator(2, 1);
        acc.push(1);
        acc.push(2);
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.sample_rate, 16000);
        assert_eq!(frame.channels, 1);
    }
}
