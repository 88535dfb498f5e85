//! Speaker playback using CPAL
//!
//! A `PlaybackDevice` owns a bounded sample ring drained by the output
//! device callback. Like capture, the CPAL `Stream` is `!Send` and lives on
//! a dedicated thread; producers append PCM16 through the `PlaybackSink`
//! trait, which is also what lets the jitter buffer run against an
//! in-memory sink in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};

use super::AudioError;

/// Destination for decoded response audio.
///
/// Capacity is fixed at open time; callers are expected to check
/// `buffered_ms()` against `capacity_ms()` before appending.
pub trait PlaybackSink: Send {
    /// Queue PCM16 mono samples for playback.
    fn append(&mut self, samples: &[i16]);
    /// Milliseconds of audio currently queued.
    fn buffered_ms(&self) -> u64;
    /// Total ring capacity in milliseconds.
    fn capacity_ms(&self) -> u64;
    /// Remove and return everything still queued.
    fn take_buffered(&mut self) -> Vec<i16>;
}

struct PlaybackDevice {
    ring: Arc<Mutex<VecDeque<i16>>>,
    sample_rate: u32,
    capacity_ms: u64,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PlaybackSink for PlaybackDevice {
    fn append(&mut self, samples: &[i16]) {
        self.ring.lock().unwrap().extend(samples.iter().copied());
    }

    fn buffered_ms(&self) -> u64 {
        let queued = self.ring.lock().unwrap().len() as u64;
        queued * 1000 / self.sample_rate as u64
    }

    fn capacity_ms(&self) -> u64 {
        self.capacity_ms
    }

    fn take_buffered(&mut self) -> Vec<i16> {
        self.ring.lock().unwrap().drain(..).collect()
    }
}

impl Drop for PlaybackDevice {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Playback thread panicked");
            }
        }
    }
}

/// Open the default output device at the given rate.
///
/// Returns once the stream is confirmed running. The mono sample stream is
/// duplicated across however many channels the device exposes.
pub fn open_playback(
    sample_rate: u32,
    capacity_ms: u64,
) -> Result<Box<dyn PlaybackSink>, AudioError> {
    let ring = Arc::new(Mutex::new(VecDeque::new()));
    let stop = Arc::new(AtomicBool::new(false));

    let thread_ring = ring.clone();
    let thread_stop = stop.clone();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), AudioError>>();

    let thread = std::thread::Builder::new()
        .name("wakeline-playback".into())
        .spawn(move || {
            let stream = match build_playback_stream(sample_rate, thread_ring) {
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

            while !thread_stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(50));
            }
            drop(stream);
        })
        .map_err(|e| AudioError::DeviceThreadFailed(e.to_string()))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(Box::new(PlaybackDevice {
            ring,
            sample_rate,
            capacity_ms,
            stop,
            thread: Some(thread),
        })),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => {
            let _ = thread.join();
            Err(AudioError::DeviceThreadFailed(
                "Playback thread exited before reporting readiness".into(),
            ))
        }
    }
}

fn build_playback_stream(
    sample_rate: u32,
    ring: Arc<Mutex<VecDeque<i16>>>,
) -> Result<Stream, AudioError> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;

    tracing::info!("Using audio output device: {:?}", device.name());

    let supported_config = device
        .default_output_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;

    let sample_format = supported_config.sample_format();
    let channels = supported_config.channels();
    let stream_config = StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    tracing::info!(
        "Playback config: {} Hz, {} channels, {:?}",
        sample_rate,
        channels,
        sample_format
    );

    match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &stream_config, ring),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &stream_config, ring),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &stream_config, ring),
        _ => Err(AudioError::NoSupportedConfig),
    }
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    ring: Arc<Mutex<VecDeque<i16>>>,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + cpal::FromSample<i16> + Send + 'static,
{
    let err_fn = |err| tracing::error!("Audio stream error: {}", err);
    let channels = config.channels as usize;

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut ring = ring.lock().unwrap();
                for frame in data.chunks_exact_mut(channels) {
                    // Zeros once the ring runs dry, never a stall.
                    let sample = ring.pop_front().unwrap_or(0);
                    let converted = T::from_sample(sample);
                    for out in frame.iter_mut() {
                        *out = converted;
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

    Ok(stream)
}
