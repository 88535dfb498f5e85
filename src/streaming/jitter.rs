//! Downlink jitter buffer
//!
//! Response audio arrives in bursts: large chunks after think-time, then
//! silence. A fixed playback buffer either stutters or adds needless
//! latency, so the target depth adapts to the chunks actually observed,
//! bounded to [300ms, 5000ms]. Chunks that do not fit the ring right now
//! wait in a pending FIFO and are drained as the device consumes audio;
//! nothing is ever dropped or reordered.
//!
//! The playback device is reached through the `PlaybackSink` trait, so the
//! whole policy runs against an in-memory sink in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::audio::{open_playback, AudioError, PlaybackSink};

/// Bounds for the adaptive target depth
const MIN_TARGET_MS: u64 = 300;
const MAX_TARGET_MS: u64 = 5000;

/// Ring capacity relative to the target depth
const CAPACITY_FACTOR: u64 = 5;

/// Growth applied when the buffer resizes
const TARGET_GROWTH: f64 = 1.5;

/// Commit rule: never fill the ring past this fraction of capacity
const COMMIT_FILL_LIMIT: f64 = 0.9;

/// Pending-queue drain period; the monitor runs every second tick
const DRAIN_PERIOD: Duration = Duration::from_millis(50);

/// How long the ring must sit empty before the device is released
const EMPTY_GRACE: Duration = Duration::from_millis(1000);

/// Whether response audio is currently being played out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
}

/// Lock-free playback-state probe for the uplink echo gate.
#[derive(Clone)]
pub struct PlaybackProbe(Arc<AtomicBool>);

impl PlaybackProbe {
    pub fn is_playing(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Creates a playback sink for a given sample rate and ring capacity.
///
/// Injection point for tests; production uses the CPAL device factory.
pub type SinkFactory = Box<dyn Fn(u32, u64) -> Result<Box<dyn PlaybackSink>, AudioError> + Send>;

/// Snapshot of buffer accounting, mostly for tests and status logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterStats {
    pub buffered_ms: u64,
    pub pending_chunks: usize,
    pub target_ms: u64,
    pub received_samples: u64,
    pub committed_samples: u64,
}

struct JitterInner {
    sink: Option<Box<dyn PlaybackSink>>,
    pending: VecDeque<Vec<i16>>,
    target_ms: u64,
    sample_rate: u32,
    factory: SinkFactory,
    empty_since: Option<Instant>,
    received_samples: u64,
    committed_samples: u64,
}

impl JitterInner {
    fn chunk_ms(&self, samples: usize) -> u64 {
        samples as u64 * 1000 / self.sample_rate as u64
    }

    fn buffered_ms(&self) -> u64 {
        self.sink.as_ref().map_or(0, |s| s.buffered_ms())
    }

    fn commit_limit_ms(&self) -> u64 {
        let capacity = self.sink.as_ref().map_or(0, |s| s.capacity_ms());
        (capacity as f64 * COMMIT_FILL_LIMIT) as u64
    }

    /// Open the playback device at the current target if not already open.
    fn ensure_sink(&mut self) -> bool {
        if self.sink.is_some() {
            return true;
        }
        match (self.factory)(self.sample_rate, self.target_ms * CAPACITY_FACTOR) {
            Ok(sink) => {
                self.sink = Some(sink);
                true
            }
            Err(e) => {
                tracing::warn!("Playback device unavailable, chunks held pending: {}", e);
                false
            }
        }
    }

    /// Reinitialize at a larger target, carrying ring contents forward.
    ///
    /// The new sink is created before the old one is emptied, so a factory
    /// failure leaves the current ring untouched.
    fn grow_target(&mut self, new_target_ms: u64) {
        let new_target_ms = new_target_ms.clamp(MIN_TARGET_MS, MAX_TARGET_MS);
        if new_target_ms <= self.target_ms {
            return;
        }

        if self.sink.is_some() {
            let mut new_sink = match (self.factory)(self.sample_rate, new_target_ms * CAPACITY_FACTOR)
            {
                Ok(sink) => sink,
                Err(e) => {
                    tracing::warn!("Buffer resize failed, keeping current ring: {}", e);
                    return;
                }
            };
            let carried = self
                .sink
                .as_mut()
                .map(|s| s.take_buffered())
                .unwrap_or_default();
            if !carried.is_empty() {
                new_sink.append(&carried);
            }
            self.sink = Some(new_sink);
        }

        tracing::debug!(
            "Jitter target {}ms -> {}ms (ring {}ms)",
            self.target_ms,
            new_target_ms,
            new_target_ms * CAPACITY_FACTOR
        );
        self.target_ms = new_target_ms;
    }

    fn add_chunk(&mut self, samples: Vec<i16>) {
        let chunk_ms = self.chunk_ms(samples.len());
        self.received_samples += samples.len() as u64;

        // A chunk bigger than the whole target signals bursty arrivals.
        if chunk_ms > self.target_ms {
            let needed = ((self.buffered_ms() + chunk_ms) as f64 * TARGET_GROWTH) as u64;
            self.grow_target(needed);
        }

        if !self.ensure_sink() {
            self.pending.push_back(samples);
            return;
        }

        if self.buffered_ms() + chunk_ms <= self.commit_limit_ms() {
            self.committed_samples += samples.len() as u64;
            if let Some(sink) = self.sink.as_mut() {
                sink.append(&samples);
            }
        } else {
            let needed = ((self.buffered_ms() + chunk_ms) as f64 * TARGET_GROWTH) as u64;
            self.pending.push_back(samples);
            self.grow_target(needed);
        }

        self.drain_pending();
        self.empty_since = None;
    }

    /// Move pending chunks into the ring, oldest first, under the commit
    /// rule. Stops at the first chunk that does not fit.
    fn drain_pending(&mut self) {
        if self.pending.is_empty() || !self.ensure_sink() {
            return;
        }
        while let Some(front) = self.pending.front() {
            let chunk_ms = self.chunk_ms(front.len());
            if self.buffered_ms() + chunk_ms > self.commit_limit_ms() {
                break;
            }
            let samples = self.pending.pop_front().unwrap();
            self.committed_samples += samples.len() as u64;
            if let Some(sink) = self.sink.as_mut() {
                sink.append(&samples);
            }
        }
    }

    /// Release the device once the ring has sat empty past the grace period.
    fn monitor(&mut self, now: Instant) -> PlaybackState {
        if self.sink.is_none() {
            return PlaybackState::Stopped;
        }
        if self.buffered_ms() == 0 && self.pending.is_empty() {
            match self.empty_since {
                None => self.empty_since = Some(now),
                Some(since) if now.duration_since(since) >= EMPTY_GRACE => {
                    tracing::info!("Playback idle past grace period, releasing device");
                    self.sink = None;
                    self.empty_since = None;
                    return PlaybackState::Stopped;
                }
                Some(_) => {}
            }
        } else {
            self.empty_since = None;
        }
        PlaybackState::Playing
    }

    fn stats(&self) -> JitterStats {
        JitterStats {
            buffered_ms: self.buffered_ms(),
            pending_chunks: self.pending.len(),
            target_ms: self.target_ms,
            received_samples: self.received_samples,
            committed_samples: self.committed_samples,
        }
    }

    fn release(&mut self) {
        self.sink = None;
        self.pending.clear();
        self.empty_since = None;
    }
}

/// Shared entry point into the buffer.
///
/// Cloned into the receive loop (`add_chunk`) while the owning
/// `DownlinkJitterBuffer` runs the timers.
#[derive(Clone)]
pub struct JitterHandle {
    inner: Arc<Mutex<JitterInner>>,
    playing: Arc<AtomicBool>,
}

impl JitterHandle {
    /// Buffer one inbound audio chunk. Empty chunks are ignored.
    pub fn add_chunk(&self, samples: Vec<i16>) {
        if samples.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.add_chunk(samples);
        self.playing.store(inner.sink.is_some(), Ordering::SeqCst);
    }

    pub fn state(&self) -> PlaybackState {
        if self.playing.load(Ordering::SeqCst) {
            PlaybackState::Playing
        } else {
            PlaybackState::Stopped
        }
    }

    pub fn probe(&self) -> PlaybackProbe {
        PlaybackProbe(self.playing.clone())
    }

    pub fn stats(&self) -> JitterStats {
        self.inner.lock().unwrap().stats()
    }

    fn tick_drain(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.drain_pending();
        self.playing.store(inner.sink.is_some(), Ordering::SeqCst);
    }

    fn tick_monitor(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.monitor(now);
        self.playing
            .store(state == PlaybackState::Playing, Ordering::SeqCst);
    }

    fn release(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.release();
        self.playing.store(false, Ordering::SeqCst);
    }
}

/// Owns the drain/monitor timers for one turn.
pub struct DownlinkJitterBuffer {
    handle: JitterHandle,
    cancel: Option<CancellationToken>,
    ticker: Option<tokio::task::JoinHandle<()>>,
}

impl DownlinkJitterBuffer {
    pub fn new(sample_rate: u32, initial_target_ms: u64, factory: SinkFactory) -> Self {
        let inner = JitterInner {
            sink: None,
            pending: VecDeque::new(),
            target_ms: initial_target_ms.clamp(MIN_TARGET_MS, MAX_TARGET_MS),
            sample_rate,
            factory,
            empty_since: None,
            received_samples: 0,
            committed_samples: 0,
        };
        Self {
            handle: JitterHandle {
                inner: Arc::new(Mutex::new(inner)),
                playing: Arc::new(AtomicBool::new(false)),
            },
            cancel: None,
            ticker: None,
        }
    }

    /// Buffer backed by the default CPAL output device.
    pub fn with_device(sample_rate: u32, initial_target_ms: u64) -> Self {
        Self::new(
            sample_rate,
            initial_target_ms,
            Box::new(|rate, capacity_ms| open_playback(rate, capacity_ms)),
        )
    }

    pub fn handle(&self) -> JitterHandle {
        self.handle.clone()
    }

    /// Start the drain and monitor timers. No-op when already running.
    pub fn start(&mut self) {
        if self.ticker.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = self.handle.clone();
        let token = cancel.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(DRAIN_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut tick = 0u64;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {}
                }
                handle.tick_drain();
                tick += 1;
                if tick % 2 == 0 {
                    handle.tick_monitor(Instant::now());
                }
            }
        });
        self.cancel = Some(cancel);
        self.ticker = Some(ticker);
    }

    /// Stop the timers and release the device. Idempotent.
    ///
    /// Pending chunks belong to the finished turn and are discarded.
    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        self.handle.release();
    }
}

impl Drop for DownlinkJitterBuffer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory sink with externally inspectable state. The test "plays"
    /// audio by consuming samples from the front.
    #[derive(Clone)]
    struct MemorySink {
        state: Arc<Mutex<MemorySinkState>>,
    }

    struct MemorySinkState {
        data: VecDeque<i16>,
        capacity_ms: u64,
        sample_rate: u32,
    }

    impl MemorySink {
        fn new(sample_rate: u32, capacity_ms: u64) -> Self {
            Self {
                state: Arc::new(Mutex::new(MemorySinkState {
                    data: VecDeque::new(),
                    capacity_ms,
                    sample_rate,
                })),
            }
        }

        fn consume_ms(&self, ms: u64) {
            let mut state = self.state.lock().unwrap();
            let samples = (ms * state.sample_rate as u64 / 1000) as usize;
            for _ in 0..samples.min(state.data.len()) {
                state.data.pop_front();
            }
        }

        fn contents(&self) -> Vec<i16> {
            self.state.lock().unwrap().data.iter().copied().collect()
        }
    }

    impl PlaybackSink for MemorySink {
        fn append(&mut self, samples: &[i16]) {
            self.state.lock().unwrap().data.extend(samples.iter().copied());
        }

        fn buffered_ms(&self) -> u64 {
            let state = self.state.lock().unwrap();
            state.data.len() as u64 * 1000 / state.sample_rate as u64
        }

        fn capacity_ms(&self) -> u64 {
            self.state.lock().unwrap().capacity_ms
        }

        fn take_buffered(&mut self) -> Vec<i16> {
            self.state.lock().unwrap().data.drain(..).collect()
        }
    }

    /// Factory recording every sink it creates. Sample rate 1000 keeps the
    /// math readable: one sample is one millisecond.
    fn memory_factory() -> (SinkFactory, Arc<Mutex<Vec<MemorySink>>>) {
        let created: Arc<Mutex<Vec<MemorySink>>> = Arc::new(Mutex::new(Vec::new()));
        let log = created.clone();
        let factory: SinkFactory = Box::new(move |rate, capacity_ms| {
            let sink = MemorySink::new(rate, capacity_ms);
            log.lock().unwrap().push(sink.clone());
            Ok(Box::new(sink))
        });
        (factory, created)
    }

    fn chunk(ms: u64) -> Vec<i16> {
        (0..ms).map(|i| i as i16).collect()
    }

    fn latest(created: &Arc<Mutex<Vec<MemorySink>>>) -> MemorySink {
        created.lock().unwrap().last().unwrap().clone()
    }

    #[test]
    fn small_chunk_commits_directly() {
        let (factory, created) = memory_factory();
        let buffer = DownlinkJitterBuffer::new(1000, 1000, factory);
        let handle = buffer.handle();

        handle.add_chunk(chunk(100));

        let stats = handle.stats();
        assert_eq!(stats.buffered_ms, 100);
        assert_eq!(stats.pending_chunks, 0);
        assert_eq!(stats.committed_samples, 100);
        assert_eq!(handle.state(), PlaybackState::Playing);
        // Ring capacity is five times the target
        assert_eq!(latest(&created).capacity_ms(), 5000);
    }

    #[test]
    fn empty_chunk_is_ignored() {
        let (factory, _) = memory_factory();
        let buffer = DownlinkJitterBuffer::new(1000, 1000, factory);
        let handle = buffer.handle();

        handle.add_chunk(Vec::new());

        assert_eq!(handle.stats().received_samples, 0);
        assert_eq!(handle.state(), PlaybackState::Stopped);
    }

    #[test]
    fn oversized_chunk_resizes_target() {
        // 1600ms chunk against a 1000ms target grows the target to
        // (0 + 1600) * 1.5 = 2400ms and keeps every sample.
        let (factory, created) = memory_factory();
        let buffer = DownlinkJitterBuffer::new(1000, 1000, factory);
        let handle = buffer.handle();

        let payload = chunk(1600);
        handle.add_chunk(payload.clone());

        let stats = handle.stats();
        assert_eq!(stats.target_ms, 2400);
        assert_eq!(stats.buffered_ms, 1600);
        assert_eq!(stats.committed_samples, 1600);
        assert_eq!(stats.pending_chunks, 0);
        assert_eq!(latest(&created).contents(), payload);
    }

    #[test]
    fn resize_is_clamped_to_max() {
        let (factory, _) = memory_factory();
        let buffer = DownlinkJitterBuffer::new(1000, 4000, factory);
        let handle = buffer.handle();

        handle.add_chunk(chunk(4500));

        // (0 + 4500) * 1.5 = 6750, clamped to 5000
        assert_eq!(handle.stats().target_ms, 5000);
    }

    #[test]
    fn resize_carries_buffered_audio_forward() {
        let (factory, created) = memory_factory();
        let buffer = DownlinkJitterBuffer::new(1000, 1000, factory);
        let handle = buffer.handle();

        let first = chunk(900);
        let second = chunk(1600);
        handle.add_chunk(first.clone());
        handle.add_chunk(second.clone());

        // Second add resized to (900 + 1600) * 1.5 = 3750; the 900ms already
        // in the old ring moved into the new one ahead of the new chunk.
        let stats = handle.stats();
        assert_eq!(stats.target_ms, 3750);
        assert_eq!(stats.buffered_ms, 2500);
        assert_eq!(created.lock().unwrap().len(), 2);

        let mut expected = first;
        expected.extend(second);
        assert_eq!(latest(&created).contents(), expected);
    }

    #[test]
    fn overflow_goes_pending_and_drains_in_order() {
        let (factory, created) = memory_factory();
        // Target already at max so no resize can absorb the overflow:
        // capacity 25000ms, commit limit 22500ms.
        let buffer = DownlinkJitterBuffer::new(1000, 5000, factory);
        let handle = buffer.handle();

        for _ in 0..5 {
            handle.add_chunk(chunk(4500));
        }
        handle.add_chunk(chunk(4500));

        let stats = handle.stats();
        assert_eq!(stats.buffered_ms, 22500);
        assert_eq!(stats.pending_chunks, 1);
        assert_eq!(stats.received_samples, 27000);
        assert_eq!(stats.committed_samples, 22500);

        // Playback consumes audio; the next drain commits the waiting chunk.
        latest(&created).consume_ms(20000);
        handle.tick_drain();

        let stats = handle.stats();
        assert_eq!(stats.pending_chunks, 0);
        assert_eq!(stats.committed_samples, stats.received_samples);
    }

    #[test]
    fn no_chunk_is_ever_dropped() {
        let (factory, created) = memory_factory();
        let buffer = DownlinkJitterBuffer::new(1000, 5000, factory);
        let handle = buffer.handle();

        let mut sent = 0u64;
        for i in 0..30 {
            let ms = 1000 + (i % 7) * 700;
            handle.add_chunk(chunk(ms));
            sent += ms;
            if i % 3 == 0 {
                latest(&created).consume_ms(2500);
                handle.tick_drain();
            }
        }

        let stats = handle.stats();
        assert_eq!(stats.received_samples, sent);
        let pending_samples: u64 = {
            let inner = handle.inner.lock().unwrap();
            inner.pending.iter().map(|c| c.len() as u64).sum()
        };
        // Every received sample is either committed or still waiting.
        assert_eq!(stats.committed_samples + pending_samples, sent);

        // Keep consuming and the pending queue fully drains.
        for _ in 0..40 {
            latest(&created).consume_ms(5000);
            handle.tick_drain();
        }
        assert_eq!(handle.stats().committed_samples, sent);
    }

    #[test]
    fn device_released_after_empty_grace() {
        let (factory, created) = memory_factory();
        let buffer = DownlinkJitterBuffer::new(1000, 1000, factory);
        let handle = buffer.handle();

        handle.add_chunk(chunk(100));
        assert_eq!(handle.state(), PlaybackState::Playing);

        latest(&created).consume_ms(100);

        let t0 = Instant::now();
        handle.tick_monitor(t0);
        // Grace period not yet elapsed
        assert_eq!(handle.state(), PlaybackState::Playing);

        handle.tick_monitor(t0 + Duration::from_millis(1100));
        assert_eq!(handle.state(), PlaybackState::Stopped);

        // A new chunk reopens the device.
        handle.add_chunk(chunk(50));
        assert_eq!(handle.state(), PlaybackState::Playing);
        assert_eq!(created.lock().unwrap().len(), 2);
    }

    #[test]
    fn new_chunk_resets_empty_grace() {
        let (factory, created) = memory_factory();
        let buffer = DownlinkJitterBuffer::new(1000, 1000, factory);
        let handle = buffer.handle();

        handle.add_chunk(chunk(100));
        latest(&created).consume_ms(100);

        let t0 = Instant::now();
        handle.tick_monitor(t0);
        handle.add_chunk(chunk(100));

        handle.tick_monitor(t0 + Duration::from_millis(1100));
        assert_eq!(handle.state(), PlaybackState::Playing);
    }

    #[test]
    fn probe_tracks_playback_state() {
        let (factory, _) = memory_factory();
        let mut buffer = DownlinkJitterBuffer::new(1000, 1000, factory);
        let handle = buffer.handle();
        let probe = handle.probe();

        assert!(!probe.is_playing());
        handle.add_chunk(chunk(100));
        assert!(probe.is_playing());

        buffer.stop();
        assert!(!probe.is_playing());
    }

    #[test]
    fn stop_is_idempotent() {
        let (factory, _) = memory_factory();
        let mut buffer = DownlinkJitterBuffer::new(1000, 1000, factory);
        buffer.handle().add_chunk(chunk(100));

        buffer.stop();
        buffer.stop();

        assert_eq!(buffer.handle().state(), PlaybackState::Stopped);
        assert_eq!(buffer.handle().stats().buffered_ms, 0);
    }

    #[test]
    fn factory_failure_keeps_chunks_pending() {
        let calls = Arc::new(Mutex::new(0u32));
        let call_log = calls.clone();
        let factory: SinkFactory = Box::new(move |rate, capacity_ms| {
            let mut n = call_log.lock().unwrap();
            *n += 1;
            if *n == 1 {
                Err(AudioError::NoOutputDevice)
            } else {
                Ok(Box::new(MemorySink::new(rate, capacity_ms)))
            }
        });

        let buffer = DownlinkJitterBuffer::new(1000, 1000, factory);
        let handle = buffer.handle();

        handle.add_chunk(chunk(100));
        assert_eq!(handle.stats().pending_chunks, 1);
        assert_eq!(handle.state(), PlaybackState::Stopped);

        // Next drain retries the device and commits the held chunk.
        handle.tick_drain();
        let stats = handle.stats();
        assert_eq!(stats.pending_chunks, 0);
        assert_eq!(stats.committed_samples, 100);
        assert_eq!(handle.state(), PlaybackState::Playing);
    }
}
