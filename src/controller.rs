//! Session controller
//!
//! Runs the event loop around the pure reducer and executes its effects.
//! The loop is the single writer of session state; every component reports
//! back through the event channel with a generation stamp, and the reducer
//! decides what actually happens. `SessionEffectRunner` owns the wake gate,
//! the connection, and the turn pipeline (uplink, downlink, silence watch).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::audio::{open_capture, play_cue, CaptureConfig};
use crate::settings::Settings;
use crate::state_machine::{reduce, Cue, Effect, Event, Generation, State};
use crate::streaming::connection::{run_receive_loop, ReceiveEnd, WsSource};
use crate::streaming::uplink::UplinkConfig;
use crate::streaming::{
    Connection, ConnectionManager, DownlinkJitterBuffer, TranscriptEvent, UplinkStreamer,
};
use crate::wake::{build_spotter, WakeOutcome, WakeWordGate};
use crate::watchdog::ActivityWatchdog;

/// Poll period of the silence watch while a turn is active.
const SILENCE_POLL: Duration = Duration::from_millis(500);

/// Everything the client reports outward: status lines, transcripts, and
/// state changes, on one channel in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Status(String),
    Transcript(TranscriptEvent),
    StateChanged(&'static str),
}

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

/// Handle for feeding commands into a running session loop.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Event>,
}

impl SessionHandle {
    pub async fn start(&self) {
        let _ = self.tx.send(Event::StartCommand).await;
    }

    pub async fn stop(&self) {
        let _ = self.tx.send(Event::StopCommand).await;
    }

    pub async fn send(&self, event: Event) {
        let _ = self.tx.send(event).await;
    }
}

/// Spawn the session loop with the real effect runner.
///
/// Returns the command handle and the client event stream.
pub fn spawn_session(settings: Settings) -> (SessionHandle, mpsc::Receiver<ClientEvent>) {
    let (tx, rx) = mpsc::channel::<Event>(64);
    let (client_tx, client_rx) = mpsc::channel::<ClientEvent>(64);

    let runner = SessionEffectRunner::new(settings, client_tx.clone());
    tokio::spawn(run_session_loop(rx, tx.clone(), runner, client_tx));

    (SessionHandle { tx }, client_rx)
}

/// Run the main session loop.
///
/// Status and EmitState effects are handled here at the edge so client
/// events always come out in transition order; everything else goes to the
/// effect runner.
pub async fn run_session_loop(
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    runner: Arc<dyn EffectRunner>,
    client_tx: mpsc::Sender<ClientEvent>,
) {
    let mut state = State::default();

    let _ = client_tx.send(ClientEvent::StateChanged(state.name())).await;
    tracing::info!("Session loop started");

    while let Some(event) = rx.recv().await {
        tracing::debug!("Received event: {:?}", event);

        let (next, effects) = reduce(&state, event);
        if next != state {
            tracing::info!("State transition: {:?} -> {:?}", state, next);
        }
        state = next;

        for eff in effects {
            match eff {
                Effect::Status(message) => {
                    tracing::info!("{}", message);
                    let _ = client_tx.send(ClientEvent::Status(message)).await;
                }
                Effect::EmitState => {
                    let _ = client_tx
                        .send(ClientEvent::StateChanged(state.name()))
                        .await;
                }
                other => runner.spawn(other, tx.clone()),
            }
        }
    }

    tracing::info!("Session loop ended");
}

/// A connection that has been established but whose turn has not started.
struct PendingConnection {
    generation: Generation,
    connection: Connection,
    source: WsSource,
}

/// Mutable turn machinery behind one async mutex.
#[derive(Default)]
struct Runtime {
    gate: WakeWordGate,
    /// Generation the gate was last armed for; `None` while disarmed.
    armed_generation: Option<Generation>,
    pending: Option<PendingConnection>,
    connection: Option<Connection>,
    uplink: UplinkStreamer,
    downlink: Option<DownlinkJitterBuffer>,
    turn_cancel: Option<CancellationToken>,
}

impl Runtime {
    /// Release the gate, unless it was re-armed for a newer generation after
    /// this teardown was emitted. Effects run on independent tasks, so a
    /// stale disarm can arrive after the gate already went up again.
    fn disarm_gate(&mut self, up_to: Generation) {
        if let Some(armed) = self.armed_generation {
            if armed > up_to {
                tracing::debug!(
                    "Skipping disarm for generation {}, gate armed for {}",
                    up_to,
                    armed
                );
                return;
            }
        }
        self.gate.disarm();
        self.armed_generation = None;
    }

    /// Tear down the active turn: uplink, downlink, socket, loops.
    async fn stop_turn(&mut self) {
        if let Some(cancel) = self.turn_cancel.take() {
            cancel.cancel();
        }
        self.uplink.stop();
        if let Some(mut downlink) = self.downlink.take() {
            downlink.stop();
        }
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
    }

    /// Full teardown, including the gate and any unconsumed connection.
    async fn release_all(&mut self, up_to: Generation) {
        self.disarm_gate(up_to);
        self.stop_turn().await;
        if let Some(pending) = self.pending.take() {
            pending.connection.close().await;
        }
    }
}

/// Real effect runner: devices, socket, timers.
pub struct SessionEffectRunner {
    settings: Settings,
    watchdog: ActivityWatchdog,
    runtime: Arc<Mutex<Runtime>>,
    client_tx: mpsc::Sender<ClientEvent>,
}

impl SessionEffectRunner {
    pub fn new(settings: Settings, client_tx: mpsc::Sender<ClientEvent>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            watchdog: ActivityWatchdog::new(),
            runtime: Arc::new(Mutex::new(Runtime::default())),
            client_tx,
        })
    }

    fn arm_wake_word(&self, generation: Generation, tx: mpsc::Sender<Event>) {
        let runtime = self.runtime.clone();
        let settings = self.settings.clone();

        tokio::spawn(async move {
            let spotter = match build_spotter(&settings) {
                Ok(spotter) => spotter,
                Err(e) => {
                    let _ = tx
                        .send(Event::WakeFailed {
                            generation,
                            err: e.to_string(),
                        })
                        .await;
                    return;
                }
            };

            let (outcome_tx, mut outcome_rx) = mpsc::channel::<WakeOutcome>(1);
            {
                let mut runtime = runtime.lock().await;
                if runtime
                    .armed_generation
                    .is_some_and(|armed| armed >= generation)
                {
                    tracing::debug!("Wake gate already armed");
                    return;
                }
                if let Err(e) = runtime.gate.arm(spotter, settings.sample_rate, outcome_tx) {
                    let _ = tx
                        .send(Event::WakeFailed {
                            generation,
                            err: e.to_string(),
                        })
                        .await;
                    return;
                }
                runtime.armed_generation = Some(generation);
            }

            // One outcome per arm cycle, forwarded with the generation that
            // was current when the gate went up.
            if let Some(outcome) = outcome_rx.recv().await {
                let event = match outcome {
                    WakeOutcome::Detected { keyword_index } => {
                        tracing::info!("Wake word detected (keyword {})", keyword_index);
                        Event::WakeDetected { generation }
                    }
                    WakeOutcome::Failed(e) => Event::WakeFailed {
                        generation,
                        err: e.to_string(),
                    },
                };
                let _ = tx.send(event).await;
            }
        });
    }

    fn connect(&self, generation: Generation, tx: mpsc::Sender<Event>) {
        let runtime = self.runtime.clone();
        let watchdog = self.watchdog.clone();
        let manager = ConnectionManager::new(self.settings.service_url(), self.settings.sample_rate);

        tokio::spawn(async move {
            match manager.connect(&watchdog).await {
                Ok((connection, source)) => {
                    {
                        let mut runtime = runtime.lock().await;
                        runtime.pending = Some(PendingConnection {
                            generation,
                            connection,
                            source,
                        });
                    }
                    let _ = tx.send(Event::ConnectOk { generation }).await;
                }
                Err(e) => {
                    let _ = tx
                        .send(Event::ConnectFailed {
                            generation,
                            err: e.to_string(),
                        })
                        .await;
                }
            }
        });
    }

    fn start_turn(&self, generation: Generation, tx: mpsc::Sender<Event>) {
        let runtime = self.runtime.clone();
        let watchdog = self.watchdog.clone();
        let settings = self.settings.clone();
        let client_tx = self.client_tx.clone();

        tokio::spawn(async move {
            let mut runtime = runtime.lock().await;

            let pending = match runtime.pending.take() {
                Some(p) if p.generation == generation => p,
                other => {
                    // Put back a connection belonging to someone else.
                    runtime.pending = other;
                    let _ = tx
                        .send(Event::TransportFailed {
                            generation,
                            err: "No established connection for this turn".to_string(),
                        })
                        .await;
                    return;
                }
            };
            let connection = pending.connection;

            // Downlink first so the echo-gate probe exists before any frame
            // can be captured.
            let mut downlink = DownlinkJitterBuffer::with_device(
                settings.playback_sample_rate,
                settings.initial_buffer_ms,
            );
            downlink.start();
            let jitter = downlink.handle();
            let probe = jitter.probe();

            let (frames_tx, frames_rx) = mpsc::channel(32);
            let capture = match open_capture(
                CaptureConfig {
                    sample_rate: settings.sample_rate,
                    frame_len: settings.frame_len(),
                },
                frames_tx,
            ) {
                Ok(capture) => capture,
                Err(e) => {
                    downlink.stop();
                    connection.close().await;
                    let _ = tx
                        .send(Event::TransportFailed {
                            generation,
                            err: e.to_string(),
                        })
                        .await;
                    return;
                }
            };

            let cancel = CancellationToken::new();
            watchdog.touch();

            // Uplink send failures come back as transport errors.
            let (uplink_err_tx, mut uplink_err_rx) = mpsc::channel(1);
            runtime.uplink.start(
                capture,
                frames_rx,
                connection.clone(),
                probe,
                watchdog.clone(),
                UplinkConfig {
                    touch_on_playback: settings.touch_on_playback,
                },
                uplink_err_tx,
            );
            {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Some(e) = uplink_err_rx.recv().await {
                        let _ = tx
                            .send(Event::TransportFailed {
                                generation,
                                err: e.to_string(),
                            })
                            .await;
                    }
                });
            }

            // Receive loop: inbound audio to the jitter buffer, transcripts
            // out to the client.
            let (transcript_tx, mut transcript_rx) = mpsc::channel::<TranscriptEvent>(32);
            {
                let client_tx = client_tx.clone();
                tokio::spawn(async move {
                    while let Some(event) = transcript_rx.recv().await {
                        let _ = client_tx.send(ClientEvent::Transcript(event)).await;
                    }
                });
            }
            {
                let tx = tx.clone();
                let connection = connection.clone();
                let watchdog = watchdog.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let end = run_receive_loop(
                        pending.source,
                        connection,
                        jitter,
                        transcript_tx,
                        watchdog,
                        cancel,
                    )
                    .await;
                    let event = match end {
                        ReceiveEnd::RemoteClosed => Some(Event::RemoteClosed { generation }),
                        ReceiveEnd::TransportError(err) => {
                            Some(Event::TransportFailed { generation, err })
                        }
                        ReceiveEnd::Cancelled => None,
                    };
                    if let Some(event) = event {
                        let _ = tx.send(event).await;
                    }
                });
            }

            // Silence watch: end the turn once the conversation goes quiet.
            {
                let tx = tx.clone();
                let watchdog = watchdog.clone();
                let cancel = cancel.clone();
                let timeout = Duration::from_millis(settings.silence_timeout_ms);
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(SILENCE_POLL) => {}
                        }
                        if watchdog.is_expired(timeout) {
                            let _ = tx.send(Event::SilenceTimeout { generation }).await;
                            return;
                        }
                    }
                });
            }

            runtime.connection = Some(connection);
            runtime.downlink = Some(downlink);
            runtime.turn_cancel = Some(cancel);
        });
    }

    fn play_cue_effect(&self, cue: Cue) {
        let path = match cue {
            Cue::Start => self.settings.start_cue.clone(),
            Cue::Stop => self.settings.stop_cue.clone(),
        };
        let Some(path) = path else {
            return;
        };

        tokio::task::spawn_blocking(move || {
            if let Err(e) = play_cue(&path) {
                // A broken earcon never blocks the session.
                tracing::warn!("Cue playback failed for {:?}: {}", path, e);
            }
        });
    }
}

impl EffectRunner for SessionEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::ArmWakeWord { generation } => self.arm_wake_word(generation, tx),

            Effect::DisarmWakeWord { generation } => {
                let runtime = self.runtime.clone();
                tokio::spawn(async move {
                    runtime.lock().await.disarm_gate(generation);
                });
            }

            Effect::Connect { generation } => self.connect(generation, tx),

            Effect::StartTurn { generation } => self.start_turn(generation, tx),

            Effect::StopTurn => {
                let runtime = self.runtime.clone();
                tokio::spawn(async move {
                    runtime.lock().await.stop_turn().await;
                });
            }

            Effect::AbandonConnect { generation } => {
                let runtime = self.runtime.clone();
                tokio::spawn(async move {
                    let mut runtime = runtime.lock().await;
                    if let Some(pending) = runtime.pending.take() {
                        if pending.generation == generation {
                            tracing::info!("Closing connection from superseded generation");
                            pending.connection.close().await;
                        } else {
                            runtime.pending = Some(pending);
                        }
                    }
                });
            }

            Effect::ScheduleRearm { generation, delay } => {
                let delay =
                    delay.unwrap_or(Duration::from_millis(self.settings.settle_delay_ms));
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Event::RearmReady { generation }).await;
                });
            }

            Effect::ReleaseAll { generation } => {
                let runtime = self.runtime.clone();
                tokio::spawn(async move {
                    runtime.lock().await.release_all(generation).await;
                });
            }

            Effect::PlayCue { cue } => self.play_cue_effect(cue),

            Effect::Status(_) | Effect::EmitState => {
                // Handled in the session loop, not here
                unreachable!("Status and EmitState are handled in run_session_loop");
            }
        }
    }
}

/// Stub effect runner for tests: records every effect and auto-resolves
/// connects and re-arm timers so scenario tests can drive the loop.
pub struct StubEffectRunner {
    pub effects: std::sync::Mutex<Vec<Effect>>,
    pub connect_succeeds: bool,
}

impl StubEffectRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            effects: std::sync::Mutex::new(Vec::new()),
            connect_succeeds: true,
        })
    }

    pub fn failing_connects() -> Arc<Self> {
        Arc::new(Self {
            effects: std::sync::Mutex::new(Vec::new()),
            connect_succeeds: false,
        })
    }

    pub fn recorded(&self) -> Vec<Effect> {
        self.effects.lock().unwrap().clone()
    }
}

impl EffectRunner for StubEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        self.effects.lock().unwrap().push(effect.clone());

        match effect {
            Effect::Connect { generation } => {
                let event = if self.connect_succeeds {
                    Event::ConnectOk { generation }
                } else {
                    Event::ConnectFailed {
                        generation,
                        err: "stub connect refused".to_string(),
                    }
                };
                tokio::spawn(async move {
                    let _ = tx.send(event).await;
                });
            }
            Effect::ScheduleRearm { generation, delay } => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay.unwrap_or(Duration::from_millis(1))).await;
                    let _ = tx.send(Event::RearmReady { generation }).await;
                });
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_disarm_leaves_a_newer_gate_alone() {
        // A stop at generation 4 races a start that re-armed for 5: the
        // teardown's disarm lands late and must not release the new gate.
        let mut runtime = Runtime::default();
        runtime.armed_generation = Some(5);

        runtime.disarm_gate(4);
        assert_eq!(runtime.armed_generation, Some(5));

        runtime.disarm_gate(5);
        assert_eq!(runtime.armed_generation, None);
    }

    #[tokio::test]
    async fn stale_release_all_leaves_a_newer_gate_alone() {
        let mut runtime = Runtime::default();
        runtime.armed_generation = Some(3);

        runtime.release_all(2).await;
        assert_eq!(runtime.armed_generation, Some(3));

        runtime.release_all(3).await;
        assert_eq!(runtime.armed_generation, None);
    }
}
