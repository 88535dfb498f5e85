//! Session state machine
//!
//! Single-writer pattern: all transitions go through the pure `reduce()`
//! function, which returns the next state and a list of effects for the
//! effect runner to execute. The controller loop is the only writer.
//!
//! Every state carries a `generation` counter. Background work (wake
//! detection, connects, silence watches) captures the generation active
//! when it started and stamps it on the events it sends back; the reducer
//! silently drops events whose generation no longer matches, so a slow
//! loop can never act on a session that has since been stopped.

use std::time::Duration;

/// Monotonic fence for background work.
pub type Generation = u64;

/// Consecutive wake-gate failures tolerated before giving up to Idle.
pub const MAX_ARM_FAILURES: u32 = 3;

/// Delay before retrying a failed wake-gate arm.
pub const ARM_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Authoritative session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// Nothing armed, nothing connected. Requires an explicit start.
    Idle { generation: Generation },
    /// Wake gate armed, waiting for the wake word.
    Listening {
        generation: Generation,
        arm_failures: u32,
    },
    /// Wake word heard; gate released, connect in flight.
    StoppingListening { generation: Generation },
    /// Turn active: uplink, downlink, and silence watch all running.
    Recording { generation: Generation },
    /// Turn torn down, waiting out the settle delay before re-arming.
    StoppingRecording { generation: Generation },
}

impl State {
    pub fn generation(&self) -> Generation {
        match self {
            State::Idle { generation }
            | State::Listening { generation, .. }
            | State::StoppingListening { generation }
            | State::Recording { generation }
            | State::StoppingRecording { generation } => *generation,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            State::Idle { .. } => "idle",
            State::Listening { .. } => "listening",
            State::StoppingListening { .. } => "stopping_listening",
            State::Recording { .. } => "recording",
            State::StoppingRecording { .. } => "stopping_recording",
        }
    }
}

impl Default for State {
    fn default() -> Self {
        State::Idle { generation: 0 }
    }
}

/// Cue sounds the effect runner can play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    Start,
    Stop,
}

/// Events that can trigger state transitions.
///
/// Commands come from the user; everything else is stamped with the
/// generation of the work that produced it.
#[derive(Debug, Clone)]
pub enum Event {
    /// User asked the client to start listening
    StartCommand,
    /// User asked the client to stop everything
    StopCommand,

    // Wake gate events
    WakeDetected {
        generation: Generation,
    },
    WakeFailed {
        generation: Generation,
        err: String,
    },

    // Connection events
    ConnectOk {
        generation: Generation,
    },
    ConnectFailed {
        generation: Generation,
        err: String,
    },

    // Turn-ending events
    SilenceTimeout {
        generation: Generation,
    },
    RemoteClosed {
        generation: Generation,
    },
    TransportFailed {
        generation: Generation,
        err: String,
    },

    /// Settle delay (or arm-retry delay) elapsed
    RearmReady {
        generation: Generation,
    },
}

impl Event {
    /// Generation stamped on the event, if it carries one.
    fn generation(&self) -> Option<Generation> {
        match self {
            Event::StartCommand | Event::StopCommand => None,
            Event::WakeDetected { generation }
            | Event::WakeFailed { generation, .. }
            | Event::ConnectOk { generation }
            | Event::ConnectFailed { generation, .. }
            | Event::SilenceTimeout { generation }
            | Event::RemoteClosed { generation }
            | Event::TransportFailed { generation, .. }
            | Event::RearmReady { generation } => Some(*generation),
        }
    }
}

/// Effects to be executed after a state transition.
/// The effect runner handles these asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    ArmWakeWord {
        generation: Generation,
    },
    /// Release the gate, unless it has since been re-armed for a newer
    /// generation
    DisarmWakeWord {
        generation: Generation,
    },
    /// Dial the service; resolves to ConnectOk or ConnectFailed
    Connect {
        generation: Generation,
    },
    /// Start uplink + downlink + silence watch on the pending connection
    StartTurn {
        generation: Generation,
    },
    /// Tear down uplink, downlink, and the connection
    StopTurn,
    /// Close a connection that resolved after its generation went stale
    AbandonConnect {
        generation: Generation,
    },
    /// Send RearmReady after the settle delay
    ScheduleRearm {
        generation: Generation,
        delay: Option<Duration>,
    },
    /// Release every device and cancel background work for this generation
    /// and older
    ReleaseAll {
        generation: Generation,
    },
    PlayCue {
        cue: Cue,
    },
    Status(String),
    /// Signal to publish the new state on the client event channel
    EmitState,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Drop events carrying a stale generation
/// - Emit EmitState after every actual transition
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;

    let current = state.generation();

    // Generation fencing: a stale ConnectOk still owns a live socket that
    // nobody else will close, so it gets an explicit abandon. Every other
    // stale event is dropped outright.
    if let Some(generation) = event.generation() {
        if generation != current {
            if matches!(event, ConnectOk { .. }) {
                return (state.clone(), vec![AbandonConnect { generation }]);
            }
            return (state.clone(), vec![]);
        }
    }

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (State::Idle { generation }, StartCommand) => (
            State::Listening {
                generation: *generation,
                arm_failures: 0,
            },
            vec![
                ArmWakeWord {
                    generation: *generation,
                },
                Status("Listening for wake word".to_string()),
                EmitState,
            ],
        ),
        (State::Idle { .. }, StopCommand) => (state.clone(), vec![]),

        // -----------------
        // Stop from anywhere else: tear everything down, fence off all
        // in-flight work by bumping the generation
        // -----------------
        (_, StopCommand) => (
            State::Idle {
                generation: current + 1,
            },
            vec![
                DisarmWakeWord {
                    generation: current,
                },
                StopTurn,
                ReleaseAll {
                    generation: current,
                },
                Status("Stopped".to_string()),
                EmitState,
            ],
        ),

        // -----------------
        // Listening
        // -----------------
        (State::Listening { generation, .. }, WakeDetected { .. }) => (
            State::StoppingListening {
                generation: *generation,
            },
            vec![
                DisarmWakeWord {
                    generation: *generation,
                },
                PlayCue { cue: Cue::Start },
                Connect {
                    generation: *generation,
                },
                Status("Wake word detected, connecting".to_string()),
                EmitState,
            ],
        ),
        (
            State::Listening {
                generation,
                arm_failures,
            },
            WakeFailed { err, .. },
        ) => {
            let failures = arm_failures + 1;
            if failures >= MAX_ARM_FAILURES {
                (
                    State::Idle {
                        generation: generation + 1,
                    },
                    vec![
                        DisarmWakeWord {
                            generation: *generation,
                        },
                        ReleaseAll {
                            generation: *generation,
                        },
                        Status(format!("Wake gate failed {} times, giving up: {}", failures, err)),
                        EmitState,
                    ],
                )
            } else {
                (
                    State::Listening {
                        generation: *generation,
                        arm_failures: failures,
                    },
                    vec![
                        DisarmWakeWord {
                            generation: *generation,
                        },
                        ScheduleRearm {
                            generation: *generation,
                            delay: Some(ARM_RETRY_DELAY),
                        },
                        Status(format!("Wake gate failed, retrying: {}", err)),
                    ],
                )
            }
        }
        // Arm-retry delay elapsed while still listening
        (State::Listening { generation, .. }, RearmReady { .. }) => (
            state.clone(),
            vec![ArmWakeWord {
                generation: *generation,
            }],
        ),

        // -----------------
        // StoppingListening (connect in flight)
        // -----------------
        (State::StoppingListening { generation }, ConnectOk { .. }) => (
            State::Recording {
                generation: *generation,
            },
            vec![
                StartTurn {
                    generation: *generation,
                },
                Status("Recording".to_string()),
                EmitState,
            ],
        ),
        (State::StoppingListening { generation }, ConnectFailed { err, .. }) => (
            State::Listening {
                generation: *generation,
                arm_failures: 0,
            },
            vec![
                Status(format!("Connection failed: {}", err)),
                ArmWakeWord {
                    generation: *generation,
                },
                EmitState,
            ],
        ),

        // -----------------
        // Recording: silence, remote close, and transport failure all end
        // the turn the same way
        // -----------------
        (State::Recording { generation }, SilenceTimeout { .. }) => {
            end_turn(*generation, "Silence timeout, turn over".to_string())
        }
        (State::Recording { generation }, RemoteClosed { .. }) => {
            end_turn(*generation, "Remote closed the connection".to_string())
        }
        (State::Recording { generation }, TransportFailed { err, .. }) => {
            end_turn(*generation, format!("Transport error: {}", err))
        }

        // -----------------
        // StoppingRecording
        // -----------------
        (State::StoppingRecording { generation }, RearmReady { .. }) => (
            State::Listening {
                generation: *generation,
                arm_failures: 0,
            },
            vec![
                ArmWakeWord {
                    generation: *generation,
                },
                Status("Listening for wake word".to_string()),
                EmitState,
            ],
        ),

        // -----------------
        // Unhandled: no transition (includes a wake trigger outside
        // Listening, which must not restart the pipeline)
        // -----------------
        _ => (state.clone(), vec![]),
    }
}

fn end_turn(generation: Generation, status: String) -> (State, Vec<Effect>) {
    (
        State::StoppingRecording { generation },
        vec![
            Effect::StopTurn,
            Effect::PlayCue { cue: Cue::Stop },
            Effect::ScheduleRearm {
                generation,
                delay: None,
            },
            Effect::Status(status),
            Effect::EmitState,
        ],
    )
}
