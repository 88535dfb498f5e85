//! wakeline: wake-word voice-assistant client
//!
//! Listens for a wake word, streams microphone audio to a remote speech
//! service over a duplex WebSocket, and plays back streamed response audio
//! while reporting live transcripts.
//!
//! # Architecture
//!
//! ```text
//!  commands ──────> controller (session loop, single writer)
//!                        │ reduce()            ▲ events
//!                        ▼                     │
//!                  effect runner ──────────────┘
//!                  /     |         \
//!            wake gate   turn pipeline          timers/cues
//!            (capture)   (uplink + downlink
//!                         + silence watch)
//! ```
//!
//! The reducer in `state_machine` is pure; everything with a side effect
//! lives behind the `EffectRunner` trait in `controller`.

pub mod audio;
pub mod controller;
pub mod settings;
pub mod state_machine;
pub mod streaming;
pub mod wake;
pub mod watchdog;

pub use controller::{spawn_session, ClientEvent, SessionHandle};
pub use settings::{load_settings, save_settings, Settings};
pub use state_machine::{Event, State};
pub use streaming::TranscriptEvent;
