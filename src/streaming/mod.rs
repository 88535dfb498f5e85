//! Duplex audio streaming over WebSocket
//!
//! One recording turn drives four pieces working together:
//!
//! ```text
//! microphone ──> UplinkStreamer ──binary──> ┌──────────┐
//!                     ▲ echo gate           │  remote  │
//!                     │                     │ service  │
//! speaker <── DownlinkJitterBuffer <─binary─┴──────────┘
//!                                            │
//! transcripts <──── parse_transcript <──text─┘
//! ```
//!
//! `connection` owns the socket lifecycle (dial, handshake, receive loop,
//! close), `uplink` paces captured frames out, `jitter` absorbs inbound
//! audio burstiness before the speaker, and `transcript` decodes the text
//! side of the protocol.

pub mod connection;
pub mod jitter;
pub mod transcript;
pub mod uplink;

pub use connection::{Connection, ConnectionManager, ConnectionState, ReceiveEnd};
pub use jitter::{DownlinkJitterBuffer, JitterHandle, PlaybackProbe, PlaybackState};
pub use transcript::{parse_transcript, TranscriptEvent};
pub use uplink::UplinkStreamer;

/// Errors from the streaming layer.
#[derive(Debug, Clone)]
pub enum StreamError {
    /// Could not establish a connection (all attempts exhausted).
    ConnectFailed(String),
    /// Socket opened but the configuration handshake failed.
    HandshakeFailed(String),
    /// The established connection failed mid-turn.
    Transport(String),
    /// A single inbound message was malformed.
    Protocol(String),
    /// An outbound send failed.
    SendFailed(String),
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::ConnectFailed(e) => write!(f, "Connection failed: {}", e),
            StreamError::HandshakeFailed(e) => write!(f, "Handshake failed: {}", e),
            StreamError::Transport(e) => write!(f, "Transport error: {}", e),
            StreamError::Protocol(e) => write!(f, "Protocol error: {}", e),
            StreamError::SendFailed(e) => write!(f, "Send failed: {}", e),
        }
    }
}

impl std::error::Error for StreamError {}
