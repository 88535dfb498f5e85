//! WebSocket connection lifecycle
//!
//! Dials the speech service with bounded retries, performs the one-line
//! configuration handshake, and runs the receive loop that fans inbound
//! frames out to the jitter buffer and the transcript channel. Only this
//! module touches the socket; everyone else holds a `Connection` handle
//! with a coarse lock-free state probe.
//!
//! Mid-turn disconnects do NOT reconnect; the turn ends and the client
//! goes back to listening.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::jitter::JitterHandle;
use super::transcript::{parse_transcript, TranscriptEvent};
use super::StreamError;
use crate::audio::pcm16_from_le_bytes;
use crate::watchdog::ActivityWatchdog;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
/// Read half of an established connection, consumed by `run_receive_loop`.
pub type WsSource = SplitStream<WsStream>;

/// Per-attempt timeout for the WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum attempts for establishing a connection
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (doubles each retry)
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Coarse connection state, observable without touching the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed = 0,
    Connecting = 1,
    Open = 2,
    Closing = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Open,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

#[derive(Serialize)]
struct Handshake {
    config: HandshakeConfig,
}

#[derive(Serialize)]
struct HandshakeConfig {
    sample_rate: u32,
}

fn handshake_message(sample_rate: u32) -> Result<String, StreamError> {
    serde_json::to_string(&Handshake {
        config: HandshakeConfig { sample_rate },
    })
    .map_err(|e| StreamError::HandshakeFailed(e.to_string()))
}

/// Write half of an established connection.
///
/// Cheap to clone; the uplink streamer, the receive loop, and teardown
/// paths all hold one. The shared state cell goes `Closed` on the first
/// send failure so every holder stops writing at once.
#[derive(Clone)]
pub struct Connection {
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    state: Arc<AtomicU8>,
}

impl Connection {
    fn new(sink: WsSink) -> Self {
        Self {
            sink: Arc::new(tokio::sync::Mutex::new(sink)),
            state: Arc::new(AtomicU8::new(ConnectionState::Open as u8)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub(crate) fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);
    }

    /// Send one binary frame. Failure closes the connection state.
    pub async fn send_binary(&self, payload: Vec<u8>) -> Result<(), StreamError> {
        if !self.is_open() {
            return Err(StreamError::SendFailed("Connection not open".into()));
        }

        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Binary(payload)).await {
            self.mark_closed();
            return Err(StreamError::SendFailed(e.to_string()));
        }
        Ok(())
    }

    /// Graceful close handshake when open, no-op otherwise.
    ///
    /// Safe to call from any teardown path, any number of times.
    pub async fn close(&self) {
        let previous = self.state.swap(ConnectionState::Closing as u8, Ordering::SeqCst);
        if ConnectionState::from_u8(previous) == ConnectionState::Open {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.close().await {
                tracing::warn!("Error closing WebSocket: {}", e);
            }
        }
        self.mark_closed();
    }
}

/// Dials the service and hands out established connections.
pub struct ConnectionManager {
    url: String,
    sample_rate: u32,
    max_retries: u32,
    base_delay: Duration,
}

impl ConnectionManager {
    pub fn new(url: impl Into<String>, sample_rate: u32) -> Self {
        Self::with_retry_policy(url, sample_rate, MAX_RETRIES, RETRY_BASE_DELAY)
    }

    pub fn with_retry_policy(
        url: impl Into<String>,
        sample_rate: u32,
        max_retries: u32,
        base_delay: Duration,
    ) -> Self {
        Self {
            url: url.into(),
            sample_rate,
            max_retries,
            base_delay,
        }
    }

    /// Establish a connection, with retries and exponential backoff.
    ///
    /// On success the configuration handshake has already been sent and the
    /// watchdog touched; the caller receives the write handle plus the read
    /// half to feed into `run_receive_loop`.
    pub async fn connect(
        &self,
        watchdog: &ActivityWatchdog,
    ) -> Result<(Connection, WsSource), StreamError> {
        let mut last_error = None;

        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let delay = self.base_delay * 2u32.pow(attempt - 1);
                tracing::info!(
                    "Retrying connection in {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    self.max_retries
                );
                tokio::time::sleep(delay).await;
            }

            match self.try_connect().await {
                Ok(pair) => {
                    watchdog.touch();
                    return Ok(pair);
                }
                Err(e) => {
                    tracing::warn!("Connection attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| StreamError::ConnectFailed("Max retries exceeded".to_string())))
    }

    /// Single connection attempt (no retries).
    async fn try_connect(&self) -> Result<(Connection, WsSource), StreamError> {
        tracing::info!("Connecting to {}", self.url);

        let (ws_stream, _response) = timeout(CONNECTION_TIMEOUT, connect_async(&self.url))
            .await
            .map_err(|_| StreamError::ConnectFailed("Connection timeout".to_string()))?
            .map_err(|e| StreamError::ConnectFailed(e.to_string()))?;

        let (mut write, read) = ws_stream.split();

        let handshake = handshake_message(self.sample_rate)?;
        write
            .send(Message::Text(handshake))
            .await
            .map_err(|e| StreamError::HandshakeFailed(e.to_string()))?;

        tracing::info!("Connected, handshake sent ({} Hz)", self.sample_rate);

        Ok((Connection::new(write), read))
    }
}

/// Why the receive loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveEnd {
    /// Remote sent a close frame or the stream ended.
    RemoteClosed,
    /// The socket failed mid-turn.
    TransportError(String),
    /// Teardown cancelled the loop.
    Cancelled,
}

/// Drain inbound messages until the connection or the turn ends.
///
/// Binary frames are PCM16-LE response audio for the jitter buffer; text
/// frames are transcript JSON. A malformed text frame is logged and
/// discarded without ending the turn. Delivery order matches arrival
/// order.
pub async fn run_receive_loop(
    mut source: WsSource,
    connection: Connection,
    jitter: JitterHandle,
    transcript_tx: mpsc::Sender<TranscriptEvent>,
    watchdog: ActivityWatchdog,
    cancel: CancellationToken,
) -> ReceiveEnd {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return ReceiveEnd::Cancelled,
            message = source.next() => message,
        };

        match message {
            Some(Ok(Message::Binary(payload))) => {
                jitter.add_chunk(pcm16_from_le_bytes(&payload));
            }
            Some(Ok(Message::Text(raw))) => match parse_transcript(&raw) {
                Ok(Some(event)) => {
                    watchdog.touch();
                    if transcript_tx.send(event).await.is_err() {
                        tracing::debug!("Transcript channel closed");
                        return ReceiveEnd::Cancelled;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Discarding malformed message: {}", e);
                }
            },
            Some(Ok(Message::Close(_))) => {
                tracing::info!("WebSocket closed by server");
                connection.mark_closed();
                return ReceiveEnd::RemoteClosed;
            }
            Some(Ok(_)) => {} // Ignore ping/pong
            Some(Err(e)) => {
                tracing::warn!("WebSocket error: {}", e);
                connection.mark_closed();
                return ReceiveEnd::TransportError(e.to_string());
            }
            None => {
                connection.mark_closed();
                return ReceiveEnd::RemoteClosed;
            }
        }
    }
}
