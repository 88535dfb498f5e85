//! Uplink audio streaming
//!
//! Forwards captured microphone frames to the service as binary WebSocket
//! messages, one frame per message, gated per frame: the connection must be
//! open and response playback must not be active (echo suppression, so the
//! assistant never hears itself through the speakers). Gated frames are
//! dropped whole; nothing is fragmented or reordered. A send failure ends
//! the turn and is never retried here.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::connection::Connection;
use super::jitter::PlaybackProbe;
use super::StreamError;
use crate::audio::{AudioFrame, CaptureHandle};
use crate::watchdog::ActivityWatchdog;

/// What to do with one captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameGate {
    Send,
    DropClosed,
    DropEchoGate,
}

fn frame_disposition(connection_open: bool, playback_active: bool) -> FrameGate {
    if !connection_open {
        FrameGate::DropClosed
    } else if playback_active {
        FrameGate::DropEchoGate
    } else {
        FrameGate::Send
    }
}

/// Owns the capture device and the forwarding task for one turn.
pub struct UplinkStreamer {
    cancel: Option<CancellationToken>,
    task: Option<tokio::task::JoinHandle<()>>,
    capture: Option<CaptureHandle>,
}

pub struct UplinkConfig {
    /// Reset the silence clock while response audio is playing.
    pub touch_on_playback: bool,
}

impl UplinkStreamer {
    pub fn new() -> Self {
        Self {
            cancel: None,
            task: None,
            capture: None,
        }
    }

    /// Start forwarding frames. No-op when already running.
    ///
    /// The streamer takes ownership of the capture handle so the device is
    /// released on `stop()`. A send failure is reported once on `error_tx`
    /// and the task exits.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &mut self,
        capture: CaptureHandle,
        frames_rx: mpsc::Receiver<AudioFrame>,
        connection: Connection,
        probe: PlaybackProbe,
        watchdog: ActivityWatchdog,
        config: UplinkConfig,
        error_tx: mpsc::Sender<StreamError>,
    ) {
        if self.task.is_some() {
            tracing::debug!("Uplink already running");
            return;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_uplink_loop(
            frames_rx,
            connection,
            probe,
            watchdog,
            config,
            error_tx,
            cancel.clone(),
        ));

        self.cancel = Some(cancel);
        self.task = Some(task);
        self.capture = Some(capture);
        tracing::info!("Uplink started");
    }

    /// Stop forwarding and release the capture device. Idempotent.
    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
            tracing::info!("Uplink stopped");
        }
    }
}

impl Default for UplinkStreamer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UplinkStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_uplink_loop(
    mut frames_rx: mpsc::Receiver<AudioFrame>,
    connection: Connection,
    probe: PlaybackProbe,
    watchdog: ActivityWatchdog,
    config: UplinkConfig,
    error_tx: mpsc::Sender<StreamError>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = frames_rx.recv() => frame,
        };

        let Some(frame) = frame else {
            tracing::debug!("Capture stream ended, uplink exiting");
            return;
        };

        match frame_disposition(connection.is_open(), probe.is_playing()) {
            FrameGate::Send => {
                if let Err(e) = connection.send_binary(frame.to_le_bytes()).await {
                    tracing::warn!("Uplink send failed: {}", e);
                    let _ = error_tx.send(e).await;
                    return;
                }
            }
            FrameGate::DropEchoGate => {
                // The remote is still talking; keep the turn alive without
                // feeding it our speaker output.
                if config.touch_on_playback {
                    watchdog.touch();
                }
            }
            FrameGate::DropClosed => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_sent_when_open_and_quiet() {
        assert_eq!(frame_disposition(true, false), FrameGate::Send);
    }

    #[test]
    fn frames_dropped_while_playback_active() {
        assert_eq!(frame_disposition(true, true), FrameGate::DropEchoGate);
    }

    #[test]
    fn frames_dropped_when_connection_not_open() {
        assert_eq!(frame_disposition(false, false), FrameGate::DropClosed);
        assert_eq!(frame_disposition(false, true), FrameGate::DropClosed);
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let mut uplink = UplinkStreamer::new();
        uplink.stop();
        uplink.stop();
    }
}
