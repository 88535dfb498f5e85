//! Speech-activity watchdog
//!
//! Tracks how long it has been since the remote side last showed signs of
//! life (a transcript with text in it, a successful handshake, response
//! audio). The session controller polls this while a turn is active and
//! ends the turn once the configured silence timeout elapses. This is an
//! application-level "the conversation went quiet" policy, not a network
//! timeout.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Shared last-activity clock.
///
/// Cheap to clone; every clone observes the same instant, so the receive
/// loop, the uplink streamer, and the silence watch can all hold one.
#[derive(Debug, Clone)]
pub struct ActivityWatchdog {
    last_activity: Arc<Mutex<Instant>>,
}

impl ActivityWatchdog {
    pub fn new() -> Self {
        Self {
            last_activity: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Reset the clock to now.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Time elapsed since the last `touch()`.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    /// Whether the idle period has exceeded `timeout`.
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.idle_for() > timeout
    }
}

impl Default for ActivityWatchdog {
    fn default() -> Self {
        Self::new()
    }
}
