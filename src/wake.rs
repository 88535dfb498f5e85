//! Wake-word gating
//!
//! The `WakeWordGate` owns the microphone while the client sits in the
//! listening state: it opens the capture device at the spotter's frame
//! length, runs a detection loop, and reports at most one outcome per arm
//! cycle before stopping itself. The spotter behind the gate is a trait so
//! a real keyword-spotting model can replace the shipped energy-pattern
//! implementation without touching the gate.

use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::{open_capture, AudioError, AudioFrame, CaptureConfig, CaptureHandle};
use crate::settings::Settings;

/// Mono samples per spotter frame, matching common keyword models at 16kHz.
const SPOTTER_FRAME_LEN: usize = 512;

/// Errors from the wake-word path.
#[derive(Debug, Clone)]
pub enum WakeError {
    Device(AudioError),
    Classifier(String),
    ModelMissing(PathBuf),
}

impl std::fmt::Display for WakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WakeError::Device(e) => write!(f, "Wake-word capture device failed: {}", e),
            WakeError::Classifier(e) => write!(f, "Keyword classifier failed: {}", e),
            WakeError::ModelMissing(path) => {
                write!(f, "Keyword model file not found: {}", path.display())
            }
        }
    }
}

impl std::error::Error for WakeError {}

/// Result of one arm cycle, delivered exactly once.
#[derive(Debug)]
pub enum WakeOutcome {
    Detected { keyword_index: usize },
    Failed(WakeError),
}

/// Keyword spotter: fixed-length PCM frame in, match index out.
pub trait KeywordSpotter: Send {
    /// Samples the spotter expects per `process` call.
    fn frame_length(&self) -> usize;
    /// Feed one frame; `Some(index)` when a keyword matched.
    fn process(&mut self, frame: &[i16]) -> Result<Option<usize>, WakeError>;
}

/// Energy-pattern spotter: triggers once the frame RMS stays above a
/// threshold for a run of consecutive frames. A stand-in with the same
/// interface shape as a real keyword-spotting model.
pub struct EnergySpotter {
    threshold: f64,
    required_streak: u32,
    streak: u32,
}

impl EnergySpotter {
    pub fn new(threshold: f64, required_streak: u32) -> Self {
        Self {
            threshold,
            required_streak: required_streak.max(1),
            streak: 0,
        }
    }
}

impl Default for EnergySpotter {
    fn default() -> Self {
        // ~1% of full scale sustained for a third of a second at 512/16k
        Self::new(330.0, 10)
    }
}

impl KeywordSpotter for EnergySpotter {
    fn frame_length(&self) -> usize {
        SPOTTER_FRAME_LEN
    }

    fn process(&mut self, frame: &[i16]) -> Result<Option<usize>, WakeError> {
        if frame.is_empty() {
            return Ok(None);
        }
        if calculate_rms(frame) >= self.threshold {
            self.streak += 1;
        } else {
            self.streak = 0;
        }
        if self.streak >= self.required_streak {
            self.streak = 0;
            return Ok(Some(0));
        }
        Ok(None)
    }
}

fn calculate_rms(samples: &[i16]) -> f64 {
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt()
}

/// Build the configured spotter, validating model files first.
///
/// Model paths that do not exist are a hard error at arm time rather than a
/// silent misdetection later.
pub fn build_spotter(settings: &Settings) -> Result<Box<dyn KeywordSpotter>, WakeError> {
    for path in &settings.wake_word_models {
        if !path.exists() {
            return Err(WakeError::ModelMissing(path.clone()));
        }
    }
    Ok(Box::new(EnergySpotter::default()))
}

/// Owns the microphone and detection loop between arm and disarm.
pub struct WakeWordGate {
    cancel: Option<CancellationToken>,
    task: Option<tokio::task::JoinHandle<()>>,
    capture: Option<CaptureHandle>,
}

impl WakeWordGate {
    pub fn new() -> Self {
        Self {
            cancel: None,
            task: None,
            capture: None,
        }
    }

    /// Open the capture device and start the detection loop.
    ///
    /// No-op when already armed. Exactly one `WakeOutcome` will be sent on
    /// `outcome_tx`, after which the loop stops on its own; the capture
    /// device stays held until `disarm()`.
    pub fn arm(
        &mut self,
        spotter: Box<dyn KeywordSpotter>,
        sample_rate: u32,
        outcome_tx: mpsc::Sender<WakeOutcome>,
    ) -> Result<(), WakeError> {
        if self.task.is_some() {
            tracing::debug!("Wake gate already armed");
            return Ok(());
        }

        let (frames_tx, frames_rx) = mpsc::channel::<AudioFrame>(32);
        let capture = open_capture(
            CaptureConfig {
                sample_rate,
                frame_len: spotter.frame_length(),
            },
            frames_tx,
        )
        .map_err(WakeError::Device)?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_detection_loop(
            frames_rx,
            spotter,
            cancel.clone(),
            outcome_tx,
        ));

        self.cancel = Some(cancel);
        self.task = Some(task);
        self.capture = Some(capture);
        tracing::info!("Wake gate armed");
        Ok(())
    }

    /// Stop the loop and release the microphone. Idempotent.
    pub fn disarm(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
            tracing::info!("Wake gate disarmed");
        }
    }
}

impl Default for WakeWordGate {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WakeWordGate {
    fn drop(&mut self) {
        self.disarm();
    }
}

async fn run_detection_loop(
    mut frames_rx: mpsc::Receiver<AudioFrame>,
    mut spotter: Box<dyn KeywordSpotter>,
    cancel: CancellationToken,
    outcome_tx: mpsc::Sender<WakeOutcome>,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = frames_rx.recv() => frame,
        };

        let Some(frame) = frame else {
            let _ = outcome_tx
                .send(WakeOutcome::Failed(WakeError::Device(
                    AudioError::DeviceThreadFailed("Capture stream ended".into()),
                )))
                .await;
            return;
        };

        match spotter.process(&frame.samples) {
            Ok(Some(keyword_index)) => {
                let _ = outcome_tx
                    .send(WakeOutcome::Detected { keyword_index })
                    .await;
                return;
            }
            Ok(None) => {}
            Err(e) => {
                let _ = outcome_tx.send(WakeOutcome::Failed(e)).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud_frame() -> Vec<i16> {
        vec![5000i16; SPOTTER_FRAME_LEN]
    }

    fn quiet_frame() -> Vec<i16> {
        vec![10i16; SPOTTER_FRAME_LEN]
    }

    #[test]
    fn spotter_triggers_on_sustained_energy() {
        let mut spotter = EnergySpotter::new(1000.0, 3);
        assert_eq!(spotter.process(&loud_frame()).unwrap(), None);
        assert_eq!(spotter.process(&loud_frame()).unwrap(), None);
        assert_eq!(spotter.process(&loud_frame()).unwrap(), Some(0));
    }

    #[test]
    fn spotter_streak_resets_on_quiet_frame() {
        let mut spotter = EnergySpotter::new(1000.0, 3);
        spotter.process(&loud_frame()).unwrap();
        spotter.process(&loud_frame()).unwrap();
        spotter.process(&quiet_frame()).unwrap();
        assert_eq!(spotter.process(&loud_frame()).unwrap(), None);
    }

    #[test]
    fn spotter_ignores_quiet_audio() {
        let mut spotter = EnergySpotter::new(1000.0, 2);
        for _ in 0..20 {
            assert_eq!(spotter.process(&quiet_frame()).unwrap(), None);
        }
    }

    #[test]
    fn spotter_rearms_after_trigger() {
        let mut spotter = EnergySpotter::new(1000.0, 2);
        spotter.process(&loud_frame()).unwrap();
        assert_eq!(spotter.process(&loud_frame()).unwrap(), Some(0));
        // Streak restarts from zero after a match
        assert_eq!(spotter.process(&loud_frame()).unwrap(), None);
        assert_eq!(spotter.process(&loud_frame()).unwrap(), Some(0));
    }

    #[test]
    fn empty_frame_is_a_no_op() {
        let mut spotter = EnergySpotter::new(1000.0, 1);
        assert_eq!(spotter.process(&[]).unwrap(), None);
    }

    #[test]
    fn missing_model_file_fails_validation() {
        let settings = Settings {
            wake_word_models: vec![PathBuf::from("/nonexistent/model.ppn")],
            ..Default::default()
        };
        assert!(matches!(
            build_spotter(&settings),
            Err(WakeError::ModelMissing(_))
        ));
    }

    #[test]
    fn no_models_configured_is_valid() {
        let settings = Settings::default();
        assert!(build_spotter(&settings).is_ok());
    }

    #[test]
    fn disarm_without_arm_is_a_no_op() {
        let mut gate = WakeWordGate::new();
        gate.disarm();
        gate.disarm();
    }

    #[tokio::test]
    async fn detection_loop_reports_exactly_one_outcome() {
        let (frames_tx, frames_rx) = mpsc::channel(8);
        let (outcome_tx, mut outcome_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let spotter = Box::new(EnergySpotter::new(1000.0, 2));
        let task = tokio::spawn(run_detection_loop(
            frames_rx,
            spotter,
            cancel.clone(),
            outcome_tx,
        ));

        for _ in 0..5 {
            let frame = AudioFrame::new(loud_frame(), 16000, 1);
            frames_tx.send(frame).await.unwrap();
        }

        let outcome = outcome_rx.recv().await.unwrap();
        assert!(matches!(outcome, WakeOutcome::Detected { keyword_index: 0 }));

        // Loop exits after the first outcome, closing its end.
        task.await.unwrap();
        assert!(outcome_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn detection_loop_reports_device_loss() {
        let (frames_tx, frames_rx) = mpsc::channel::<AudioFrame>(8);
        let (outcome_tx, mut outcome_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let spotter = Box::new(EnergySpotter::default());
        tokio::spawn(run_detection_loop(
            frames_rx,
            spotter,
            cancel.clone(),
            outcome_tx,
        ));

        drop(frames_tx);

        let outcome = outcome_rx.recv().await.unwrap();
        assert!(matches!(
            outcome,
            WakeOutcome::Failed(WakeError::Device(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_loop_sends_nothing() {
        let (_frames_tx, frames_rx) = mpsc::channel::<AudioFrame>(8);
        let (outcome_tx, mut outcome_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let spotter = Box::new(EnergySpotter::default());
        let task = tokio::spawn(run_detection_loop(
            frames_rx,
            spotter,
            cancel.clone(),
            outcome_tx,
        ));

        cancel.cancel();
        task.await.unwrap();
        assert!(outcome_rx.recv().await.is_none());
    }
}
