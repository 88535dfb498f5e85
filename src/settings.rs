use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const SETTINGS_FILE_NAME: &str = "settings.json";
const CONFIG_DIR_NAME: &str = "wakeline";

/// Environment variable overriding the configured service URL.
pub const WS_URL_ENV: &str = "WAKELINE_WS_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Access key for the keyword-spotting engine.
    pub access_key: String,

    /// Speech service WebSocket URL. `WAKELINE_WS_URL` overrides this.
    pub websocket_url: String,

    /// Capture sample rate declared in the handshake.
    pub sample_rate: u32,

    /// Keyword model files; validated to exist when the gate is armed.
    pub wake_word_models: Vec<PathBuf>,

    /// WAV earcon played when a recording turn begins. Empty = no cue.
    pub start_cue: Option<PathBuf>,

    /// WAV earcon played when a recording turn ends. Empty = no cue.
    pub stop_cue: Option<PathBuf>,

    /// How long the conversation may stay quiet before the turn ends.
    pub silence_timeout_ms: u64,

    /// Pause between tearing a turn down and re-arming the wake gate,
    /// bounding races between device teardown and re-init.
    pub settle_delay_ms: u64,

    /// Duration of each uplink audio frame.
    pub frame_ms: u64,

    /// Sample rate of inbound response audio.
    pub playback_sample_rate: u32,

    /// Initial jitter-buffer target depth.
    pub initial_buffer_ms: u64,

    /// Keep the silence clock alive while response audio is playing.
    pub touch_on_playback: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            websocket_url: "ws://127.0.0.1:8080/asr".to_string(),
            sample_rate: 16000,
            wake_word_models: Vec::new(),
            start_cue: None,
            stop_cue: None,
            silence_timeout_ms: 5000,
            settle_delay_ms: 300,
            frame_ms: 100,
            playback_sample_rate: 48000,
            initial_buffer_ms: 1000,
            touch_on_playback: true,
        }
    }
}

impl Settings {
    /// Mono samples per uplink frame.
    pub fn frame_len(&self) -> usize {
        (self.sample_rate as u64 * self.frame_ms / 1000) as usize
    }

    /// Service URL, with the environment override applied.
    pub fn service_url(&self) -> String {
        std::env::var(WS_URL_ENV)
            .ok()
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| self.websocket_url.clone())
    }

    /// Replace values that would break the audio math with their defaults.
    /// Durations and sample counts are derived by dividing by these, so a
    /// hand-edited zero must never reach the pipeline.
    fn sanitized(mut self) -> Self {
        let defaults = Settings::default();
        if self.sample_rate == 0 {
            tracing::warn!(
                "Settings: sample_rate 0 is invalid, using {}",
                defaults.sample_rate
            );
            self.sample_rate = defaults.sample_rate;
        }
        if self.playback_sample_rate == 0 {
            tracing::warn!(
                "Settings: playback_sample_rate 0 is invalid, using {}",
                defaults.playback_sample_rate
            );
            self.playback_sample_rate = defaults.playback_sample_rate;
        }
        if self.frame_ms == 0 {
            tracing::warn!(
                "Settings: frame_ms 0 is invalid, using {}",
                defaults.frame_ms
            );
            self.frame_ms = defaults.frame_ms;
        }
        self
    }
}

fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or("Could not determine config directory")?;
    Ok(dir.join(CONFIG_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> Settings {
    let path = match settings_path() {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!("Settings: {}", e);
            return Settings::default();
        }
    };
    load_settings_from(&path)
}

fn load_settings_from(path: &Path) -> Settings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<Settings>(&contents) {
            Ok(settings) => settings.sanitized(),
            Err(e) => {
                tracing::warn!("Settings: failed to parse {:?}: {}", path, e);
                Settings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
        Err(e) => {
            tracing::warn!("Settings: failed to read {:?}: {}", path, e);
            Settings::default()
        }
    }
}

pub fn save_settings(settings: &Settings) -> Result<(), String> {
    let path = settings_path()?;
    save_settings_to(&path, settings)
}

fn save_settings_to(path: &Path, settings: &Settings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write atomically: write to a temp file in the same directory, then rename.
    // This prevents partial/corrupt settings.json if the process dies mid-write.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // On Unix, rename will atomically replace the destination. On Windows, rename
    // fails if the destination exists, so we remove it first (ignoring NotFound).
    if cfg!(windows) {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(format!("Remove existing settings file {:?}: {}", path, e));
                }
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.sample_rate, 16000);
        assert_eq!(settings.silence_timeout_ms, 5000);
        assert_eq!(settings.settle_delay_ms, 300);
        assert_eq!(settings.frame_len(), 1600);
        assert!(settings.touch_on_playback);
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut settings = Settings::default();
        settings.websocket_url = "ws://example.test/asr".to_string();
        settings.silence_timeout_ms = 7000;

        save_settings_to(&path, &settings).unwrap();
        let loaded = load_settings_from(&path);

        assert_eq!(loaded.websocket_url, "ws://example.test/asr");
        assert_eq!(loaded.silence_timeout_ms, 7000);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_settings_from(&dir.path().join("nope.json"));
        assert_eq!(loaded.sample_rate, Settings::default().sample_rate);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ this is not json").unwrap();
        let loaded = load_settings_from(&path);
        assert_eq!(loaded.silence_timeout_ms, 5000);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"sample_rate": 8000, "future_field": true}"#).unwrap();
        let loaded = load_settings_from(&path);
        assert_eq!(loaded.sample_rate, 8000);
    }

    #[test]
    fn zero_rates_are_replaced_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"sample_rate": 0, "playback_sample_rate": 0, "frame_ms": 0}"#,
        )
        .unwrap();
        let loaded = load_settings_from(&path);
        assert_eq!(loaded.sample_rate, 16000);
        assert_eq!(loaded.playback_sample_rate, 48000);
        assert_eq!(loaded.frame_ms, 100);
        assert_eq!(loaded.frame_len(), 1600);
    }

    #[test]
    fn save_is_atomic_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        save_settings_to(&path, &Settings::default()).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
