use crate::asr::{AsrConfig, EndpointMode};
use crate::audioplayer::AudioPlayerConfig;
use crate::display::DisplayConfig;
use crate::focus::{channels, ChannelConfig};
use crate::sim::SimTiming;
use crate::tts::TtsConfig;
use config::{Config, ConfigError, Environment, File};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub listen_addr: String,
    pub log_level: String,
    // Focus channel priorities, lower wins
    pub call_priority: u32,
    pub dialog_priority: u32,
    pub alert_priority: u32,
    pub content_priority: u32,
    pub context_timeout_ms: u64,
    pub event_ack_timeout_ms: u64,
    // Speech recognition
    pub asr_endpoint_mode: String, // "server" or "client"
    pub asr_start_timeout_ms: u64,
    pub asr_listen_timeout_ms: u64,
    pub asr_response_timeout_ms: u64,
    // Text to speech
    pub tts_prehandle_wait_ms: u64,
    pub tts_graceful_stop_wait_ms: u64,
    // Audio player
    pub audio_paused_auto_stop_secs: u64,
    pub audio_release_grace_ms: u64,
    pub audio_stop_timeout_ms: u64,
    // Display
    pub display_dismiss_timeout_ms: u64,
    pub display_render_timeout_ms: u64,
    // Simulated devices
    pub sim_per_word_ms: u64,
    pub sim_url_length_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7878".to_string(),
            log_level: "info".to_string(),
            call_priority: 50,
            dialog_priority: 100,
            alert_priority: 200,
            content_priority: 300,
            context_timeout_ms: 200,
            event_ack_timeout_ms: 5000,
            asr_endpoint_mode: "server".to_string(),
            asr_start_timeout_ms: 5000,
            asr_listen_timeout_ms: 10000,
            asr_response_timeout_ms: 10000,
            tts_prehandle_wait_ms: 10000,
            tts_graceful_stop_wait_ms: 200,
            audio_paused_auto_stop_secs: 600,
            audio_release_grace_ms: 3000,
            audio_stop_timeout_ms: 2000,
            display_dismiss_timeout_ms: 7000,
            display_render_timeout_ms: 5000,
            sim_per_word_ms: 300,
            sim_url_length_secs: 30,
        }
    }
}

lazy_static! {
    static ref SETTINGS: Result<Settings, String> = Settings::new().map_err(|e| e.to_string());
}

/// Settings from the default locations. When those do not load, returns the
/// built-in defaults and the reason, for the caller to log once logging is up.
pub fn current() -> (Settings, Option<String>) {
    match &*SETTINGS {
        Ok(settings) => (settings.clone(), None),
        Err(e) => (Settings::default(), Some(e.clone())),
    }
}

/// `~/.config/dialogd/Dialogd`
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("dialogd").join("Dialogd"))
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Loads defaults, the `Dialogd` file in the working directory, the user
    /// file, `extra` when given, then `DIALOGD_*` environment variables.
    pub fn load(extra: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(File::with_name("Dialogd").required(false));
        if let Some(path) = user_config_path() {
            builder = builder.add_source(File::with_name(&path.to_string_lossy()).required(false));
        }
        if let Some(path) = extra {
            builder = builder.add_source(File::from(path).required(true));
        }
        let settings: Settings = builder
            .add_source(Environment::with_prefix("DIALOGD").try_parsing(true))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.asr_endpoint_mode
            .parse::<EndpointMode>()
            .map_err(ConfigError::Message)?;
        let priorities = [
            self.call_priority,
            self.dialog_priority,
            self.alert_priority,
            self.content_priority,
        ];
        for (i, p) in priorities.iter().enumerate() {
            if priorities[..i].contains(p) {
                return Err(ConfigError::Message(format!(
                    "focus channel priority {} is used twice",
                    p
                )));
            }
        }
        if self.event_ack_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "event_ack_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.asr_listen_timeout_ms == 0 || self.asr_response_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "ASR timeouts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn channel_configs(&self) -> Vec<ChannelConfig> {
        vec![
            ChannelConfig::new(channels::CALL, self.call_priority),
            ChannelConfig::new(channels::DIALOG, self.dialog_priority),
            ChannelConfig::new(channels::ALERT, self.alert_priority),
            ChannelConfig::new(channels::CONTENT, self.content_priority),
        ]
    }

    pub fn context_timeout(&self) -> Duration {
        Duration::from_millis(self.context_timeout_ms)
    }

    pub fn event_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.event_ack_timeout_ms)
    }

    pub fn asr_config(&self) -> AsrConfig {
        AsrConfig {
            endpoint_mode: self
                .asr_endpoint_mode
                .parse()
                .unwrap_or(EndpointMode::Server),
            start_timeout: Duration::from_millis(self.asr_start_timeout_ms),
            listen_timeout: Duration::from_millis(self.asr_listen_timeout_ms),
            response_timeout: Duration::from_millis(self.asr_response_timeout_ms),
        }
    }

    pub fn tts_config(&self) -> TtsConfig {
        TtsConfig {
            prehandle_wait: Duration::from_millis(self.tts_prehandle_wait_ms),
            graceful_stop_wait: Duration::from_millis(self.tts_graceful_stop_wait_ms),
        }
    }

    pub fn audio_player_config(&self) -> AudioPlayerConfig {
        AudioPlayerConfig {
            paused_auto_stop: Duration::from_secs(self.audio_paused_auto_stop_secs),
            release_grace: Duration::from_millis(self.audio_release_grace_ms),
            stop_timeout: Duration::from_millis(self.audio_stop_timeout_ms),
        }
    }

    pub fn display_config(&self) -> DisplayConfig {
        DisplayConfig {
            dismiss_timeout: Duration::from_millis(self.display_dismiss_timeout_ms),
            render_timeout: Duration::from_millis(self.display_render_timeout_ms),
        }
    }

    pub fn sim_timing(&self) -> SimTiming {
        SimTiming {
            per_word: Duration::from_millis(self.sim_per_word_ms),
            url_length: Duration::from_secs(self.sim_url_length_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn test_config_load() {
        let settings = Settings::new().expect("Failed to load settings");
        assert!(settings.event_ack_timeout_ms > 0);
        assert_eq!(settings.channel_configs().len(), 4);
    }

    #[test]
    #[serial]
    fn test_defaults_come_from_default_impl() {
        let settings = Settings::new().unwrap();
        assert_eq!(settings, Settings::default());
        let (current, error) = current();
        assert!(error.is_none());
        assert_eq!(current, settings);
    }

    #[test]
    #[serial]
    fn test_environment_overrides() {
        std::env::set_var("DIALOGD_ASR_ENDPOINT_MODE", "client");
        std::env::set_var("DIALOGD_DIALOG_PRIORITY", "90");
        let settings = Settings::new();
        std::env::remove_var("DIALOGD_ASR_ENDPOINT_MODE");
        std::env::remove_var("DIALOGD_DIALOG_PRIORITY");
        let settings = settings.unwrap();
        assert_eq!(settings.asr_config().endpoint_mode, EndpointMode::Client);
        assert_eq!(settings.dialog_priority, 90);
    }

    #[test]
    #[serial]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "display_dismiss_timeout_ms = 1500").unwrap();
        writeln!(file, "audio_release_grace_ms = 0").unwrap();
        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(
            settings.display_config().dismiss_timeout,
            Duration::from_millis(1500)
        );
        assert!(settings.audio_player_config().release_grace.is_zero());
    }

    #[test]
    #[serial]
    fn test_invalid_file_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "asr_endpoint_mode = \"telepathy\"").unwrap();
        assert!(Settings::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_duplicate_priorities_rejected() {
        let settings = Settings {
            alert_priority: 100,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
        assert!(Settings::default().validate().is_ok());
    }
}
