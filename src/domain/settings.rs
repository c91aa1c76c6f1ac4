use crate::domain::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "ble_midi_bridge".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Bridge configuration. Read-only to a running supervisor; changing it
/// goes through stop, apply, start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// Case-sensitive substring of the advertised peripheral name.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Substring of the MIDI output port name.
    #[serde(default = "default_midi_port")]
    pub midi_port: String,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Seconds between retries. Also the backoff interval.
    #[serde(default = "default_scan_interval")]
    pub scan_interval: u64,
    /// Seconds a single scan may run before giving up.
    #[serde(default = "default_phase_timeout")]
    pub scan_timeout: u64,
    #[serde(default = "default_phase_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_phase_timeout")]
    pub subscribe_timeout: u64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            midi_port: default_midi_port(),
            auto_reconnect: true,
            scan_interval: default_scan_interval(),
            scan_timeout: default_phase_timeout(),
            connect_timeout: default_phase_timeout(),
            subscribe_timeout: default_phase_timeout(),
        }
    }
}

fn default_device_name() -> String {
    "FP-18".to_string()
}
fn default_midi_port() -> String {
    "loopMIDI ToSeeMusic".to_string()
}
fn default_scan_interval() -> u64 {
    5
}
fn default_phase_timeout() -> u64 {
    10
}

impl Configuration {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name.trim().is_empty() {
            return Err(ConfigError::EmptyDeviceName);
        }
        if self.midi_port.trim().is_empty() {
            return Err(ConfigError::EmptyMidiPort);
        }
        let durations = [
            ("scan_interval", self.scan_interval),
            ("scan_timeout", self.scan_timeout),
            ("connect_timeout", self.connect_timeout),
            ("subscribe_timeout", self.subscribe_timeout),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        Ok(())
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.scan_interval)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_secs(self.subscribe_timeout)
    }
}

/// Contents of `config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(flatten)]
    pub bridge: Configuration,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load from the per-user config directory.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from an explicit path, falling back to defaults when the file is
    /// missing or unreadable. A missing file is created with the defaults.
    pub fn from_path(settings_path: PathBuf) -> Self {
        let missing = !settings_path.exists();
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        let service = Self {
            settings,
            settings_path,
        };
        if missing {
            if let Err(e) = service.save() {
                tracing::warn!("Could not write default settings: {}", e);
            }
        }
        service
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleMidiBridge");
        fs::create_dir_all(&path)?;
        path.push("config.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "device_name": "Roland FP-18", "scan_interval": 3 }"#)
                .unwrap();
        assert_eq!(settings.bridge.device_name, "Roland FP-18");
        assert_eq!(settings.bridge.scan_interval, 3);
        assert_eq!(settings.bridge.midi_port, "loopMIDI ToSeeMusic");
        assert!(settings.bridge.auto_reconnect);
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_validate_rejects_blank_fields() {
        let mut config = Configuration::default();
        assert!(config.validate().is_ok());

        config.device_name = "   ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyDeviceName));

        config.device_name = "FP-18".to_string();
        config.midi_port.clear();
        assert_eq!(config.validate(), Err(ConfigError::EmptyMidiPort));

        config.midi_port = "loopMIDI".to_string();
        config.connect_timeout = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration("connect_timeout"))
        );
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("ble_midi_bridge_missing_settings.json");
        let _ = fs::remove_file(&path);
        let service = SettingsService::from_path(path.clone());
        assert_eq!(service.get().bridge, Configuration::default());

        // Defaults are written back for editing
        let written = SettingsService::load_from_file(&path).unwrap();
        assert_eq!(written.bridge, Configuration::default());
        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_save_and_reload() {
        let path = std::env::temp_dir().join(format!(
            "ble_midi_bridge_settings_{}.json",
            std::process::id()
        ));
        let mut service = SettingsService::from_path(path.clone());
        service.get_mut().bridge.device_name = "Digital Piano".to_string();
        service.save().unwrap();

        let reloaded = SettingsService::from_path(path.clone());
        assert_eq!(reloaded.get().bridge.device_name, "Digital Piano");
        let _ = fs::remove_file(path);
    }
}
