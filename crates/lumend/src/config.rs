//! Configuration file parsing and structures.
//!
//! lumend uses TOML for declarative configuration: which fixture to control,
//! the lighting profiles available, and the schedule rules that apply them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use tracing_subscriber::filter::LevelFilter;

use crate::device::DEFAULT_PORT;
use crate::profile::Profile;
use crate::schedule::ScheduleRule;

/// Top-level configuration structure
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub api: Option<ApiConfig>,

    /// Fixture to connect to at startup. Without one, lumend starts idle
    /// and only serves discovery commands.
    #[serde(default)]
    pub device: Option<DeviceConfig>,

    #[serde(default)]
    pub profiles: Vec<Profile>,

    #[serde(default)]
    pub schedules: Vec<ScheduleRule>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,
}

/// HTTP status API configuration
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,

    #[serde(default = "default_api_listen")]
    pub listen: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8090
}

/// Fixture address configuration
#[derive(Debug, Deserialize)]
pub struct DeviceConfig {
    pub ip: String,

    #[serde(default = "default_device_port")]
    pub port: u16,
}

fn default_device_port() -> u16 {
    DEFAULT_PORT
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Profiles from the config file, or the builtin set when none are
    /// configured.
    pub fn profiles(&self) -> Vec<Profile> {
        if self.profiles.is_empty() {
            Profile::defaults()
        } else {
            self.profiles.clone()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.logging.level, LogLevel::Info);
        assert!(config.device.is_none());
        assert!(config.api.is_none());
        assert!(config.schedules.is_empty());

        // No configured profiles falls back to the builtins.
        let profiles = config.profiles();
        assert!(profiles.iter().any(|p| p.id == "work"));
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [logging]
            level = "debug"

            [api]
            enabled = true
            listen = "0.0.0.0"
            port = 9000

            [device]
            ip = "192.168.1.45"

            [[profiles]]
            id = "evening"
            name = "Evening"
            main_power = true
            main_brightness = 35
            color_temperature = 2700
            bg_power = true
            bg_rgb = 0xFF6B00

            [[schedules]]
            id = "evening-rule"
            name = "Evening"
            start_hour = 19
            end_hour = 23
            profile = "evening"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);

        let api = config.api.as_ref().unwrap();
        assert!(api.enabled);
        assert_eq!(api.port, 9000);

        let device = config.device.as_ref().unwrap();
        assert_eq!(device.ip, "192.168.1.45");
        assert_eq!(device.port, DEFAULT_PORT);

        let profiles = config.profiles();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].id, "evening");
        assert_eq!(profiles[0].bg_rgb, 0xFF_6B_00);

        assert_eq!(config.schedules.len(), 1);
        assert_eq!(config.schedules[0].profile, "evening");
    }

    #[test]
    fn test_api_defaults() {
        let toml = r#"
            [api]
            enabled = true
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        let api = config.api.unwrap();
        assert_eq!(api.listen, "127.0.0.1");
        assert_eq!(api.port, 8090);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"warn\"").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.logging.level, LogLevel::Warn);
    }

    #[test]
    fn test_from_file_missing() {
        let err = Config::from_file("/nonexistent/lumend.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_, _)));
    }
}
