//! Configuration model for the BMS MQTT client
//!
//! A single TOML document carries the runtime flags, the system identity, the
//! hot-reloadable application sections (logging and MQTT) and the runtime
//! tunables. Every field has a default so partial files load cleanly.

pub mod watcher;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

pub use watcher::ConfigWatcher;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// Complete client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub flags: FlagsSection,
    #[serde(default)]
    pub system: SystemSection,
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
}

/// Process-wide flags, normally overridden from the command line
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlagsSection {
    /// Deployment environment (development, testing, production)
    pub environment: String,
    /// Debug mode pins the log level to debug
    pub debug_mode: bool,
}

impl Default for FlagsSection {
    fn default() -> Self {
        Self {
            environment: "production".to_string(),
            debug_mode: false,
        }
    }
}

/// Identity recorded in the status document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SystemSection {
    pub app_name: String,
    pub app_version: String,
    pub build_number: u32,
}

impl Default for SystemSection {
    fn default() -> Self {
        Self {
            app_name: "BMS MQTT Client".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            build_number: 1,
        }
    }
}

impl SystemSection {
    /// Version string as persisted under `app.version`
    pub fn full_version(&self) -> String {
        format!("{}-{}", self.app_version, self.build_number)
    }
}

/// Sections that are watched for live changes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppSection {
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub mqtt: MqttSection,
}

/// Logging section. Only `level` can be applied without a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSection {
    /// One of debug, info, warn, error, dpanic, panic, fatal
    pub level: String,
    /// JSON log file; empty disables file output
    pub file_path: String,
    /// Console format: json, pretty or compact
    pub format: String,
    /// Include timestamps in log lines
    pub add_time: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: "./logs/app.log".to_string(),
            format: "json".to_string(),
            add_time: true,
        }
    }
}

/// Broker connection section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttSection {
    pub broker: String,
    pub port: u16,
    /// Base client identifier; a unique suffix is appended per connection
    pub client_id: String,
    pub topic: String,
    /// Quality-of-service level (0-2)
    pub qos: u8,
    pub clean_session: bool,
    /// Keep-alive interval in seconds
    pub keep_alive: u64,
    pub reconnect_on_failure: bool,
    pub username: String,
    pub password: String,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker: "broker.emqx.io".to_string(),
            port: 1883,
            client_id: "bms-mqtt-client".to_string(),
            topic: "bms".to_string(),
            qos: 0,
            clean_session: true,
            keep_alive: 60,
            reconnect_on_failure: true,
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Runtime paths and timing tunables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeSection {
    /// Temporary directory owned (and removed on exit) by the engine
    pub tmp_dir: PathBuf,
    /// Sentinel file whose existence requests shutdown
    pub stop_file: PathBuf,
    /// Persisted status document
    pub persist_file: PathBuf,
    /// Append-only connect/disconnect log
    pub connections_log: PathBuf,
    /// Delay between connection attempts
    pub retry_interval_secs: u64,
    /// Upper bound applied to `retry_interval_secs`
    pub max_retry_interval_secs: u64,
    /// Pause between tearing down and re-establishing after a config change
    pub reconnect_pause_ms: u64,
    pub stop_poll_interval_ms: u64,
    pub config_poll_interval_ms: u64,
    pub config_debounce_ms: u64,
    /// Upper bound on waiting for ConnAck
    pub connect_timeout_secs: u64,
    /// Grace period granted to in-flight work on disconnect
    pub disconnect_grace_ms: u64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            tmp_dir: PathBuf::from("./tmp"),
            stop_file: PathBuf::from("./tmp/stop_signal"),
            persist_file: PathBuf::from("./persist/persist.json"),
            connections_log: PathBuf::from("./connections/connections.log"),
            retry_interval_secs: 5,
            max_retry_interval_secs: 60,
            reconnect_pause_ms: 1000,
            stop_poll_interval_ms: 1000,
            config_poll_interval_ms: 50,
            config_debounce_ms: 50,
            connect_timeout_secs: 10,
            disconnect_grace_ms: 250,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Config {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load_from_file(path) {
            Err(ConfigError::FileRead(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Write the configuration as TOML, creating the parent directory
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check field ranges the broker would otherwise reject
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mqtt = &self.app.mqtt;
        if mqtt.broker.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "app.mqtt.broker must not be empty".to_string(),
            ));
        }
        if mqtt.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "app.mqtt.port must be greater than 0".to_string(),
            ));
        }
        if mqtt.topic.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "app.mqtt.topic must not be empty".to_string(),
            ));
        }
        if mqtt.qos > 2 {
            return Err(ConfigError::InvalidConfig(format!(
                "app.mqtt.qos must be 0, 1 or 2 (got {})",
                mqtt.qos
            )));
        }
        Ok(())
    }

    /// Apply command-line flag overrides
    pub fn apply_overrides(&mut self, overrides: &FlagOverrides) {
        if let Some(environment) = overrides.environment.as_ref().filter(|e| !e.is_empty()) {
            self.flags.environment = environment.clone();
        }
        if overrides.debug_mode {
            self.flags.debug_mode = true;
        }
    }
}

/// Flags given on the command line; they win over the file on every reload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlagOverrides {
    pub environment: Option<String>,
    pub debug_mode: bool,
}

/// Live configuration shared between the engine and its tasks
///
/// Readers take a deep copy with [`SharedConfig::snapshot`]; nothing holds a
/// reference into the live value across an await point.
#[derive(Debug)]
pub struct SharedConfig {
    path: PathBuf,
    overrides: FlagOverrides,
    live: RwLock<Config>,
}

impl SharedConfig {
    /// Load the file at `path` (defaults if absent) and apply `overrides`
    pub fn load(path: impl Into<PathBuf>, overrides: FlagOverrides) -> Result<Self, ConfigError> {
        let path = path.into();
        let mut config = Config::load_or_default(&path)?;
        config.apply_overrides(&overrides);
        Ok(Self {
            path,
            overrides,
            live: RwLock::new(config),
        })
    }

    /// Wrap an already-built configuration backed by `path`
    pub fn new(path: impl Into<PathBuf>, mut config: Config, overrides: FlagOverrides) -> Self {
        config.apply_overrides(&overrides);
        Self {
            path: path.into(),
            overrides,
            live: RwLock::new(config),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deep copy of the live configuration
    pub fn snapshot(&self) -> Config {
        self.live
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Read a fresh value from disk without installing it
    pub fn reload(&self) -> Result<Config, ConfigError> {
        let mut config = Config::load_from_file(&self.path)?;
        config.apply_overrides(&self.overrides);
        Ok(config)
    }

    /// Install `config` as the live value
    pub fn replace(&self, config: Config) {
        *self
            .live
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = config;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_documented_constants() {
        let config = Config::default();

        assert_eq!(config.app.mqtt.broker, "broker.emqx.io");
        assert_eq!(config.app.mqtt.port, 1883);
        assert_eq!(config.app.mqtt.topic, "bms");
        assert_eq!(config.app.mqtt.qos, 0);
        assert!(config.app.mqtt.reconnect_on_failure);
        assert_eq!(config.runtime.retry_interval_secs, 5);
        assert_eq!(config.runtime.max_retry_interval_secs, 60);
        assert_eq!(config.runtime.reconnect_pause_ms, 1000);
        assert_eq!(config.runtime.stop_poll_interval_ms, 1000);
        assert_eq!(config.runtime.disconnect_grace_ms, 250);
        assert_eq!(config.flags.environment, "production");
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config = Config::from_toml(
            r#"
[app.mqtt]
broker = "test.broker"
topic = "site/1"
"#,
        )
        .unwrap();

        assert_eq!(config.app.mqtt.broker, "test.broker");
        assert_eq!(config.app.mqtt.topic, "site/1");
        assert_eq!(config.app.mqtt.port, 1883);
        assert_eq!(config.app.logging.level, "info");
        assert_eq!(config.runtime, RuntimeSection::default());
    }

    #[test]
    fn test_invalid_qos_rejected() {
        let result = Config::from_toml("[app.mqtt]\nqos = 3\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_empty_broker_rejected() {
        let result = Config::from_toml("[app.mqtt]\nbroker = \"\"\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let result = Config::from_toml("[app.mqtt\nbroker = ");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/app.toml");
        let mut config = Config::default();
        config.app.mqtt.topic = "bms/rack-4".to_string();

        config.save_to_file(&path).unwrap();
        let loaded = Config::load_from_file(&path).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_overrides_survive_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.toml");
        Config::default().save_to_file(&path).unwrap();

        let shared = SharedConfig::load(
            &path,
            FlagOverrides {
                environment: Some("development".to_string()),
                debug_mode: true,
            },
        )
        .unwrap();

        let reloaded = shared.reload().unwrap();
        assert!(reloaded.flags.debug_mode);
        assert_eq!(reloaded.flags.environment, "development");
    }

    #[test]
    fn test_snapshot_is_detached_from_live_value() {
        let shared = SharedConfig::new("unused.toml", Config::default(), FlagOverrides::default());
        let snapshot = shared.snapshot();

        let mut changed = snapshot.clone();
        changed.app.mqtt.broker = "other.broker".to_string();
        shared.replace(changed);

        assert_eq!(snapshot.app.mqtt.broker, "broker.emqx.io");
        assert_eq!(shared.snapshot().app.mqtt.broker, "other.broker");
    }

    #[test]
    fn test_full_version_format() {
        let system = SystemSection {
            app_name: "x".to_string(),
            app_version: "1.2.0".to_string(),
            build_number: 7,
        };
        assert_eq!(system.full_version(), "1.2.0-7");
    }
}
