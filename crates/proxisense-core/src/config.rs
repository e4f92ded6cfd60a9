//! Sensor configuration management.
//!
//! Handles loading, saving, and validating proxisense configuration:
//! - Scan cadence and BLE scan window
//! - Label and device id stamped into every observation
//! - Storage location
//! - Logging mode, level, directory and rotation
//!
//! Loading layers an optional TOML file under environment overrides
//! (`PROXISENSE_SENSOR__LABEL=kitchen`, `PROXISENSE_LOGGING__LEVEL=debug`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "PROXISENSE";

/// Default minutes between scan cycles.
pub const DEFAULT_FREQUENCY_MINUTES: f64 = 1.0;

/// Default duration of a BLE scan before it is stopped.
pub const DEFAULT_BLE_SCAN_WINDOW_MS: u64 = 3000;

/// Accepted BLE scan window range in milliseconds.
pub const BLE_SCAN_WINDOW_RANGE_MS: std::ops::RangeInclusive<u64> = 100..=60_000;

/// Longest accepted cycle interval (one week).
pub const MAX_FREQUENCY_MINUTES: f64 = 10_080.0;

/// Longest accepted label.
pub const MAX_LABEL_LENGTH: usize = 256;

static MAC_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").expect("MAC address pattern is valid")
});

/// Returns `true` if `address` looks like `AA:BB:CC:DD:EE:FF` (any case).
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS_RE.is_match(address)
}

/// Errors raised while loading, saving, or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Explicitly requested file does not exist.
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// File exists but could not be read.
    #[error("failed to read {}: {source}", path.display())]
    ReadError {
        /// Path being read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// File could not be written.
    #[error("failed to write {}: {source}", path.display())]
    WriteError {
        /// Path being written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Layered sources could not be merged or deserialised.
    #[error("failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    /// Configuration could not be rendered as TOML.
    #[error("failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// No platform config directory could be determined.
    #[error("cannot determine config directory")]
    NoConfigDir,

    /// A single field holds an invalid value.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields hold invalid values.
    #[error("{} validation errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Complete on-disk configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Scan engine settings, owned by the orchestrator once started.
    pub sensor: SensorConfig,

    /// Where observations are written.
    pub storage: StorageConfig,

    /// Logging mode for the daemon.
    pub logging: LoggingConfig,
}

/// Settings owned by the scan orchestrator.
///
/// Replaced as a whole on every `start`; never patched field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Whether the sensor should run at all.
    pub enabled: bool,

    /// Minutes between the starts of consecutive scan cycles.
    pub frequency_minutes: f64,

    /// How long a BLE scan runs before it is stopped.
    pub ble_scan_window_ms: u64,

    /// Free-text annotation copied into every observation.
    pub label: String,

    /// Identifier of the device owner, copied into every observation.
    pub device_id: String,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            frequency_minutes: DEFAULT_FREQUENCY_MINUTES,
            ble_scan_window_ms: DEFAULT_BLE_SCAN_WINDOW_MS,
            label: String::new(),
            device_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl SensorConfig {
    /// Spacing between scheduler ticks.
    ///
    /// Only meaningful on a validated config.
    #[must_use]
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs_f64(self.frequency_minutes * 60.0)
    }

    /// How long each BLE phase lasts.
    #[must_use]
    pub const fn ble_scan_window(&self) -> Duration {
        Duration::from_millis(self.ble_scan_window_ms)
    }

    /// Validate every field, collecting all failures.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for one bad field or
    /// `MultipleValidationErrors` for several.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if !self.frequency_minutes.is_finite() || self.frequency_minutes <= 0.0 {
            errors.push(invalid(
                "sensor.frequency_minutes",
                format!("must be greater than zero (got {})", self.frequency_minutes),
            ));
        } else if self.frequency_minutes > MAX_FREQUENCY_MINUTES {
            errors.push(invalid(
                "sensor.frequency_minutes",
                format!("must not exceed {MAX_FREQUENCY_MINUTES} (got {})", self.frequency_minutes),
            ));
        }

        if !BLE_SCAN_WINDOW_RANGE_MS.contains(&self.ble_scan_window_ms) {
            errors.push(invalid(
                "sensor.ble_scan_window_ms",
                format!(
                    "must be between {} and {} (got {})",
                    BLE_SCAN_WINDOW_RANGE_MS.start(),
                    BLE_SCAN_WINDOW_RANGE_MS.end(),
                    self.ble_scan_window_ms
                ),
            ));
        }

        if self.device_id.trim().is_empty() {
            errors.push(invalid("sensor.device_id", "must not be empty".into()));
        }

        if self.label.chars().count() > MAX_LABEL_LENGTH {
            errors.push(invalid(
                "sensor.label",
                format!("must be at most {MAX_LABEL_LENGTH} characters"),
            ));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

fn invalid(field: &str, message: String) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        message,
    }
}

/// Storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for observation files. Platform default when unset.
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the data directory, falling back to the platform default.
    ///
    /// # Errors
    ///
    /// Returns `NoConfigDir` when no platform directory can be determined.
    pub fn resolved_data_dir(&self) -> ConfigResult<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => crate::storage::default_data_dir().ok_or(ConfigError::NoConfigDir),
        }
    }
}

/// How often the production log file rolls over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    /// A new file every hour.
    Hourly,
    /// A new file every day.
    #[default]
    Daily,
    /// One file, never rolled.
    Never,
}

/// Logging settings consumed by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// JSON file logging plus compact stdout when true.
    pub production: bool,

    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,

    /// Directory for production log files. Platform default when unset.
    pub directory: Option<PathBuf>,

    /// Log file rollover.
    pub rotation: LogRotation,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            production: false,
            level: "info".to_string(),
            directory: None,
            rotation: LogRotation::Daily,
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus environment overrides.
    ///
    /// A missing file is not an error; defaults fill every absent field.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the result is invalid.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let built = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = built.try_deserialize()?;
        config.sensor.validate()?;
        Ok(config)
    }

    /// Load configuration, writing defaults to `path` when no file exists yet.
    ///
    /// Persisting the first load keeps the generated device id stable across
    /// restarts.
    ///
    /// # Errors
    ///
    /// Returns an error if loading fails or the initial file cannot be written.
    pub fn load_or_init(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let existed = path.exists();
        let config = Self::load(path)?;
        if !existed {
            config.save(path)?;
            tracing::info!(path = %path.display(), "wrote initial configuration");
        }
        Ok(config)
    }

    /// Load configuration from a file that must exist.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the file is missing.
    pub fn load_existing(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Self::load(path)
    }

    /// Save configuration as pretty TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Get the default configuration file path.
    ///
    /// # Errors
    ///
    /// Returns `NoConfigDir` when no platform directory can be determined.
    pub fn default_path() -> ConfigResult<PathBuf> {
        // On Linux hosts: /etc/proxisense/config.toml
        // Elsewhere: the platform config dir
        #[cfg(target_os = "linux")]
        {
            Ok(PathBuf::from("/etc/proxisense/config.toml"))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let dirs = directories::ProjectDirs::from("", "", "proxisense")
                .ok_or(ConfigError::NoConfigDir)?;
            Ok(dirs.config_dir().join("config.toml"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SensorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ble_scan_window(), Duration::from_millis(3000));
        assert_eq!(config.scan_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_fractional_frequency() {
        let config = SensorConfig {
            frequency_minutes: 0.5,
            ..SensorConfig::default()
        };
        assert_eq!(config.scan_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_non_positive_frequency_rejected() {
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let config = SensorConfig {
                frequency_minutes: bad,
                ..SensorConfig::default()
            };
            let err = config.validate().unwrap_err();
            assert!(
                matches!(
                    &err,
                    ConfigError::ValidationError { field, .. }
                        if field == "sensor.frequency_minutes"
                ),
                "unexpected error for {bad}: {err}"
            );
        }
    }

    #[test]
    fn test_multiple_errors_collected() {
        let config = SensorConfig {
            frequency_minutes: 0.0,
            ble_scan_window_ms: 5,
            device_id: "  ".into(),
            ..SensorConfig::default()
        };
        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_mac_address_validation() {
        assert!(is_valid_mac_address("AA:BB:CC:DD:EE:FF"));
        assert!(is_valid_mac_address("a0:b1:c2:d3:e4:f5"));
        assert!(!is_valid_mac_address("AA:BB"));
        assert!(!is_valid_mac_address("AA-BB-CC-DD-EE-FF"));
        assert!(!is_valid_mac_address(""));
        assert!(!is_valid_mac_address("GG:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.sensor.label = "office".into();
        config.sensor.frequency_minutes = 2.5;
        config.storage.data_dir = Some(dir.path().join("data"));
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_logging_section_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[logging]\nproduction = true\ndirectory = \"/srv/logs\"\nrotation = \"hourly\"\n",
        )
        .unwrap();

        let logging = Config::load(&path).unwrap().logging;
        assert!(logging.production);
        assert_eq!(logging.directory, Some(PathBuf::from("/srv/logs")));
        assert_eq!(logging.rotation, LogRotation::Hourly);
        assert_eq!(logging.level, "info");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Config::load(dir.path().join("absent.toml")).unwrap();
        assert!(loaded.sensor.enabled);
        assert_eq!(loaded.sensor.ble_scan_window_ms, DEFAULT_BLE_SCAN_WINDOW_MS);
        assert!(!loaded.sensor.device_id.is_empty());
    }

    #[test]
    fn test_load_or_init_keeps_device_id_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let first = Config::load_or_init(&path).unwrap();
        assert!(path.exists());
        let second = Config::load_or_init(&path).unwrap();
        assert_eq!(first.sensor.device_id, second.sensor.device_id);
    }

    #[test]
    fn test_load_existing_requires_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_existing(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sensor]\nfrequency_minutes = -3.0\n").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn test_resolved_data_dir_prefers_explicit() {
        let storage = StorageConfig {
            data_dir: Some(PathBuf::from("/tmp/proxisense-test")),
        };
        assert_eq!(
            storage.resolved_data_dir().unwrap(),
            PathBuf::from("/tmp/proxisense-test")
        );
    }
}
