//! Unified error types for the proxisense core library.
//!
//! [`SensorError`] covers every failure mode that can surface to a caller of
//! the sensor. [`ConfigError`](crate::config::ConfigError) converts into it.
//!
//! Platform trouble never reaches a caller: the orchestrator absorbs
//! [`PlatformError`](crate::platform::PlatformError) and turns it into events
//! or silent drops. What remains here is what a caller can act on.
//!
//! # Example
//!
//! ```rust
//! use proxisense_core::error::{Result, SensorError};
//!
//! fn check_frequency(minutes: f64) -> Result<()> {
//!     if minutes <= 0.0 {
//!         return Err(SensorError::ConfigValidationError(
//!             "frequency_minutes: must be greater than zero".into(),
//!         ));
//!     }
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// The unified error type for all proxisense operations.
#[derive(Debug, Error)]
pub enum SensorError {
    // =========================================================================
    // BLUETOOTH ERRORS
    // =========================================================================
    /// No Bluetooth adapter was found on this system.
    #[error(
        "No Bluetooth adapter found. Ensure Bluetooth hardware is present, then restart the sensor."
    )]
    BluetoothAdapterNotFound,

    // =========================================================================
    // LIFECYCLE ERRORS
    // =========================================================================
    /// The sensor stopped for good because the adapter was absent at start.
    #[error("Sensor is terminated. Create a new sensor once Bluetooth hardware is available.")]
    SensorTerminated,

    /// The orchestrator task is gone and cannot take requests.
    #[error("Sensor task is not running")]
    SensorUnavailable,

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// An error occurred while persisting observations.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// A record could not be serialised.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// A specialized [`Result`] type for proxisense operations.
pub type Result<T> = std::result::Result<T, SensorError>;

/// Short alias for [`SensorError`].
pub type Error = SensorError;

impl SensorError {
    /// Returns `true` if this error is related to Bluetooth operations.
    #[inline]
    #[must_use]
    pub const fn is_bluetooth_error(&self) -> bool {
        matches!(self, Self::BluetoothAdapterNotFound)
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(
            self,
            Self::PersistenceError(_) | Self::IoError(_) | Self::SerializationError(_)
        )
    }

    /// Returns `true` if the sensor cannot continue and must not be retried
    /// automatically.
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BluetoothAdapterNotFound | Self::SensorTerminated | Self::SensorUnavailable
        )
    }

    /// Returns a machine-readable error code.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::BluetoothAdapterNotFound => "BLUETOOTH_ADAPTER_NOT_FOUND",
            Self::SensorTerminated => "SENSOR_TERMINATED",
            Self::SensorUnavailable => "SENSOR_UNAVAILABLE",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::IoError(_) => "IO_ERROR",
            Self::SerializationError(_) => "SERIALIZATION_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for SensorError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::ReadError { path, source } => {
                Self::PersistenceError(format!("Failed to read {}: {}", path.display(), source))
            }
            ConfigError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {}: {}", path.display(), source))
            }
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::NoConfigDir => {
                Self::PersistenceError("Cannot determine config directory".into())
            }
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
